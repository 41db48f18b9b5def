// Minimal DNS protocol implementation for the tunnel responder
//
// Implements just enough of RFC 1035 to:
// - Read the first question of a query
// - Answer it with TXT records pointing back at that question
// - Build single-question queries (agent side, tests)

use super::{DnsError, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::io::Cursor;

/// Fixed DNS header length
pub const HEADER_LEN: usize = 12;

/// Longest string a single TXT character-string can carry
pub const MAX_TXT_LEN: usize = 255;

pub const QTYPE_A: u16 = 1;
pub const QTYPE_TXT: u16 = 16;
pub const QCLASS_IN: u16 = 1;

/// Response + authoritative answer, no error
const RESPONSE_FLAGS: [u8; 2] = [0b1000_0100, 0b0000_0000];

/// Standard query, recursion desired
const QUERY_FLAGS: u16 = 0x0100;

/// Pointer to the question name right after the header
const QUESTION_POINTER: [u8; 2] = [0xc0, 0x0c];

/// The one question of an incoming datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub transaction_id: u16,
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl DnsQuery {
    pub fn new(transaction_id: u16, name: impl Into<String>, qtype: u16, qclass: u16) -> Self {
        Self {
            transaction_id,
            name: name.into(),
            qtype,
            qclass,
        }
    }

    /// Parse the header and the first question of a raw query.
    ///
    /// Any further questions are ignored. The name must consist solely of
    /// `[A-Za-z0-9.-_]`, so binary garbage is never echoed back.
    pub fn parse(datagram: &[u8]) -> Result<Self> {
        let mut buf = Cursor::new(datagram);

        if buf.remaining() < HEADER_LEN {
            return Err(DnsError::MalformedPacket("Header too short".into()));
        }

        let transaction_id = buf.get_u16();
        let _flags = buf.get_u16();
        let qdcount = buf.get_u16();
        let _ancount = buf.get_u16();
        let _nscount = buf.get_u16();
        let _arcount = buf.get_u16();

        if qdcount == 0 {
            return Err(DnsError::MalformedPacket("No question".into()));
        }

        let name = read_question_name(&mut buf)?;
        if !is_valid_name(&name) {
            return Err(DnsError::MalformedPacket(format!(
                "Invalid characters in name '{}'",
                name.escape_default()
            )));
        }

        if buf.remaining() < 4 {
            return Err(DnsError::MalformedPacket("Question too short".into()));
        }
        let qtype = buf.get_u16();
        let qclass = buf.get_u16();

        Ok(Self {
            transaction_id,
            name,
            qtype,
            qclass,
        })
    }

    /// Build a standard single-question query for this name
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.name.len() + 6);
        buf.put_u16(self.transaction_id);
        buf.put_u16(QUERY_FLAGS);
        buf.put_u16(1);
        buf.put_u16(0);
        buf.put_u16(0);
        buf.put_u16(0);
        write_question(&mut buf, &self.name, self.qtype, self.qclass);
        buf.to_vec()
    }

    /// Answer this query with one TXT record per item
    pub fn respond(&self, answers: &[String]) -> Result<Vec<u8>> {
        serialize_response(
            self.transaction_id,
            &self.name,
            self.qtype,
            self.qclass,
            answers,
        )
    }
}

/// Serialize a TXT response to the given question.
///
/// Answers always use the `0xC00C` name pointer, which is valid because
/// exactly one question precedes them. Records are TXT/IN with TTL 0
/// regardless of the requested qtype.
pub fn serialize_response(
    transaction_id: u16,
    question_name: &str,
    qtype: u16,
    qclass: u16,
    answers: &[String],
) -> Result<Vec<u8>> {
    if let Some(long) = answers.iter().find(|a| a.len() > MAX_TXT_LEN) {
        return Err(DnsError::AnswerTooLong(long.len(), MAX_TXT_LEN));
    }

    let body: usize = answers.iter().map(|a| 13 + a.len()).sum();
    let mut buf = BytesMut::with_capacity(HEADER_LEN + question_name.len() + 6 + body);

    buf.put_u16(transaction_id);
    buf.put_slice(&RESPONSE_FLAGS);
    buf.put_u16(1);
    buf.put_u16(answers.len() as u16);
    buf.put_u16(0);
    buf.put_u16(0);

    write_question(&mut buf, question_name, qtype, qclass);

    for text in answers {
        buf.put_slice(&QUESTION_POINTER);
        buf.put_u16(QTYPE_TXT);
        buf.put_u16(QCLASS_IN);
        buf.put_u32(0);
        buf.put_u16(text.len() as u16 + 1);
        buf.put_u8(text.len() as u8);
        buf.put_slice(text.as_bytes());
    }

    Ok(buf.to_vec())
}

/// Read an uncompressed name from the question section
fn read_question_name(buf: &mut Cursor<&[u8]>) -> Result<String> {
    let mut name = String::new();

    loop {
        if !buf.has_remaining() {
            return Err(DnsError::MalformedPacket("Truncated domain name".into()));
        }

        let len = buf.get_u8() as usize;
        if len == 0 {
            break;
        }

        // Pointers and the reserved 0x40/0x80 label types never belong in a question
        if len & 0xC0 != 0 {
            return Err(DnsError::MalformedPacket(format!(
                "Unsupported label type 0x{:02x}",
                len
            )));
        }

        if buf.remaining() < len {
            return Err(DnsError::MalformedPacket(format!(
                "Label claims {} bytes but only {} remain",
                len,
                buf.remaining()
            )));
        }

        if !name.is_empty() {
            name.push('.');
        }
        let start = buf.position() as usize;
        let label = &buf.get_ref()[start..start + len];
        // The name is re-split on dots when echoed back
        if label.contains(&b'.') {
            return Err(DnsError::MalformedPacket(
                "Label contains a '.' byte".into(),
            ));
        }
        name.extend(label.iter().map(|&b| b as char));
        buf.advance(len);
    }

    Ok(name)
}

fn write_question(buf: &mut BytesMut, name: &str, qtype: u16, qclass: u16) {
    for part in name.split('.').filter(|p| !p.is_empty()) {
        buf.put_u8(part.len() as u8);
        buf.put_slice(part.as_bytes());
    }
    buf.put_u8(0);
    buf.put_u16(qtype);
    buf.put_u16(qclass);
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}
