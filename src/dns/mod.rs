// DNS wire codec for the tunnel responder
//
// Parses the first question out of an incoming query and builds
// TXT-only responses that echo that question back.

pub mod protocol;

pub use protocol::{serialize_response, DnsQuery, MAX_TXT_LEN, QCLASS_IN, QTYPE_A, QTYPE_TXT};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DnsError {
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("TXT answer too long: {0} bytes (max: {1})")]
    AnswerTooLong(usize, usize),
}

pub type Result<T> = std::result::Result<T, DnsError>;
