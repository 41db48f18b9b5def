//! Payload encodings carried inside DNS names and TXT strings
//!
//! Inbound data arrives as unpadded base32 spread over labels; outbound data
//! leaves as base64 cut into TXT-sized chunks.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use data_encoding::{BASE32, BASE32_NOPAD};
use thiserror::Error;

/// Default chunk size for outbound TXT strings
pub const DEFAULT_CHUNK_LEN: usize = 255;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FragmentError {
    #[error("Malformed fragment: {0}")]
    MalformedFragment(String),
}

/// Decode base32 that was sent without `=` padding.
///
/// The padding is restored from the length remainder modulo 8; remainders
/// 1, 3 and 6 cannot come out of a base32 encoder.
pub fn decode_base32_fixed(text: &str) -> Result<Vec<u8>, FragmentError> {
    let padding = match text.len() % 8 {
        0 => "",
        2 => "======",
        4 => "====",
        5 => "===",
        7 => "=",
        other => {
            return Err(FragmentError::MalformedFragment(format!(
                "base32 length {} leaves invalid remainder {}",
                text.len(),
                other
            )))
        }
    };

    let mut padded = text.to_ascii_uppercase();
    padded.push_str(padding);

    BASE32
        .decode(padded.as_bytes())
        .map_err(|e| FragmentError::MalformedFragment(e.to_string()))
}

/// Unpadded lowercase base32, the form agents put into labels
pub fn encode_base32_unpadded(data: &[u8]) -> String {
    BASE32_NOPAD.encode(data).to_ascii_lowercase()
}

pub fn encode_base64(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Split text into consecutive slices of at most `max_len` bytes.
///
/// Slices never split a character; empty input yields no slices.
pub fn chunk(text: &str, max_len: usize) -> Vec<&str> {
    let max_len = max_len.max(1);
    let mut out = Vec::with_capacity(text.len().div_ceil(max_len));
    let mut rest = text;

    while !rest.is_empty() {
        let mut end = max_len.min(rest.len());
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = rest.chars().next().map(char::len_utf8).unwrap_or(rest.len());
        }
        let (head, tail) = rest.split_at(end);
        out.push(head);
        rest = tail;
    }

    out
}

/// Number of chunks `chunk(text, max_len)` would produce for ASCII text
pub fn chunk_count(text: &str, max_len: usize) -> usize {
    text.len().div_ceil(max_len.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base32_roundtrip_all_remainders() {
        for len in 0..=40usize {
            let data: Vec<u8> = (0..len).map(|i| (i * 37 + 11) as u8).collect();
            let encoded = encode_base32_unpadded(&data);
            assert!(!encoded.contains('='));
            assert_eq!(decode_base32_fixed(&encoded).unwrap(), data, "length {}", len);
        }
    }

    #[test]
    fn test_base32_is_case_insensitive() {
        assert_eq!(decode_base32_fixed("MZXW6").unwrap(), b"foo");
        assert_eq!(decode_base32_fixed("mzxw6").unwrap(), b"foo");
        assert_eq!(decode_base32_fixed("MzXw6YtBoI").unwrap(), b"foobar");
    }

    #[test]
    fn test_base32_invalid_remainders() {
        for bad in ["a", "abc", "abcdef", "abcdefghi"] {
            assert!(
                matches!(
                    decode_base32_fixed(bad),
                    Err(FragmentError::MalformedFragment(_))
                ),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_base32_rejects_foreign_alphabet() {
        assert!(decode_base32_fixed("mzxw1").is_err());
    }

    #[test]
    fn test_base32_empty() {
        assert_eq!(decode_base32_fixed("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_base64_encoding() {
        assert_eq!(encode_base64(b"hello"), "aGVsbG8=");
        assert_eq!(encode_base64(&[]), "");
    }

    #[test]
    fn test_chunk_concat_restores_text() {
        for len in [0usize, 1, 254, 255, 256, 509, 510, 511, 1000] {
            let text: String = (0..len).map(|i| (b'a' + (i % 26) as u8) as char).collect();
            let chunks = chunk(&text, DEFAULT_CHUNK_LEN);

            assert_eq!(chunks.concat(), text);
            assert_eq!(chunks.len(), chunk_count(&text, DEFAULT_CHUNK_LEN));
            assert!(chunks.iter().all(|c| c.len() <= DEFAULT_CHUNK_LEN));
            if let Some((last, full)) = chunks.split_last() {
                assert!(full.iter().all(|c| c.len() == DEFAULT_CHUNK_LEN));
                assert!(!last.is_empty());
            }
        }
    }

    #[test]
    fn test_chunk_empty_yields_nothing() {
        assert!(chunk("", 255).is_empty());
        assert_eq!(chunk_count("", 255), 0);
    }

    #[test]
    fn test_chunk_exact_multiple() {
        let text = "x".repeat(510);
        let chunks = chunk(&text, 255);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].len(), 255);
    }
}
