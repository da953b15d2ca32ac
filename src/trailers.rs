//! Codec for the MIME-style header block carried in gRPC metadata frames.
//!
//! A trailer block is one `name: value` line per entry, each terminated by
//! CR-LF. gRPC-Web appends such a block as the terminal body frame; the
//! WebSocket bridge uses the same encoding for both its initial-header and
//! trailer metadata frames.

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::frame::{make_message_header, MessageFlags};

/// Errors produced while parsing a metadata frame payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrailerParseError {
    #[error("header line has no colon: {0:?}")]
    MissingColon(String),

    #[error("invalid header name: {0:?}")]
    InvalidName(String),

    #[error("invalid header value for {0:?}")]
    InvalidValue(String),
}

/// Encodes a header map as a CR-LF separated MIME block, preserving entry
/// order.
pub fn encode_trailers(headers: &HeaderMap) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);
    for (name, value) in headers.iter() {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.freeze()
}

/// Wraps an encoded trailer block into a complete metadata frame.
pub fn make_trailer_frame(headers: &HeaderMap) -> Bytes {
    let block = encode_trailers(headers);
    let mut buf = BytesMut::with_capacity(crate::constants::MESSAGE_HEADER_LEN + block.len());
    buf.put_slice(&make_message_header(
        MessageFlags::METADATA,
        block.len() as u32,
    ));
    buf.put_slice(&block);
    buf.freeze()
}

/// Parses a metadata frame payload into a header map.
///
/// Lines are split on CR-LF; a trailing empty line is tolerated. Each line is
/// split at the first colon, and optional whitespace after the colon is
/// trimmed.
pub fn parse_trailers(block: &[u8]) -> Result<HeaderMap, TrailerParseError> {
    let mut headers = HeaderMap::new();
    for line in block.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| TrailerParseError::MissingColon(String::from_utf8_lossy(line).into()))?;
        let (name, rest) = line.split_at(colon);
        let value = trim_ascii_start(&rest[1..]);

        let name = HeaderName::from_bytes(name)
            .map_err(|_| TrailerParseError::InvalidName(String::from_utf8_lossy(name).into()))?;
        let value = HeaderValue::from_bytes(value)
            .map_err(|_| TrailerParseError::InvalidValue(name.as_str().to_owned()))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn trim_ascii_start(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if *first == b' ' || *first == b'\t' {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}
