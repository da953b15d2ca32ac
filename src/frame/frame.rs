use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    constants::{END_OF_STREAM_HEADER, MESSAGE_HEADER_LEN},
    frame::{FrameDecodeError, MessageFlags},
};

/// A single length-prefixed gRPC message frame.
///
/// The payload is held separately from the header; [`GrpcFrame::into_bytes`]
/// re-emits the exact 5+N byte wire encoding, so frames can be forwarded
/// verbatim without the payload ever being copied out of its buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrpcFrame {
    pub flags: MessageFlags,
    pub payload: Bytes,
}

impl GrpcFrame {
    pub fn data(payload: Bytes) -> Self {
        GrpcFrame {
            flags: MessageFlags::DATA,
            payload,
        }
    }

    pub fn metadata(payload: Bytes) -> Self {
        GrpcFrame {
            flags: MessageFlags::METADATA,
            payload,
        }
    }

    pub fn is_data(&self) -> bool {
        !self.flags.is_metadata()
    }

    pub fn is_metadata(&self) -> bool {
        self.flags.is_metadata()
    }

    pub fn is_compressed(&self) -> bool {
        self.flags.is_compressed()
    }

    /// True iff this frame re-encodes to exactly the end-of-stream sentinel.
    pub fn is_end_of_stream(&self) -> bool {
        self.flags.0 == END_OF_STREAM_HEADER[0] && self.payload.is_empty()
    }

    /// The wire length of the frame, header included.
    pub fn encoded_len(&self) -> usize {
        MESSAGE_HEADER_LEN + self.payload.len()
    }

    /// Re-emits the full length-prefixed encoding of the frame.
    pub fn into_bytes(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&make_message_header(self.flags, self.payload.len() as u32));
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Parses a 5-byte gRPC message header into its flags and declared payload
/// length. Anything other than exactly 5 bytes is an error.
pub fn parse_message_header(header: &[u8]) -> Result<(MessageFlags, u32), FrameDecodeError> {
    if header.len() != MESSAGE_HEADER_LEN {
        return Err(FrameDecodeError::BadHeaderLength(header.len()));
    }
    let length = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    Ok((MessageFlags(header[0]), length))
}

/// Builds a 5-byte gRPC message header from flags and payload length.
pub fn make_message_header(flags: MessageFlags, length: u32) -> [u8; MESSAGE_HEADER_LEN] {
    let len = length.to_be_bytes();
    [flags.0, len[0], len[1], len[2], len[3]]
}

/// True if the message is a gRPC data frame (metadata bit unset).
pub fn is_data_frame(msg: &[u8]) -> bool {
    !is_metadata_frame(msg)
}

/// True if the message is a gRPC metadata frame (metadata bit set).
pub fn is_metadata_frame(msg: &[u8]) -> bool {
    msg.first()
        .map(|b| MessageFlags(*b).is_metadata())
        .unwrap_or(false)
}

/// True if the message header sets the compression flag.
pub fn is_compressed(msg: &[u8]) -> bool {
    msg.first()
        .map(|b| MessageFlags(*b).is_compressed())
        .unwrap_or(false)
}

/// True iff the message is exactly the end-of-stream sentinel header.
pub fn is_end_of_stream(msg: &[u8]) -> bool {
    msg == END_OF_STREAM_HEADER
}

/// Ensures the message is a well-formed gRPC frame: a complete header and a
/// payload whose length matches the declared length.
pub fn validate_frame(msg: &[u8]) -> Result<(), FrameDecodeError> {
    if msg.len() < MESSAGE_HEADER_LEN {
        return Err(FrameDecodeError::TooShort(msg.len()));
    }
    let (_, declared) = parse_message_header(&msg[..MESSAGE_HEADER_LEN])?;
    let actual = msg.len() - MESSAGE_HEADER_LEN;
    if actual != declared as usize {
        return Err(FrameDecodeError::LengthMismatch {
            declared: declared as usize,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{COMPRESSION_MASK, METADATA_MASK};

    #[test]
    fn header_roundtrip() {
        for flags in [0u8, METADATA_MASK, COMPRESSION_MASK, 0x42, 0xff] {
            for len in [0u32, 1, 0x1234, u32::MAX] {
                let hdr = make_message_header(MessageFlags(flags), len);
                let (parsed_flags, parsed_len) = parse_message_header(&hdr).unwrap();
                assert_eq!(parsed_flags, MessageFlags(flags));
                assert_eq!(parsed_len, len);
            }
        }
    }

    #[test]
    fn header_requires_exactly_five_bytes() {
        assert!(parse_message_header(&[0; 4]).is_err());
        assert!(parse_message_header(&[0; 6]).is_err());
    }

    #[test]
    fn length_is_big_endian() {
        let hdr = make_message_header(MessageFlags::DATA, 1);
        assert_eq!(hdr, [0, 0, 0, 0, 1]);
    }

    #[test]
    fn validate_accepts_well_formed_frames() {
        let mut msg = make_message_header(MessageFlags::DATA, 3).to_vec();
        msg.extend_from_slice(b"abc");
        assert!(validate_frame(&msg).is_ok());
    }

    #[test]
    fn validate_rejects_length_mismatch() {
        let mut msg = make_message_header(MessageFlags::DATA, 4).to_vec();
        msg.extend_from_slice(b"abc");
        assert!(matches!(
            validate_frame(&msg),
            Err(FrameDecodeError::LengthMismatch {
                declared: 4,
                actual: 3
            })
        ));
    }

    #[test]
    fn validate_rejects_short_messages() {
        assert!(validate_frame(&[0x80, 0, 0]).is_err());
    }

    #[test]
    fn end_of_stream_sentinel() {
        assert!(is_end_of_stream(&[0x80, 0, 0, 0, 0]));
        // A nonempty metadata frame is not the sentinel.
        assert!(!is_end_of_stream(&[0x80, 0, 0, 0, 1]));
        // Neither is a zero-length data frame.
        assert!(!is_end_of_stream(&[0, 0, 0, 0, 0]));
    }

    #[test]
    fn frame_classification() {
        assert!(is_data_frame(&[0x00]));
        assert!(is_metadata_frame(&[0x80]));
        assert!(is_compressed(&[0x01]));
        assert!(!is_compressed(&[0x80]));
    }

    #[test]
    fn into_bytes_reencodes_verbatim() {
        let frame = GrpcFrame {
            flags: MessageFlags(0x81),
            payload: Bytes::from_static(b"hello"),
        };
        assert_eq!(
            frame.into_bytes().as_ref(),
            &[0x81, 0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o']
        );
    }
}
