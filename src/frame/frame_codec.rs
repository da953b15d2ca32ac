use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    constants::MESSAGE_HEADER_LEN,
    frame::{parse_message_header, FrameDecodeError, GrpcFrame},
};

/// Splits a byte stream into whole length-prefixed gRPC frames.
///
/// This is the shared "frame copier" of every relay direction: chunks are fed
/// into the accumulation buffer in whatever sizes the transport produced
/// them, and complete frames come out one at a time. End-of-input handling
/// distinguishes a clean boundary (empty buffer) from a truncated frame.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        FrameCodec
    }
}

impl Decoder for FrameCodec {
    type Item = GrpcFrame;
    type Error = FrameDecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<GrpcFrame>, FrameDecodeError> {
        if src.len() < MESSAGE_HEADER_LEN {
            return Ok(None);
        }
        let (flags, length) = parse_message_header(&src[..MESSAGE_HEADER_LEN])?;
        let total = MESSAGE_HEADER_LEN + length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        frame.advance(MESSAGE_HEADER_LEN);
        Ok(Some(GrpcFrame {
            flags,
            payload: frame.freeze(),
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<GrpcFrame>, FrameDecodeError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameDecodeError::UnexpectedEof(src.len())),
        }
    }
}

impl Encoder<GrpcFrame> for FrameCodec {
    type Error = FrameDecodeError;

    fn encode(&mut self, frame: GrpcFrame, dst: &mut BytesMut) -> Result<(), FrameDecodeError> {
        dst.reserve(frame.encoded_len());
        dst.put(frame.into_bytes());
        Ok(())
    }
}
