/// Errors produced while parsing or validating gRPC message frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("gRPC message header must be 5 bytes, but got {0}")]
    BadHeaderLength(usize),

    #[error("message length {0} is less than the length of the header")]
    TooShort(usize),

    #[error("declared message length ({declared}) does not equal actual message length ({actual})")]
    LengthMismatch { declared: usize, actual: usize },

    /// The byte stream ended in the middle of a frame. Carries the number of
    /// bytes that had already been buffered.
    #[error("stream ended with an incomplete gRPC frame ({0} bytes buffered)")]
    UnexpectedEof(usize),

    #[error("i/o error while reading gRPC frames: {0}")]
    Io(String),
}

impl From<std::io::Error> for FrameDecodeError {
    fn from(err: std::io::Error) -> Self {
        FrameDecodeError::Io(err.to_string())
    }
}
