use crate::constants::{COMPRESSION_MASK, METADATA_MASK};

/// The flags byte of a gRPC message header.
///
/// Bit 7 marks the frame as metadata (a trailer block, or the end-of-stream
/// sentinel), bit 0 marks the payload as compressed. The remaining bits are
/// reserved by the protocol and carried through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageFlags(pub u8);

impl MessageFlags {
    /// Flags of a plain, uncompressed data frame.
    pub const DATA: MessageFlags = MessageFlags(0);

    /// Flags with the metadata bit set.
    pub const METADATA: MessageFlags = MessageFlags(METADATA_MASK);

    pub fn is_metadata(self) -> bool {
        self.0 & METADATA_MASK != 0
    }

    pub fn is_compressed(self) -> bool {
        self.0 & COMPRESSION_MASK != 0
    }
}

impl From<MessageFlags> for u8 {
    fn from(flags: MessageFlags) -> u8 {
        flags.0
    }
}

impl From<u8> for MessageFlags {
    fn from(raw: u8) -> MessageFlags {
        MessageFlags(raw)
    }
}
