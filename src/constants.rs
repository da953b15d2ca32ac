// gRPC wire-level constants shared by every transcoding path.

/// Length of the gRPC length-prefixed message header: one flags byte followed
/// by a big-endian u32 payload length.
pub const MESSAGE_HEADER_LEN: usize = 5;

/// MSB of the flags byte distinguishes metadata (trailer) frames from data
/// frames. gRPC proper never sets it on a data frame, which is what lets
/// gRPC-Web (and this crate) repurpose it.
pub const METADATA_MASK: u8 = 1 << 7;

/// LSB of the flags byte marks the payload as compressed.
pub const COMPRESSION_MASK: u8 = 1;

/// A metadata frame with an empty payload, used as the end-of-stream sentinel
/// on the client-to-server WebSocket direction.
pub const END_OF_STREAM_HEADER: [u8; MESSAGE_HEADER_LEN] = [METADATA_MASK, 0, 0, 0, 0];

/// Per-message read limit applied on both ends of a gRPC-WebSocket stream.
pub const MAX_WS_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// WebSocket subprotocol under which gRPC streams are relayed.
pub const GRPC_WS_PROTOCOL: &str = "grpc-ws";
