mod frame;
mod frame_codec;
mod frame_error;
mod frame_flags;

pub use frame::{
    is_compressed, is_data_frame, is_end_of_stream, is_metadata_frame, make_message_header,
    parse_message_header, validate_frame, GrpcFrame,
};
pub use frame_codec::FrameCodec;
pub use frame_error::FrameDecodeError;
pub use frame_flags::MessageFlags;
