mod defs;
mod response_reader;
mod response_writer;

pub use defs::{
    grpc_to_web_content_type, is_grpc_content_type, is_grpc_web_content_type, split_content_type,
    web_to_grpc_content_type, CONTENT_TYPE_GRPC, CONTENT_TYPE_GRPC_WEB,
};
pub use response_reader::{ResponseReader, WebResponseError};
pub use response_writer::{transcode_response, WebResponseBody};
