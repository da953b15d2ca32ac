//! Protocol-translation primitives for carrying gRPC across network paths
//! that cannot speak HTTP/2 end to end.
//!
//! gRPC requires HTTP trailers, which HTTP/1.1 intermediaries routinely
//! strip. This crate holds the transport-independent core of a bridge around
//! that limitation: the length-prefixed gRPC frame codec, the MIME trailer
//! block codec, and the gRPC-Web response transcoding bodies (trailers
//! re-encoded as the terminal body frame, and recovered again on the far
//! side).
//!
//! The tokio transports that put these pieces on the wire live in the
//! `downgrpc-tokio-client` and `downgrpc-tokio-server` extension crates.

pub mod constants;
pub mod frame;
pub mod grpcweb;
pub mod trailers;

/// Boxed error type used at body and transport seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
