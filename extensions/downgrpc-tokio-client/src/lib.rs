//! Client-side in-process proxy.
//!
//! A tonic [`Channel`](tonic::transport::Channel) obtained from this crate
//! dials an in-process HTTP/2 endpoint instead of the network. Each RPC is
//! re-encoded onto the wire either as a plain HTTP/1.1 request whose
//! response comes back as gRPC-Web (trailers recovered from the terminal
//! body frame), or as a gRPC-WebSocket stream (full duplex over one
//! upgraded connection). The local gRPC client sees ordinary HTTP/2 gRPC
//! either way.

mod connector;
mod error;
mod options;
mod pipe;
mod proxy;
mod proxy_env;
mod side_channel;
mod ws_proxy;

pub use error::ClientError;
pub use options::ConnectOptions;
pub use proxy::connect_via_proxy;
pub use side_channel::{SideChannelAuthInfo, SideChannelTls};
pub use ws_proxy::connect_via_ws_proxy;
