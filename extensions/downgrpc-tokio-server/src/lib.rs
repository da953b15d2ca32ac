//! Server-side downgrading handler.
//!
//! Wraps a tonic gRPC router so a single port can serve native gRPC
//! (HTTP/2 with trailers), gRPC-Web (trailers re-encoded into the body for
//! HTTP/1.1 peers), gRPC-WebSocket (full duplex over one upgraded
//! connection), and arbitrary non-gRPC HTTP traffic via a fallback service.

mod handler;
mod websocket;

pub use handler::{DowngradingHandler, DowngradingHandlerBuilder, MethodKind};
