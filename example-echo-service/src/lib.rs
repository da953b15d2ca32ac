//! Shared echo service used by the integration tests of the bridge
//! transports. The stubs in [`pb`] are written out by hand so no protoc
//! toolchain is needed to build the workspace.

pub mod pb;
mod service;

pub use service::EchoService;

/// Full method paths of the echo service, paired with whether the method
/// uses client streaming. The downgrading handler derives its gRPC-Web
/// allowlist from tables like this one.
pub const ECHO_METHODS: &[(&str, bool)] = &[
    ("/grpc.examples.echo.Echo/UnaryEcho", false),
    ("/grpc.examples.echo.Echo/ServerStreamingEcho", false),
    ("/grpc.examples.echo.Echo/ClientStreamingEcho", true),
    ("/grpc.examples.echo.Echo/BidirectionalStreamingEcho", true),
];
