/// Errors surfaced while setting up a bridged gRPC channel.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS handshake with {endpoint}: {source}")]
    Tls {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("CONNECT to proxy {proxy} failed: {reason}")]
    ProxyConnect { proxy: String, reason: String },

    #[error("establishing gRPC channel: {0}")]
    Channel(#[from] tonic::transport::Error),
}

impl ClientError {
    pub(crate) fn invalid_endpoint(endpoint: &str, reason: impl Into<String>) -> Self {
        ClientError::InvalidEndpoint {
            endpoint: endpoint.to_owned(),
            reason: reason.into(),
        }
    }
}
