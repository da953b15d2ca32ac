//! Side-channel TLS credentials.
//!
//! The in-process connection the gRPC client actually dials is plaintext,
//! but the channel is configured against a TLS-protected remote endpoint.
//! This adapter performs one real TLS handshake to that endpoint out of
//! band (through the environment's `CONNECT` proxy when one applies),
//! caches the resulting authentication state, and leaves the in-process
//! connection untouched. Certificate problems therefore surface before the
//! first RPC, and the negotiated ALPN is available to the transport.

use std::sync::Arc;

use rustls::ClientConfig;
use rustls_pki_types::{CertificateDer, ServerName};
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::{connector::parse_endpoint, error::ClientError, proxy_env};

/// Authentication state captured from the out-of-band handshake.
#[derive(Debug, Clone)]
pub struct SideChannelAuthInfo {
    /// ALPN protocol the real endpoint negotiated, if any.
    pub alpn_protocol: Option<Vec<u8>>,
    /// The peer's certificate chain, leaf first.
    pub peer_certificates: Vec<CertificateDer<'static>>,
    /// Server name the handshake was verified against.
    pub server_name: String,
}

/// Performs and caches the out-of-band TLS handshake; the handshake runs at
/// most once per adapter.
pub struct SideChannelTls {
    host: String,
    port: u16,
    server_name: ServerName<'static>,
    config: Arc<ClientConfig>,
    auth: Mutex<Option<SideChannelAuthInfo>>,
}

impl SideChannelTls {
    pub fn new(endpoint: &str, config: Arc<ClientConfig>) -> Result<Self, ClientError> {
        let (host, port) = parse_endpoint(endpoint, 443)?;
        let server_name = ServerName::try_from(host.clone()).map_err(|err| {
            ClientError::invalid_endpoint(endpoint, format!("not a valid server name: {err}"))
        })?;
        Ok(SideChannelTls {
            host,
            port,
            server_name,
            config,
            auth: Mutex::new(None),
        })
    }

    /// Returns the cached authentication info, handshaking first if this is
    /// the initial call.
    pub async fn handshake(&self) -> Result<SideChannelAuthInfo, ClientError> {
        let mut cached = self.auth.lock().await;
        if let Some(info) = &*cached {
            return Ok(info.clone());
        }

        let proxy = proxy_env::proxy_from_env(true, &self.host);
        let tcp = proxy_env::dial(&self.host, self.port, proxy.as_ref()).await?;

        let connector = TlsConnector::from(self.config.clone());
        let stream = connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|err| ClientError::Tls {
                endpoint: format!("{}:{}", self.host, self.port),
                source: err,
            })?;

        let (_, connection) = stream.get_ref();
        let info = SideChannelAuthInfo {
            alpn_protocol: connection.alpn_protocol().map(|alpn| alpn.to_vec()),
            peer_certificates: connection
                .peer_certificates()
                .map(|certs| certs.iter().map(|cert| cert.clone().into_owned()).collect())
                .unwrap_or_default(),
            server_name: self.host.clone(),
        };
        debug!(
            "side-channel handshake with {}:{} complete (alpn: {:?})",
            self.host, self.port, info.alpn_protocol
        );

        *cached = Some(info.clone());
        Ok(info)
    }
}
