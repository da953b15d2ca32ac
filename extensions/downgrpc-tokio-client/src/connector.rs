//! Outbound transport used by the reverse-proxy half of the client bridge.
//!
//! The connector dials plain TCP (optionally through the environment's
//! `CONNECT` proxy) and layers rustls on top when a TLS configuration is
//! supplied. ALPN decides whether the pooled connection runs HTTP/2: `h2`
//! and any registered extra ALPN names upgrade, everything else stays on
//! HTTP/1.1.

use std::{
    future::Future,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use http::Uri;
use hyper_util::{
    client::legacy::connect::{Connected, Connection},
    rt::TokioIo,
};
use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::{client::TlsStream, TlsConnector};
use tower::Service;
use tracing::debug;

use crate::{error::ClientError, proxy_env};

pub(crate) const ALPN_H2: &str = "h2";
pub(crate) const ALPN_HTTP11: &str = "http/1.1";

/// Splits a `host[:port]` endpoint, defaulting the port.
pub(crate) fn parse_endpoint(endpoint: &str, default_port: u16) -> Result<(String, u16), ClientError> {
    let authority = endpoint.trim();
    if authority.is_empty() {
        return Err(ClientError::invalid_endpoint(endpoint, "empty endpoint"));
    }
    // Bracketed IPv6 literals keep their colons.
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| ClientError::invalid_endpoint(endpoint, "unclosed IPv6 literal"))?;
        let port = match rest.strip_prefix(':') {
            Some(port) => port
                .parse()
                .map_err(|_| ClientError::invalid_endpoint(endpoint, "invalid port"))?,
            None => default_port,
        };
        return Ok((host.to_owned(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| ClientError::invalid_endpoint(endpoint, "invalid port"))?;
            Ok((host.to_owned(), port))
        }
        None => Ok((authority.to_owned(), default_port)),
    }
}

#[derive(Clone)]
struct ConnectorTls {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
    h2_alpns: Arc<Vec<Vec<u8>>>,
}

/// Tower connector for `hyper_util`'s pooling client.
#[derive(Clone)]
pub(crate) struct BridgeConnector {
    tls: Option<ConnectorTls>,
}

impl BridgeConnector {
    /// Builds a connector for the given endpoint host. `extra_h2_alpns` are
    /// offered during the handshake and treated as `h2` when negotiated.
    pub(crate) fn new(
        host: &str,
        tls: Option<Arc<ClientConfig>>,
        extra_h2_alpns: &[String],
        force_http2: bool,
    ) -> Result<Self, ClientError> {
        let tls = match tls {
            None => None,
            Some(user_config) => {
                let server_name = ServerName::try_from(host.to_owned()).map_err(|err| {
                    ClientError::invalid_endpoint(host, format!("not a valid server name: {err}"))
                })?;

                let mut alpns: Vec<Vec<u8>> = vec![ALPN_H2.as_bytes().to_vec()];
                alpns.extend(extra_h2_alpns.iter().map(|alpn| alpn.as_bytes().to_vec()));
                let mut h2_alpns = alpns.clone();
                if !force_http2 {
                    alpns.push(ALPN_HTTP11.as_bytes().to_vec());
                }

                let mut config = (*user_config).clone();
                config.alpn_protocols = alpns;

                h2_alpns.sort();
                Some(ConnectorTls {
                    config: Arc::new(config),
                    server_name,
                    h2_alpns: Arc::new(h2_alpns),
                })
            }
        };
        Ok(BridgeConnector { tls })
    }

    async fn connect(self, uri: Uri) -> Result<BridgeIo, ClientError> {
        let https = uri.scheme_str() == Some("https");
        let host = uri
            .host()
            .ok_or_else(|| ClientError::invalid_endpoint(&uri.to_string(), "missing host"))?
            .to_owned();
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

        let proxy = proxy_env::proxy_from_env(https, &host);
        let tcp = proxy_env::dial(&host, port, proxy.as_ref()).await?;

        match (&self.tls, https) {
            (Some(tls), true) => {
                let connector = TlsConnector::from(tls.config.clone());
                let stream = connector
                    .connect(tls.server_name.clone(), tcp)
                    .await
                    .map_err(|err| ClientError::Tls {
                        endpoint: format!("{host}:{port}"),
                        source: err,
                    })?;
                let negotiated_h2 = stream
                    .get_ref()
                    .1
                    .alpn_protocol()
                    .map(|alpn| tls.h2_alpns.binary_search(&alpn.to_vec()).is_ok())
                    .unwrap_or(false);
                debug!("TLS connection to {host}:{port}, h2={negotiated_h2}");
                Ok(BridgeIo {
                    io: TokioIo::new(MaybeTlsStream::Tls(Box::new(stream))),
                    negotiated_h2,
                })
            }
            _ => Ok(BridgeIo {
                io: TokioIo::new(MaybeTlsStream::Plain(tcp)),
                negotiated_h2: false,
            }),
        }
    }
}

impl Service<Uri> for BridgeConnector {
    type Response = BridgeIo;
    type Error = ClientError;
    type Future = Pin<Box<dyn Future<Output = Result<BridgeIo, ClientError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), ClientError>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let connector = self.clone();
        Box::pin(connector.connect(uri))
    }
}

/// A TCP connection with or without a TLS layer.
pub(crate) enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Connection type handed to the pooling client; reports whether ALPN
/// settled on HTTP/2.
pub(crate) struct BridgeIo {
    io: TokioIo<MaybeTlsStream>,
    negotiated_h2: bool,
}

impl Connection for BridgeIo {
    fn connected(&self) -> Connected {
        let connected = Connected::new();
        if self.negotiated_h2 {
            connected.negotiated_h2()
        } else {
            connected
        }
    }
}

impl hyper::rt::Read for BridgeIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl hyper::rt::Write for BridgeIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parsing() {
        assert_eq!(
            parse_endpoint("example.com:8443", 443).unwrap(),
            ("example.com".to_owned(), 8443)
        );
        assert_eq!(
            parse_endpoint("example.com", 443).unwrap(),
            ("example.com".to_owned(), 443)
        );
        assert_eq!(
            parse_endpoint("[::1]:50051", 443).unwrap(),
            ("::1".to_owned(), 50051)
        );
        assert_eq!(parse_endpoint("[::1]", 80).unwrap(), ("::1".to_owned(), 80));
        assert!(parse_endpoint("", 443).is_err());
        assert!(parse_endpoint("example.com:notaport", 443).is_err());
    }
}
