use std::{convert::Infallible, io};

use bytes::Bytes;
use downgrpc::BoxError;
use http::{Request, Response};
use http_body_util::combinators::UnsyncBoxBody;
use hyper::{body::Incoming, service::Service};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::{io::DuplexStream, sync::mpsc};
use tracing::debug;

/// Body type every in-process proxy handler produces.
pub(crate) type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

const PIPE_BUFFER_SIZE: usize = 64 * 1024;
const PIPE_BACKLOG: usize = 16;

/// An in-process listener/dialer pair. Connections are `tokio::io::duplex`
/// pipes that never traverse the kernel; the dialer end goes to the tonic
/// channel's connector and the listener end is served by an HTTP/2 server.
pub(crate) fn pipe() -> (PipeDialer, PipeListener) {
    let (tx, rx) = mpsc::channel(PIPE_BACKLOG);
    (PipeDialer { tx }, PipeListener { rx })
}

#[derive(Clone)]
pub(crate) struct PipeDialer {
    tx: mpsc::Sender<DuplexStream>,
}

impl PipeDialer {
    pub(crate) async fn dial(&self) -> io::Result<DuplexStream> {
        let (client, server) = tokio::io::duplex(PIPE_BUFFER_SIZE);
        self.tx.send(server).await.map_err(|_| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "in-process proxy server is closed",
            )
        })?;
        Ok(client)
    }
}

pub(crate) struct PipeListener {
    rx: mpsc::Receiver<DuplexStream>,
}

impl PipeListener {
    /// Serves HTTP/2 on every dialed pipe until the last dialer is dropped.
    ///
    /// The tonic channel is the only holder of the dialer, so the proxy
    /// server lives exactly as long as the channel: terminal shutdown of
    /// the channel drops the dialer, the accept queue ends, and this loop
    /// returns.
    pub(crate) async fn serve<S>(mut self, service: S)
    where
        S: Service<Request<Incoming>, Response = Response<ProxyBody>, Error = Infallible>
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        while let Some(io) = self.rx.recv().await {
            let service = service.clone();
            tokio::spawn(async move {
                let result = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(io), service)
                    .await;
                if let Err(err) = result {
                    debug!("in-process proxy connection ended: {err}");
                }
            });
        }
        debug!("in-process proxy server closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn dial_connects_to_listener() {
        let (dialer, mut listener) = pipe();
        let mut client = dialer.dial().await.unwrap();
        let mut server = listener.rx.recv().await.unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn dial_fails_once_listener_is_gone() {
        let (dialer, listener) = pipe();
        drop(listener);
        let err = dialer.dial().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
