//! WebSocket half of the client bridge.
//!
//! Each RPC arriving on the in-process pipe is relayed over its own
//! `grpc-ws` WebSocket: the inbound gRPC headers ride on the handshake
//! request, every length-prefixed frame of the request body becomes one
//! binary message terminated by the end-of-stream sentinel, and the
//! server's messages come back as initial-header, data, and trailer
//! frames. Unlike the gRPC-Web path this supports client streaming.

use std::{convert::Infallible, future::Future, pin::Pin, sync::Arc};

use bytes::{Bytes, BytesMut};
use downgrpc::{
    constants::{END_OF_STREAM_HEADER, GRPC_WS_PROTOCOL, MAX_WS_MESSAGE_SIZE, MESSAGE_HEADER_LEN},
    frame::{
        is_compressed, is_metadata_frame, validate_frame, FrameCodec, FrameDecodeError,
    },
    grpcweb::is_grpc_content_type,
    trailers::{parse_trailers, TrailerParseError},
    BoxError,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use http::{
    header::{
        HeaderName, CONNECTION, CONTENT_TYPE, HOST, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL,
        SEC_WEBSOCKET_VERSION, UPGRADE,
    },
    HeaderMap, Method, Request, Response, StatusCode, Version,
};
use http_body::Frame;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::{body::Incoming, service::Service};
use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::{
    client_async_with_config,
    tungstenite::{
        handshake::client::generate_key,
        protocol::{frame::coding::CloseCode, CloseFrame, Message, WebSocketConfig},
    },
    WebSocketStream,
};
use tokio_util::codec::Decoder;
use tonic::transport::Channel;
use tracing::{debug, warn};

use crate::{
    connector::{parse_endpoint, MaybeTlsStream},
    error::ClientError,
    options::ConnectOptions,
    pipe::ProxyBody,
    proxy::{serve_and_connect, synthesized_transport_error},
    side_channel::SideChannelTls,
};

/// Establishes a gRPC channel that reaches `endpoint` by relaying every RPC
/// over a `grpc-ws` WebSocket. Supports unary, server-streaming,
/// client-streaming, and bidirectional RPCs across HTTP/1.1-only paths.
pub async fn connect_via_ws_proxy(
    endpoint: impl Into<String>,
    tls: Option<ClientConfig>,
    mut options: ConnectOptions,
) -> Result<Channel, ClientError> {
    let endpoint = endpoint.into();
    let tls = tls.map(Arc::new);

    if let Some(config) = &tls {
        SideChannelTls::new(&endpoint, config.clone())?
            .handshake()
            .await?;
    }

    let default_port = if tls.is_some() { 443 } else { 80 };
    let (host, port) = parse_endpoint(&endpoint, default_port)?;

    let tls = tls
        .map(|config| -> Result<WsTls, ClientError> {
            let server_name = ServerName::try_from(host.clone()).map_err(|err| {
                ClientError::invalid_endpoint(&endpoint, format!("not a valid server name: {err}"))
            })?;
            // The WebSocket leg is HTTP/1.1 by construction; offering h2
            // via ALPN would only break the upgrade.
            let mut config = (*config).clone();
            config.alpn_protocols = Vec::new();
            Ok(WsTls {
                config: Arc::new(config),
                server_name,
            })
        })
        .transpose()?;

    let proxy = WebSocketProxy {
        endpoint: endpoint.clone(),
        host,
        port,
        tls,
    };
    serve_and_connect(&endpoint, proxy, &mut options).await
}

#[derive(Clone)]
struct WsTls {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
}

type ClientWs = WebSocketStream<MaybeTlsStream>;
type BodyItem = Result<Frame<Bytes>, BoxError>;

#[derive(Debug, thiserror::Error)]
enum WsProxyError {
    #[error("websocket transport: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Frame(#[from] FrameDecodeError),

    #[error(transparent)]
    Trailers(#[from] TrailerParseError),

    #[error("{0}")]
    Protocol(String),

    #[error("dialing: {0}")]
    Dial(String),
}

impl WsProxyError {
    fn protocol(message: impl Into<String>) -> Self {
        WsProxyError::Protocol(message.into())
    }
}

/// Per-channel WebSocket proxy served on the in-process pipe.
#[derive(Clone)]
pub(crate) struct WebSocketProxy {
    endpoint: String,
    host: String,
    port: u16,
    tls: Option<WsTls>,
}

impl Service<Request<Incoming>> for WebSocketProxy {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Infallible>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let proxy = self.clone();
        Box::pin(async move { Ok(proxy.handle(req).await) })
    }
}

impl WebSocketProxy {
    async fn handle(self, req: Request<Incoming>) -> Response<ProxyBody> {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if req.version() != Version::HTTP_2 || !is_grpc_content_type(content_type) {
            warn!("request on the websocket proxy is not a valid gRPC request");
            let body = Full::new(Bytes::from_static(b"Request is not a valid gRPC request\n"))
                .map_err(Into::into)
                .boxed_unsync();
            let mut response = Response::new(body);
            *response.status_mut() = StatusCode::UNSUPPORTED_MEDIA_TYPE;
            return response;
        }

        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_owned();
        let scheme = if self.tls.is_some() { "wss" } else { "ws" };
        let target = format!("{scheme}://{}{path}", self.endpoint);

        let (parts, body) = req.into_parts();
        let handshake = match self.handshake_request(&target, &parts.headers) {
            Ok(handshake) => handshake,
            Err(err) => {
                return synthesized_transport_error(format!("transport: {err}"));
            }
        };

        let ws = match self.dial_websocket(handshake).await {
            Ok(ws) => ws,
            Err(err) => {
                return synthesized_transport_error(format!(
                    "transport: connecting to gRPC server {target:?}: {err}"
                ));
            }
        };
        let (sink, mut stream) = ws.split();

        // All writes (both pumps and the close frames) funnel through one
        // send loop so they cannot interleave mid-message.
        let (ws_tx, ws_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(send_loop(sink, ws_rx));
        tokio::spawn(write_pump(body, ws_tx.clone()));

        // The first frame is the initial metadata (or a trailers-only
        // response); it becomes the HTTP response headers.
        let headers = match read_initial_headers(&mut stream).await {
            Ok(headers) => headers,
            Err(err) => {
                let _ = ws_tx.send(close_message(
                    CloseCode::Error,
                    format!("reading response header: {err}"),
                ));
                return synthesized_transport_error(format!(
                    "transport: reading response header: {err}"
                ));
            }
        };

        let (body_tx, body_rx) = mpsc::channel::<BodyItem>(1);
        tokio::spawn(read_pump(stream, body_tx, ws_tx));

        let mut response =
            Response::new(StreamBody::new(ReceiverStream::new(body_rx)).boxed_unsync());
        *response.headers_mut() = headers;
        response
    }

    /// Builds the upgrade request, piggybacking the gRPC request headers.
    fn handshake_request(
        &self,
        target: &str,
        grpc_headers: &HeaderMap,
    ) -> Result<Request<()>, WsProxyError> {
        let mut request = Request::builder()
            .method(Method::GET)
            .uri(target)
            .header(HOST, self.endpoint.clone())
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_VERSION, "13")
            .header(SEC_WEBSOCKET_KEY, generate_key())
            .header(SEC_WEBSOCKET_PROTOCOL, GRPC_WS_PROTOCOL)
            .body(())
            .map_err(|err| WsProxyError::protocol(format!("building handshake request: {err}")))?;

        let headers = request.headers_mut();
        for (name, value) in grpc_headers {
            if !is_reserved_handshake_header(name) {
                headers.append(name, value.clone());
            }
        }
        Ok(request)
    }

    async fn dial_websocket(&self, request: Request<()>) -> Result<ClientWs, WsProxyError> {
        let proxy = crate::proxy_env::proxy_from_env(self.tls.is_some(), &self.host);
        let tcp = crate::proxy_env::dial(&self.host, self.port, proxy.as_ref())
            .await
            .map_err(|err| WsProxyError::Dial(err.to_string()))?;

        let stream = match &self.tls {
            Some(tls) => {
                let connector = TlsConnector::from(tls.config.clone());
                let tls_stream = connector
                    .connect(tls.server_name.clone(), tcp)
                    .await
                    .map_err(|err| WsProxyError::Dial(format!("TLS handshake: {err}")))?;
                MaybeTlsStream::Tls(Box::new(tls_stream))
            }
            None => MaybeTlsStream::Plain(tcp),
        };

        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(MAX_WS_MESSAGE_SIZE);
        let (ws, response) = client_async_with_config(request, stream, Some(config)).await?;
        debug!(
            "websocket established, subprotocol: {:?}",
            response.headers().get(SEC_WEBSOCKET_PROTOCOL)
        );
        Ok(ws)
    }
}

fn is_reserved_handshake_header(name: &HeaderName) -> bool {
    *name == CONNECTION
        || *name == UPGRADE
        || *name == HOST
        || *name == http::header::CONTENT_LENGTH
        || name.as_str().starts_with("sec-websocket-")
}

fn close_message(code: CloseCode, reason: String) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

async fn send_loop(
    mut sink: SplitSink<ClientWs, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        let is_close = matches!(message, Message::Close(_));
        if sink.send(message).await.is_err() || is_close {
            break;
        }
    }
}

/// Reads length-prefixed frames out of the request body and sends each as
/// one binary message, terminating with the end-of-stream sentinel.
async fn write_pump(mut body: Incoming, ws_tx: mpsc::UnboundedSender<Message>) {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    loop {
        match body.frame().await {
            Some(Ok(frame)) => {
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                buf.extend_from_slice(&data);
                loop {
                    match codec.decode(&mut buf) {
                        Ok(Some(frame)) => {
                            if ws_tx
                                .send(Message::Binary(frame.into_bytes().to_vec()))
                                .is_err()
                            {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!("malformed gRPC request frame: {err}");
                            let _ = ws_tx.send(close_message(CloseCode::Error, err.to_string()));
                            return;
                        }
                    }
                }
            }
            Some(Err(err)) => {
                warn!("reading gRPC request body: {err}");
                let _ = ws_tx.send(close_message(CloseCode::Error, err.to_string()));
                return;
            }
            None => {
                // A frame may complete exactly at end of body; a partial
                // frame means the sender died mid-message.
                loop {
                    match codec.decode_eof(&mut buf) {
                        Ok(Some(frame)) => {
                            if ws_tx
                                .send(Message::Binary(frame.into_bytes().to_vec()))
                                .is_err()
                            {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!("truncated gRPC request frame: {err}");
                            let _ = ws_tx.send(close_message(CloseCode::Error, err.to_string()));
                            return;
                        }
                    }
                }
                // Half-close: no more messages in the request stream.
                let _ = ws_tx.send(Message::Binary(END_OF_STREAM_HEADER.to_vec()));
                return;
            }
        }
    }
}

async fn read_initial_headers(
    stream: &mut SplitStream<ClientWs>,
) -> Result<HeaderMap, WsProxyError> {
    loop {
        let message = match stream.next().await {
            None => {
                return Err(WsProxyError::protocol(
                    "websocket closed before the response header",
                ))
            }
            Some(message) => message?,
        };
        match message {
            Message::Binary(msg) => {
                validate_frame(&msg)?;
                if !is_metadata_frame(&msg) {
                    return Err(WsProxyError::protocol("did not receive metadata message"));
                }
                if is_compressed(&msg) {
                    return Err(WsProxyError::protocol(
                        "compression flag is set; compressed metadata is not supported",
                    ));
                }
                return Ok(parse_trailers(&msg[MESSAGE_HEADER_LEN..])?);
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => {
                return Err(WsProxyError::protocol(
                    "websocket closed before the response header",
                ))
            }
            _ => {
                return Err(WsProxyError::protocol(
                    "incorrect message type; expected a binary message",
                ))
            }
        }
    }
}

/// Relays server messages into the response body: data frames verbatim
/// (their entire length-prefixed bytes), the second metadata frame as HTTP
/// trailers, and nothing after that.
async fn read_pump(
    mut stream: SplitStream<ClientWs>,
    body_tx: mpsc::Sender<BodyItem>,
    ws_tx: mpsc::UnboundedSender<Message>,
) {
    // End of stream is fine before any data (headers- or trailers-only
    // responses) and after the trailers, but not in between.
    let mut seen_data = false;
    let mut seen_trailers = false;

    loop {
        let outcome: Result<Frame<Bytes>, WsProxyError> = match stream.next().await {
            None | Some(Ok(Message::Close(_))) => {
                if seen_data && !seen_trailers {
                    Err(WsProxyError::protocol("websocket closed before trailers"))
                } else {
                    let _ = ws_tx.send(close_message(CloseCode::Normal, String::new()));
                    return;
                }
            }
            Some(Ok(Message::Binary(msg))) => {
                classify_response_message(&msg, &mut seen_data, &mut seen_trailers)
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(_)) => Err(WsProxyError::protocol(
                "incorrect message type; expected a binary message",
            )),
            Some(Err(err)) => Err(WsProxyError::Transport(err)),
        };

        match outcome {
            Ok(frame) => {
                if body_tx.send(Ok(frame)).await.is_err() {
                    // The local client gave up on the response.
                    let _ = ws_tx.send(close_message(CloseCode::Normal, String::new()));
                    return;
                }
            }
            Err(err) => {
                warn!("grpc websocket response failed: {err}");
                let _ = body_tx.send(Err(err.to_string().into())).await;
                let _ = ws_tx.send(close_message(CloseCode::Error, err.to_string()));
                return;
            }
        }
    }
}

fn classify_response_message(
    msg: &[u8],
    seen_data: &mut bool,
    seen_trailers: &mut bool,
) -> Result<Frame<Bytes>, WsProxyError> {
    if *seen_trailers {
        return Err(WsProxyError::protocol(
            "received message after receiving trailers",
        ));
    }
    validate_frame(msg)?;
    if is_metadata_frame(msg) {
        if is_compressed(msg) {
            return Err(WsProxyError::protocol(
                "compression flag is set; compressed metadata is not supported",
            ));
        }
        *seen_trailers = true;
        let trailers = parse_trailers(&msg[MESSAGE_HEADER_LEN..])?;
        return Ok(Frame::trailers(trailers));
    }
    *seen_data = true;
    // The local gRPC client expects the framed bytes, header included.
    Ok(Frame::data(Bytes::copy_from_slice(msg)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_handshake_headers_are_skipped() {
        assert!(is_reserved_handshake_header(&CONNECTION));
        assert!(is_reserved_handshake_header(&HeaderName::from_static(
            "sec-websocket-key"
        )));
        assert!(!is_reserved_handshake_header(&CONTENT_TYPE));
        assert!(!is_reserved_handshake_header(&HeaderName::from_static(
            "grpc-timeout"
        )));
    }

    #[test]
    fn response_messages_follow_the_state_machine() {
        let mut seen_data = false;
        let mut seen_trailers = false;

        let mut data = vec![0u8, 0, 0, 0, 2];
        data.extend_from_slice(b"ok");
        let frame =
            classify_response_message(&data, &mut seen_data, &mut seen_trailers).unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from(data.clone()));
        assert!(seen_data);

        let mut trailer = vec![0x80u8, 0, 0, 0, 16];
        trailer.extend_from_slice(b"grpc-status: 0\r\n");
        let frame =
            classify_response_message(&trailer, &mut seen_data, &mut seen_trailers).unwrap();
        let trailers = frame.into_trailers().unwrap();
        assert_eq!(trailers["grpc-status"], "0");
        assert!(seen_trailers);

        // Nothing is allowed after the trailers.
        let err = classify_response_message(&data, &mut seen_data, &mut seen_trailers)
            .unwrap_err();
        assert!(matches!(err, WsProxyError::Protocol(_)));
    }

    #[test]
    fn compressed_metadata_is_rejected() {
        let mut seen_data = false;
        let mut seen_trailers = false;
        let err = classify_response_message(
            &[0x81, 0, 0, 0, 0],
            &mut seen_data,
            &mut seen_trailers,
        )
        .unwrap_err();
        assert!(matches!(err, WsProxyError::Protocol(_)));
        assert!(!seen_trailers);
    }
}
