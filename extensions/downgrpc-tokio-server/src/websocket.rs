use bytes::{Bytes, BytesMut};
use downgrpc::{
    constants::{GRPC_WS_PROTOCOL, MAX_WS_MESSAGE_SIZE},
    frame::{
        is_compressed, is_end_of_stream, is_metadata_frame, validate_frame, FrameCodec,
        FrameDecodeError,
    },
    grpcweb::is_grpc_content_type,
    trailers::make_trailer_frame,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use http::{
    header::{
        HeaderName, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, SEC_WEBSOCKET_ACCEPT,
        SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, UPGRADE,
    },
    HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Version,
};
use http_body::Frame;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::{
    tungstenite::{
        handshake::derive_accept_key,
        protocol::{frame::coding::CloseCode, CloseFrame, Message, Role, WebSocketConfig},
    },
    WebSocketStream,
};
use tokio_util::{codec::Decoder, sync::CancellationToken};
use tonic::{body::BoxBody, service::Routes, Status};
use tower::ServiceExt;
use tracing::{debug, warn};

use crate::handler::{plain_error_response, ResponseBody};

type ServerWs = WebSocketStream<TokioIo<Upgraded>>;
type BodyItem = Result<Frame<Bytes>, Status>;

/// True if the request headers form a `grpc-ws` WebSocket upgrade.
pub(crate) fn is_grpc_websocket_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    let upgrade_websocket = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let grpc_ws = headers
        .get(SEC_WEBSOCKET_PROTOCOL)
        .map(|v| v.as_bytes() == GRPC_WS_PROTOCOL.as_bytes())
        .unwrap_or(false);
    connection_upgrade && upgrade_websocket && grpc_ws
}

/// Accepts a `grpc-ws` upgrade and relays the stream into the gRPC router.
///
/// The 101 reply is returned immediately; the gRPC call itself runs on a
/// spawned task once hyper hands over the upgraded connection.
pub(crate) async fn handle_grpc_websocket<B>(
    grpc: Routes,
    mut req: Request<B>,
) -> Response<ResponseBody> {
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !is_grpc_content_type(content_type) {
        return plain_error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "WebSocket upgrade is not a gRPC request",
        );
    }

    let accept_key = match req.headers().get(SEC_WEBSOCKET_KEY) {
        Some(key) => derive_accept_key(key.as_bytes()),
        None => {
            return plain_error_response(
                StatusCode::BAD_REQUEST,
                "WebSocket upgrade without Sec-WebSocket-Key",
            )
        }
    };
    let Ok(accept_key) = HeaderValue::try_from(accept_key) else {
        return plain_error_response(StatusCode::BAD_REQUEST, "Malformed Sec-WebSocket-Key");
    };

    let on_upgrade = hyper::upgrade::on(&mut req);

    // Synthesize the HTTP/2 request the wrapped gRPC server demands. The
    // request body is fed frame by frame from the WebSocket by the read
    // pump; the single-slot channel makes the producer wait until the
    // consumer has taken the previous message.
    let (parts, _body) = req.into_parts();
    let mut headers = parts.headers;
    strip_websocket_headers(&mut headers);

    let (body_tx, body_rx) = mpsc::channel::<BodyItem>(1);
    let request_body: BoxBody = StreamBody::new(ReceiverStream::new(body_rx)).boxed_unsync();
    let mut grpc_req = Request::new(request_body);
    *grpc_req.method_mut() = Method::POST;
    *grpc_req.uri_mut() = parts.uri;
    *grpc_req.version_mut() = Version::HTTP_2;
    *grpc_req.headers_mut() = headers;

    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                warn!("websocket upgrade failed: {err}");
                return;
            }
        };
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(MAX_WS_MESSAGE_SIZE);
        let ws =
            WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, Some(config))
                .await;
        serve_connection(ws, grpc, grpc_req, body_tx).await;
    });

    let mut response = Response::new(Empty::<Bytes>::new().map_err(Into::into).boxed_unsync());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(SEC_WEBSOCKET_ACCEPT, accept_key);
    headers.insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(GRPC_WS_PROTOCOL),
    );
    response
}

fn strip_websocket_headers(headers: &mut HeaderMap) {
    headers.remove(CONNECTION);
    headers.remove(UPGRADE);
    headers.remove(CONTENT_LENGTH);
    let ws_names: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with("sec-websocket-"))
        .cloned()
        .collect();
    for name in ws_names {
        headers.remove(name);
    }
}

async fn serve_connection(
    ws: ServerWs,
    grpc: Routes,
    grpc_req: Request<BoxBody>,
    body_tx: mpsc::Sender<BodyItem>,
) {
    let (mut sink, stream) = ws.split();
    let cancel = CancellationToken::new();
    let reader = tokio::spawn(read_pump(stream, body_tx, cancel.clone()));

    let result = write_response(&mut sink, grpc, grpc_req).await;

    // Stop pulling request messages. This must not initiate the closing
    // handshake itself, or it would race the close frame below.
    cancel.cancel();

    let close = match &result {
        Ok(()) => CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        },
        Err(err) => {
            warn!("grpc websocket stream failed: {err}");
            CloseFrame {
                code: CloseCode::Error,
                reason: err.to_string().into(),
            }
        }
    };
    // Closing an already-closed connection only fails the send, which is
    // equivalent to the close being a no-op.
    if let Err(err) = sink.send(Message::Close(Some(close))).await {
        debug!("websocket close: {err}");
    }
    let _ = reader.await;
}

enum Inbound {
    Frame(Bytes),
    EndOfStream,
    Invalid(Status),
}

/// Applies the request-direction message validations: the message must be a
/// well-formed frame, metadata frames must be neither compressed nor
/// anything but the end-of-stream sentinel, and everything else must be a
/// data frame.
fn classify_message(msg: &[u8]) -> Inbound {
    if let Err(err) = validate_frame(msg) {
        return Inbound::Invalid(Status::internal(format!("invalid gRPC message frame: {err}")));
    }
    if is_metadata_frame(msg) {
        if is_compressed(msg) {
            return Inbound::Invalid(Status::internal(
                "compression flag is set; compressed metadata is not supported",
            ));
        }
        if is_end_of_stream(msg) {
            return Inbound::EndOfStream;
        }
        return Inbound::Invalid(Status::internal(
            "unexpected metadata frame in the request stream",
        ));
    }
    Inbound::Frame(Bytes::copy_from_slice(msg))
}

/// Feeds WebSocket messages into the synthesized request body until the
/// end-of-stream sentinel, an error, or cancellation. The first error is
/// final: it is delivered into the body and the pump stops.
async fn read_pump(
    mut stream: SplitStream<ServerWs>,
    tx: mpsc::Sender<BodyItem>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = stream.next() => message,
        };

        let inbound = match message {
            None | Some(Ok(Message::Close(_))) => Inbound::Invalid(Status::internal(
                "websocket closed before end-of-stream",
            )),
            Some(Ok(Message::Binary(msg))) => classify_message(&msg),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(_)) => Inbound::Invalid(Status::internal(
                "incorrect message type; expected a binary message",
            )),
            Some(Err(err)) => {
                Inbound::Invalid(Status::internal(format!("reading websocket message: {err}")))
            }
        };

        match inbound {
            Inbound::Frame(bytes) => {
                if !deliver(&tx, Ok(Frame::data(bytes)), &cancel).await {
                    break;
                }
            }
            // Dropping the sender surfaces end-of-stream to the gRPC stack.
            Inbound::EndOfStream => break,
            Inbound::Invalid(status) => {
                deliver(&tx, Err(status), &cancel).await;
                break;
            }
        }
    }
}

async fn deliver(tx: &mpsc::Sender<BodyItem>, item: BodyItem, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

#[derive(Debug, thiserror::Error)]
enum WsWriteError {
    #[error("websocket transport: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Frame(#[from] FrameDecodeError),

    #[error("reading gRPC response body: {0}")]
    Body(Status),

    #[error("gRPC routing failed: {0}")]
    Routing(String),
}

/// Drives the gRPC call and mirrors its response onto the WebSocket: one
/// initial metadata frame carrying the response headers, one binary message
/// per gRPC frame of the body, and a terminal metadata frame carrying the
/// trailers. A trailers-only response is a single metadata frame.
async fn write_response(
    sink: &mut SplitSink<ServerWs, Message>,
    grpc: Routes,
    req: Request<BoxBody>,
) -> Result<(), WsWriteError> {
    let response = grpc
        .oneshot(req)
        .await
        .map_err(|err| WsWriteError::Routing(err.to_string()))?;
    let (parts, body) = response.into_parts();

    sink.send(Message::Binary(make_trailer_frame(&parts.headers).to_vec()))
        .await?;

    let mut body = body;
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    let mut trailers: Option<HeaderMap> = None;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(WsWriteError::Body)?;
        match frame.into_data() {
            Ok(data) => {
                buf.extend_from_slice(&data);
                while let Some(message) = codec.decode(&mut buf)? {
                    sink.send(Message::Binary(message.into_bytes().to_vec()))
                        .await?;
                }
            }
            Err(frame) => {
                if let Ok(map) = frame.into_trailers() {
                    trailers = Some(map);
                }
            }
        }
    }
    while let Some(message) = codec.decode_eof(&mut buf)? {
        sink.send(Message::Binary(message.into_bytes().to_vec()))
            .await?;
    }

    if let Some(map) = trailers {
        sink.send(Message::Binary(make_trailer_frame(&map).to_vec()))
            .await?;
    }
    Ok(())
}
