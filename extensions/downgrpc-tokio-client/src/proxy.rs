use std::{
    convert::Infallible,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use downgrpc::{
    grpcweb::{
        is_grpc_content_type, web_to_grpc_content_type, ResponseReader, CONTENT_TYPE_GRPC,
        CONTENT_TYPE_GRPC_WEB,
    },
    BoxError,
};
use http::{
    header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE},
    uri::{Authority, Scheme},
    HeaderMap, HeaderValue, Request, Response, StatusCode, Uri, Version,
};
use http_body::{Body, Frame};
use http_body_util::{BodyExt, StreamBody};
use hyper::{body::Incoming, service::Service};
use hyper_util::{
    client::legacy::Client,
    rt::{TokioExecutor, TokioIo},
};
use pin_project::pin_project;
use rustls::ClientConfig;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::{
    connector::{parse_endpoint, BridgeConnector},
    error::ClientError,
    options::ConnectOptions,
    pipe::{pipe, ProxyBody},
    side_channel::SideChannelTls,
};

/// Establishes a gRPC channel that reaches `endpoint` through the
/// gRPC-Web reverse proxy: requests go out over plain HTTP (HTTP/1.1, or
/// HTTP/2 when ALPN or `force_http2` says so) and responses are transcoded
/// back from gRPC-Web, recovering the trailers from the terminal body
/// frame.
///
/// Client-streaming RPCs cannot cross an HTTP/1.1-only path this way; use
/// [`connect_via_ws_proxy`](crate::connect_via_ws_proxy) for those.
pub async fn connect_via_proxy(
    endpoint: impl Into<String>,
    tls: Option<ClientConfig>,
    mut options: ConnectOptions,
) -> Result<Channel, ClientError> {
    let endpoint = endpoint.into();
    let tls = tls.map(Arc::new);

    if let Some(config) = &tls {
        // One out-of-band handshake against the real endpoint: certificate
        // problems surface here instead of as UNAVAILABLE later, and the
        // in-process plaintext connection stays untouched.
        SideChannelTls::new(&endpoint, config.clone())?
            .handshake()
            .await?;
    }

    let default_port = if tls.is_some() { 443 } else { 80 };
    let (host, _) = parse_endpoint(&endpoint, default_port)?;
    let connector = BridgeConnector::new(
        &host,
        tls.clone(),
        &options.extra_h2_alpns,
        options.force_http2,
    )?;

    let mut builder = Client::builder(TokioExecutor::new());
    if options.force_http2 {
        builder.http2_only(true);
    }
    let client = builder.build(connector);

    let authority = Authority::try_from(endpoint.as_str())
        .map_err(|err| ClientError::invalid_endpoint(&endpoint, err.to_string()))?;
    let scheme = if tls.is_some() {
        Scheme::HTTPS
    } else {
        Scheme::HTTP
    };

    let proxy = WebReverseProxy {
        client,
        scheme,
        authority,
    };
    serve_and_connect(&endpoint, proxy, &mut options).await
}

/// Starts the in-process HTTP/2 proxy server and dials a tonic channel
/// through it. Shared by the gRPC-Web and WebSocket variants.
pub(crate) async fn serve_and_connect<S>(
    endpoint: &str,
    service: S,
    options: &mut ConnectOptions,
) -> Result<Channel, ClientError>
where
    S: Service<Request<Incoming>, Response = Response<ProxyBody>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    let (dialer, listener) = pipe();
    tokio::spawn(listener.serve(service));

    let tonic_endpoint = Endpoint::from_shared(format!("http://{endpoint}"))?;
    let tonic_endpoint = options.apply_endpoint(tonic_endpoint);

    let channel = tonic_endpoint
        .connect_with_connector(tower::service_fn(move |_: Uri| {
            let dialer = dialer.clone();
            async move { Ok::<_, std::io::Error>(TokioIo::new(dialer.dial().await?)) }
        }))
        .await?;
    Ok(channel)
}

/// Reverse proxy serving the gRPC-Web path of the in-process endpoint.
#[derive(Clone)]
pub(crate) struct WebReverseProxy {
    client: Client<BridgeConnector, Incoming>,
    scheme: Scheme,
    authority: Authority,
}

impl Service<Request<Incoming>> for WebReverseProxy {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Infallible>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let proxy = self.clone();
        Box::pin(async move { Ok(proxy.handle(req).await) })
    }
}

impl WebReverseProxy {
    async fn handle(self, mut req: Request<Incoming>) -> Response<ProxyBody> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_owned();
        let uri = Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build();
        let uri = match uri {
            Ok(uri) => uri,
            Err(err) => return synthesized_transport_error(format!("transport: target URI: {err}")),
        };
        *req.uri_mut() = uri;
        // The outbound connection picks its own protocol version.
        *req.version_mut() = Version::HTTP_11;

        strip_hop_headers(req.headers_mut());
        let headers = req.headers_mut();
        headers.append(ACCEPT, HeaderValue::from_static(CONTENT_TYPE_GRPC));
        headers.append(ACCEPT, HeaderValue::from_static(CONTENT_TYPE_GRPC_WEB));

        match self.client.request(req).await {
            Ok(response) => modify_response(response).await,
            Err(err) => synthesized_transport_error(format!("transport: {err}")),
        }
    }
}

/// Hop-by-hop headers that must not travel to the next hop. `te` in
/// particular would make the remote downgrading handler skip transcoding
/// and lose the trailers on the HTTP/1.1 leg.
const HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_HEADERS {
        headers.remove(*name);
    }
}

async fn modify_response(response: Response<Incoming>) -> Response<ProxyBody> {
    let (mut parts, body) = response.into_parts();
    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();

    if let Some(grpc_content_type) = web_to_grpc_content_type(&content_type) {
        if let Ok(value) = HeaderValue::try_from(grpc_content_type) {
            parts.headers.insert(CONTENT_TYPE, value);
        }
        let zero_length = parts
            .headers
            .get(CONTENT_LENGTH)
            .map(|v| v.as_bytes() == b"0")
            .unwrap_or(false);
        // The trailer frame is split off the body, so any declared length
        // is wrong from here on.
        parts.headers.remove(CONTENT_LENGTH);

        let mut reader = ResponseReader::new(body);
        // Nothing in the body means the headers would otherwise be flushed
        // alone and the local gRPC client would report missing trailers;
        // hold the response back until the first poll resolves.
        let first = if zero_length {
            Some(reader.frame().await)
        } else {
            None
        };
        let body = PrimedBody { first, inner: reader }
            .map_err(Into::into)
            .boxed_unsync();
        return Response::from_parts(parts, body);
    }

    if parts.status.is_success() && is_grpc_content_type(&content_type) {
        // The remote spoke HTTP/2 gRPC end to end; real trailers came
        // through and pass along unchanged.
        return Response::from_parts(parts, body.map_err(Into::into).boxed_unsync());
    }

    debug!(
        "non-gRPC upstream response: HTTP {} ({content_type:?})",
        parts.status
    );
    synthesized_transport_error(format!(
        "transport: received non-gRPC response: HTTP {}",
        parts.status
    ))
}

/// Fakes a gRPC response for a failed outbound call: HTTP 200 with a
/// trailers-only body announcing UNAVAILABLE.
pub(crate) fn synthesized_transport_error(message: String) -> Response<ProxyBody> {
    let mut trailers = HeaderMap::new();
    trailers.insert(
        "grpc-status",
        HeaderValue::from_static("14"), // UNAVAILABLE
    );
    let message = HeaderValue::from_str(&message)
        .unwrap_or_else(|_| HeaderValue::from_static("transport error"));
    trailers.insert("grpc-message", message);

    let body = StreamBody::new(futures_util::stream::iter([Ok::<_, BoxError>(
        Frame::trailers(trailers),
    )]))
    .boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_GRPC));
    response
}

/// Body wrapper that replays an eagerly polled first frame.
#[pin_project]
struct PrimedBody<B: Body> {
    first: Option<Option<Result<Frame<B::Data>, B::Error>>>,
    #[pin]
    inner: B,
}

impl<B> Body for PrimedBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, B::Error>>> {
        let this = self.project();
        if let Some(first) = this.first.take() {
            return Poll::Ready(first);
        }
        this.inner.poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        match &self.first {
            Some(None) => true,
            Some(Some(_)) => false,
            None => self.inner.is_end_stream(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn synthesized_error_is_a_grpc_trailers_only_response() {
        let response = synthesized_transport_error("transport: dial refused".to_owned());
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], CONTENT_TYPE_GRPC);

        let collected = response.into_body().collect().await.unwrap();
        let trailers = collected.trailers().cloned().unwrap();
        assert!(collected.to_bytes().is_empty());
        assert_eq!(trailers["grpc-status"], "14");
        assert_eq!(trailers["grpc-message"], "transport: dial refused");
    }

    #[test]
    fn hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("grpc-timeout", HeaderValue::from_static("5S"));
        strip_hop_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("grpc-timeout"));
    }
}
