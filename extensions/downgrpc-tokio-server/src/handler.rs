use std::{
    collections::HashSet,
    convert::Infallible,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use downgrpc::{
    grpcweb::{is_grpc_content_type, transcode_response, CONTENT_TYPE_GRPC_WEB},
    BoxError,
};
use http::{
    header::{ACCEPT, CONTENT_TYPE, TE},
    HeaderMap, HeaderValue, Request, Response, StatusCode, Version,
};
use http_body::Body;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full};
use tonic::{
    body::BoxBody,
    server::NamedService,
    service::{Routes, RoutesBuilder},
};
use tower::{Service, ServiceExt};
use tracing::warn;

use crate::websocket;

/// Unified response body type of the downgrading handler.
pub type ResponseBody = UnsyncBoxBody<Bytes, BoxError>;

/// Streaming shape of a gRPC method, as registered with the
/// [`DowngradingHandlerBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Unary,
    ServerStreaming,
    ClientStreaming,
    BidiStreaming,
}

impl MethodKind {
    /// Client-streaming methods cannot be downgraded to gRPC-Web: an
    /// HTTP/1 request body cannot carry a gRPC request stream reliably
    /// through every intermediary.
    pub fn is_client_streaming(self) -> bool {
        matches!(self, MethodKind::ClientStreaming | MethodKind::BidiStreaming)
    }
}

/// Builds a [`DowngradingHandler`] from tonic services and their method
/// tables.
pub struct DowngradingHandlerBuilder<F> {
    routes: RoutesBuilder,
    web_paths: HashSet<String>,
    fallback: F,
}

impl<F> DowngradingHandlerBuilder<F> {
    /// Registers a gRPC service together with its full method paths. Every
    /// method that is not client-streaming becomes a valid gRPC-Web path.
    pub fn add_service<S>(
        mut self,
        svc: S,
        methods: impl IntoIterator<Item = (impl Into<String>, MethodKind)>,
    ) -> Self
    where
        S: Service<Request<BoxBody>, Response = Response<BoxBody>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        self.routes.add_service(svc);
        for (path, kind) in methods {
            if !kind.is_client_streaming() {
                self.web_paths.insert(path.into());
            }
        }
        self
    }

    pub fn build(self) -> DowngradingHandler<F> {
        DowngradingHandler {
            grpc: self.routes.routes(),
            fallback: self.fallback,
            web_paths: Arc::new(self.web_paths),
        }
    }
}

/// An HTTP service that fronts a tonic gRPC router and downgrades responses
/// for clients that cannot receive HTTP trailers.
///
/// Dispatch per request: a `grpc-ws` WebSocket upgrade is served over the
/// upgraded connection; a non-gRPC content type goes to the fallback
/// service; everything else is gRPC, passed through natively when the
/// client announced `TE: trailers` and transcoded to gRPC-Web otherwise.
pub struct DowngradingHandler<F> {
    grpc: Routes,
    fallback: F,
    web_paths: Arc<HashSet<String>>,
}

impl<F> DowngradingHandler<F> {
    pub fn builder(fallback: F) -> DowngradingHandlerBuilder<F> {
        DowngradingHandlerBuilder {
            routes: RoutesBuilder::default(),
            web_paths: HashSet::new(),
            fallback,
        }
    }

    /// The set of method paths that may be served over gRPC-Web.
    pub fn grpc_web_paths(&self) -> &HashSet<String> {
        &self.web_paths
    }
}

impl<F: Clone> Clone for DowngradingHandler<F> {
    fn clone(&self) -> Self {
        DowngradingHandler {
            grpc: self.grpc.clone(),
            fallback: self.fallback.clone(),
            web_paths: self.web_paths.clone(),
        }
    }
}

impl<B, F, FB> Service<Request<B>> for DowngradingHandler<F>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError> + Send,
    F: Service<Request<B>, Response = Response<FB>, Error = Infallible> + Clone + Send + 'static,
    F::Future: Send,
    FB: Body<Data = Bytes> + Send + 'static,
    FB::Error: Into<BoxError> + Send + 'static,
{
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let handler = self.clone();
        Box::pin(async move { Ok(handler.handle(req).await) })
    }
}

impl<F> DowngradingHandler<F> {
    async fn handle<B, FB>(self, req: Request<B>) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError> + Send,
        F: Service<Request<B>, Response = Response<FB>, Error = Infallible>,
        FB: Body<Data = Bytes> + Send + 'static,
        FB::Error: Into<BoxError> + Send + 'static,
    {
        if websocket::is_grpc_websocket_upgrade(req.headers()) {
            return websocket::handle_grpc_websocket(self.grpc, req).await;
        }

        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !is_grpc_content_type(content_type) {
            // Non-gRPC request to the same port.
            return match self.fallback.oneshot(req).await {
                Ok(response) => response.map(|b| b.map_err(Into::into).boxed_unsync()),
                Err(infallible) => match infallible {},
            };
        }

        self.handle_grpc_web(req).await
    }

    async fn handle_grpc_web<B>(self, req: Request<B>) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError> + Send,
    {
        let mut req = req.map(|body| {
            body.map_err(|err| tonic::Status::from_error(err.into()))
                .boxed_unsync()
        });

        if req.version() != Version::HTTP_2 {
            if !self.web_paths.contains(req.uri().path()) {
                // Client-streaming only works with HTTP/2.
                return plain_error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Method cannot be downgraded",
                );
            }
            // The wrapped gRPC server demands HTTP/2.
            *req.version_mut() = Version::HTTP_2;
        }

        let te_trailers = req
            .headers()
            .get(TE)
            .map(|te| te.as_bytes() == b"trailers")
            .unwrap_or(false);
        if te_trailers {
            // Client accepts trailers; let the gRPC router answer natively.
            return match self.grpc.oneshot(req).await {
                Ok(response) => response.map(|b| b.map_err(Into::into).boxed_unsync()),
                Err(err) => {
                    warn!("gRPC router failed: {err}");
                    plain_error_response(StatusCode::INTERNAL_SERVER_ERROR, "gRPC routing failed")
                }
            };
        }

        if !accepts_grpc_web(req.headers()) {
            return plain_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Client neither supports trailers nor gRPC web responses",
            );
        }

        // The gRPC server may legitimately check for the TE header even
        // though the response is transcoded before it reaches the wire.
        req.headers_mut()
            .insert(TE, HeaderValue::from_static("trailers"));

        match self.grpc.oneshot(req).await {
            Ok(response) => {
                transcode_response(response).map(|b| b.map_err(Into::into).boxed_unsync())
            }
            Err(err) => {
                warn!("gRPC router failed: {err}");
                plain_error_response(StatusCode::INTERNAL_SERVER_ERROR, "gRPC routing failed")
            }
        }
    }
}

fn accepts_grpc_web(headers: &HeaderMap) -> bool {
    headers.get_all(ACCEPT).iter().any(|value| {
        value
            .to_str()
            .map(|v| v.split(',').any(|part| part.trim() == CONTENT_TYPE_GRPC_WEB))
            .unwrap_or(false)
    })
}

pub(crate) fn plain_error_response(status: StatusCode, message: &str) -> Response<ResponseBody> {
    let body = Full::new(Bytes::from(format!("{message}\n")))
        .map_err(Into::into)
        .boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::{ready, Ready};

    #[derive(Clone)]
    struct StubService;

    impl Service<Request<BoxBody>> for StubService {
        type Response = Response<BoxBody>;
        type Error = Infallible;
        type Future = Ready<Result<Self::Response, Infallible>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: Request<BoxBody>) -> Self::Future {
            ready(Ok(Response::new(tonic::codegen::empty_body())))
        }
    }

    impl NamedService for StubService {
        const NAME: &'static str = "test.Stub";
    }

    fn noop_fallback(
    ) -> impl Service<Request<BoxBody>, Response = Response<Full<Bytes>>, Error = Infallible> + Clone
    {
        tower::service_fn(|_req: Request<BoxBody>| {
            ready(Ok(Response::new(Full::new(Bytes::new()))))
        })
    }

    #[test]
    fn web_paths_exclude_client_streaming_methods() {
        let handler = DowngradingHandler::builder(noop_fallback())
            .add_service(
                StubService,
                [
                    ("/test.Stub/Unary", MethodKind::Unary),
                    ("/test.Stub/ServerStream", MethodKind::ServerStreaming),
                    ("/test.Stub/ClientStream", MethodKind::ClientStreaming),
                    ("/test.Stub/Bidi", MethodKind::BidiStreaming),
                ],
            )
            .build();

        let paths = handler.grpc_web_paths();
        assert_eq!(paths.len(), 2);
        assert!(paths.contains("/test.Stub/Unary"));
        assert!(paths.contains("/test.Stub/ServerStream"));
    }

    #[test]
    fn accept_header_detection() {
        let mut headers = HeaderMap::new();
        assert!(!accepts_grpc_web(&headers));

        headers.append(ACCEPT, HeaderValue::from_static("application/grpc"));
        assert!(!accepts_grpc_web(&headers));

        headers.append(ACCEPT, HeaderValue::from_static("application/grpc-web"));
        assert!(accepts_grpc_web(&headers));

        let mut combined = HeaderMap::new();
        combined.append(
            ACCEPT,
            HeaderValue::from_static("application/grpc, application/grpc-web"),
        );
        assert!(accepts_grpc_web(&combined));
    }

    #[test]
    fn plain_errors_are_text() {
        let response = plain_error_response(StatusCode::INTERNAL_SERVER_ERROR, "nope");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain; charset=utf-8");
    }
}
