use std::pin::Pin;

use tokio_stream::{Stream, StreamExt};
use tonic::{
    metadata::MetadataMap, Code, Request, Response, Status, Streaming,
};

use crate::pb::{echo_server::Echo, EchoRequest, EchoResponse};

/// Echo server that reflects request metadata back at the caller.
///
/// `header-echo` request metadata comes back as `header-echo-response`
/// initial metadata, `trailer-echo` as `trailer-echo-response` on error
/// statuses, and an `error` metadata entry (or an `ERROR:` message prefix)
/// turns the call into `InvalidArgument`. This makes every stage of a bridged
/// response observable from the client side.
#[derive(Debug, Default, Clone)]
pub struct EchoService;

type ResponseStream = Pin<Box<dyn Stream<Item = Result<EchoResponse, Status>> + Send>>;

impl EchoService {
    /// Copies `header-echo` metadata onto a response as
    /// `header-echo-response`.
    fn echo_headers<T>(request_metadata: &MetadataMap, response: &mut Response<T>) {
        for value in request_metadata.get_all("header-echo") {
            response
                .metadata_mut()
                .append("header-echo-response", value.clone());
        }
    }

    /// Builds the trailing metadata echoed on error statuses.
    fn echo_trailers(request_metadata: &MetadataMap) -> MetadataMap {
        let mut trailers = MetadataMap::new();
        for value in request_metadata.get_all("trailer-echo") {
            trailers.append("trailer-echo-response", value.clone());
        }
        trailers
    }

    fn invalid_argument(request_metadata: &MetadataMap, message: impl Into<String>) -> Status {
        Status::with_metadata(
            Code::InvalidArgument,
            message,
            Self::echo_trailers(request_metadata),
        )
    }

    /// The `error` metadata entry fails the call before any message is sent.
    fn error_from_metadata(request_metadata: &MetadataMap) -> Result<(), Status> {
        if let Some(value) = request_metadata.get("error") {
            let message = value.to_str().unwrap_or_default().to_owned();
            return Err(Self::invalid_argument(request_metadata, message));
        }
        Ok(())
    }

    fn check_message(request_metadata: &MetadataMap, message: &str) -> Result<(), Status> {
        if let Some(rest) = message.strip_prefix("ERROR:") {
            return Err(Self::invalid_argument(request_metadata, rest.to_owned()));
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl Echo for EchoService {
    async fn unary_echo(
        &self,
        request: Request<EchoRequest>,
    ) -> Result<Response<EchoResponse>, Status> {
        let (metadata, _, req) = request.into_parts();
        Self::error_from_metadata(&metadata)?;
        Self::check_message(&metadata, &req.message)?;

        let mut response = Response::new(EchoResponse {
            message: req.message,
        });
        Self::echo_headers(&metadata, &mut response);
        Ok(response)
    }

    type ServerStreamingEchoStream = ResponseStream;

    async fn server_streaming_echo(
        &self,
        request: Request<EchoRequest>,
    ) -> Result<Response<Self::ServerStreamingEchoStream>, Status> {
        let (metadata, _, req) = request.into_parts();
        Self::error_from_metadata(&metadata)?;

        let mut items: Vec<Result<EchoResponse, Status>> = Vec::new();
        for line in req.message.split('\n') {
            if let Some(rest) = line.strip_prefix("ERROR:") {
                items.push(Err(Self::invalid_argument(&metadata, rest.to_owned())));
                break;
            }
            if line == "HEADERS" {
                // Initial metadata always precedes the stream; nothing to
                // flush explicitly here.
                continue;
            }
            items.push(Ok(EchoResponse {
                message: line.to_owned(),
            }));
        }

        let mut response: Response<Self::ServerStreamingEchoStream> =
            Response::new(Box::pin(tokio_stream::iter(items)));
        Self::echo_headers(&metadata, &mut response);
        Ok(response)
    }

    async fn client_streaming_echo(
        &self,
        request: Request<Streaming<EchoRequest>>,
    ) -> Result<Response<EchoResponse>, Status> {
        let (metadata, _, mut stream) = request.into_parts();
        Self::error_from_metadata(&metadata)?;

        let mut messages = Vec::new();
        while let Some(msg) = stream.message().await? {
            Self::check_message(&metadata, &msg.message)?;
            if msg.message == "HEADERS" {
                continue;
            }
            messages.push(msg.message);
        }

        let mut response = Response::new(EchoResponse {
            message: messages.join("\n"),
        });
        Self::echo_headers(&metadata, &mut response);
        Ok(response)
    }

    type BidirectionalStreamingEchoStream = ResponseStream;

    async fn bidirectional_streaming_echo(
        &self,
        request: Request<Streaming<EchoRequest>>,
    ) -> Result<Response<Self::BidirectionalStreamingEchoStream>, Status> {
        let (metadata, _, stream) = request.into_parts();
        Self::error_from_metadata(&metadata)?;

        let errors = metadata.clone();
        let output = stream.filter_map(move |msg| match msg {
            Ok(req) if req.message == "HEADERS" => None,
            Ok(req) => match Self::check_message(&errors, &req.message) {
                Ok(()) => Some(Ok(EchoResponse {
                    message: req.message,
                })),
                Err(status) => Some(Err(status)),
            },
            Err(status) => Some(Err(status)),
        });

        let mut response: Response<Self::BidirectionalStreamingEchoStream> =
            Response::new(Box::pin(output));
        Self::echo_headers(&metadata, &mut response);
        Ok(response)
    }
}
