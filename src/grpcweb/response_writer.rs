use std::{
    pin::Pin,
    task::{ready, Context, Poll},
};

use bytes::Bytes;
use http::{
    header::{CONTENT_LENGTH, CONTENT_TYPE, TRAILER},
    HeaderValue, Response,
};
use http_body::{Body, Frame};
use pin_project::pin_project;

use crate::{grpcweb::defs::grpc_to_web_content_type, trailers::make_trailer_frame};

/// Transcodes a native gRPC response into a gRPC-Web response.
///
/// The content type is rewritten from `application/grpc[+x]` to
/// `application/grpc-web[+x]`, trailer announcements are dropped (HTTP
/// trailers must not be advertised to an HTTP/1.1 peer), and the body is
/// wrapped so the trailers it eventually yields are appended as a single
/// terminal trailer frame instead.
///
/// A trailers-only response whose status already travels in the response
/// headers passes through with the header rewrite alone; the downstream
/// response reader accepts the resulting empty body.
pub fn transcode_response<B>(response: Response<B>) -> Response<WebResponseBody<B>>
where
    B: Body<Data = Bytes>,
{
    let (mut parts, body) = response.into_parts();

    let rewritten = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(grpc_to_web_content_type)
        .and_then(|ct| HeaderValue::try_from(ct).ok());
    if let Some(content_type) = rewritten {
        parts.headers.insert(CONTENT_TYPE, content_type);
    }

    // The body length changes and trailers move into the body.
    parts.headers.remove(CONTENT_LENGTH);
    parts.headers.remove(TRAILER);

    Response::from_parts(parts, WebResponseBody::new(body))
}

/// Body adapter used by [`transcode_response`]: data frames pass through
/// unchanged, and the wrapped body's trailers are re-emitted as one trailer
/// frame at the end of the stream.
#[pin_project]
pub struct WebResponseBody<B> {
    #[pin]
    inner: B,
    finished: bool,
}

impl<B> WebResponseBody<B> {
    fn new(inner: B) -> Self {
        WebResponseBody {
            inner,
            finished: false,
        }
    }
}

impl<B> Body for WebResponseBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, B::Error>>> {
        let mut this = self.project();
        if *this.finished {
            return Poll::Ready(None);
        }
        loop {
            match ready!(this.inner.as_mut().poll_frame(cx)) {
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => return Poll::Ready(Some(Ok(Frame::data(data)))),
                    Err(frame) => {
                        let Some(trailers) = frame.trailers_ref() else {
                            continue;
                        };
                        *this.finished = true;
                        return Poll::Ready(Some(Ok(Frame::data(make_trailer_frame(trailers)))));
                    }
                },
                Some(Err(err)) => return Poll::Ready(Some(Err(err))),
                None => {
                    *this.finished = true;
                    return Poll::Ready(None);
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.finished || self.inner.is_end_stream()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpcweb::{ResponseReader, CONTENT_TYPE_GRPC_WEB};
    use http::HeaderMap;
    use http_body_util::{BodyExt, StreamBody};

    fn data_frame(payload: &str) -> Bytes {
        let mut buf = vec![0u8];
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload.as_bytes());
        buf.into()
    }

    fn grpc_response(
        frames: Vec<Bytes>,
        trailers: Option<HeaderMap>,
    ) -> Response<impl Body<Data = Bytes, Error = std::convert::Infallible>> {
        let mut items: Vec<Result<Frame<Bytes>, std::convert::Infallible>> =
            frames.into_iter().map(|b| Ok(Frame::data(b))).collect();
        if let Some(map) = trailers {
            items.push(Ok(Frame::trailers(map)));
        }
        Response::builder()
            .header(CONTENT_TYPE, "application/grpc+proto")
            .header(TRAILER, "grpc-status")
            .body(StreamBody::new(futures_util::stream::iter(items)))
            .unwrap()
    }

    #[tokio::test]
    async fn rewrites_headers_and_appends_trailer_frame() {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("0"));

        let response = transcode_response(grpc_response(
            vec![data_frame("a"), data_frame("b")],
            Some(trailers),
        ));

        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "application/grpc-web+proto"
        );
        assert!(!response.headers().contains_key(TRAILER));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let mut expected = Vec::new();
        expected.extend_from_slice(&data_frame("a"));
        expected.extend_from_slice(&data_frame("b"));
        expected.extend_from_slice(&[0x80, 0, 0, 0, 16]);
        expected.extend_from_slice(b"grpc-status: 0\r\n");
        assert_eq!(body, Bytes::from(expected));
    }

    #[tokio::test]
    async fn writer_then_reader_roundtrip() {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("0"));
        trailers.insert("trailer-echo-response", HeaderValue::from_static("T"));

        let frames = vec![data_frame("first"), data_frame("second")];
        let response = transcode_response(grpc_response(frames.clone(), Some(trailers.clone())));
        let web_body = response.into_body().collect().await.unwrap().to_bytes();

        let collected = ResponseReader::new(http_body_util::Full::new(web_body))
            .collect()
            .await
            .unwrap();
        let mut expected = Vec::new();
        for frame in &frames {
            expected.extend_from_slice(frame);
        }
        assert_eq!(collected.trailers(), Some(&trailers));
        assert_eq!(collected.to_bytes(), Bytes::from(expected));
    }

    #[tokio::test]
    async fn trailers_only_response_passes_through() {
        let response = Response::builder()
            .header(CONTENT_TYPE, "application/grpc")
            .header("grpc-status", "16")
            .body(http_body_util::Empty::<Bytes>::new())
            .unwrap();

        let response = transcode_response(response);
        assert_eq!(response.headers()[CONTENT_TYPE], CONTENT_TYPE_GRPC_WEB);
        assert_eq!(response.headers()["grpc-status"], "16");
        let body = response.into_body().collect().await.unwrap();
        assert!(body.to_bytes().is_empty());
    }
}
