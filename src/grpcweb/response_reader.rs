use std::{
    pin::Pin,
    task::{ready, Context, Poll},
};

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use http_body::{Body, Frame};
use pin_project::pin_project;
use tokio_util::codec::Decoder;

use crate::{
    frame::{FrameCodec, FrameDecodeError},
    trailers::{parse_trailers, TrailerParseError},
    BoxError,
};

/// Errors surfaced by [`ResponseReader`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WebResponseError {
    #[error("received data after the trailer frame")]
    DataAfterTrailers,

    #[error("response stream ended without trailers")]
    MissingTrailers,

    #[error("compression flag is set; compressed trailer frames are not supported")]
    CompressedTrailers,

    #[error(transparent)]
    Frame(#[from] FrameDecodeError),

    #[error(transparent)]
    Trailers(#[from] TrailerParseError),

    #[error("reading response body: {0}")]
    Body(String),
}

#[derive(Debug)]
enum ReadState {
    /// Forwarding data frames, waiting for the trailer frame.
    ReadingData,
    /// Trailer frame seen and parsed; only end-of-stream may follow.
    ReadingTrailer(HeaderMap),
    Done,
}

/// Streaming decoder for a gRPC-Web response body.
///
/// Data frames are forwarded verbatim (header bytes included), so the
/// wrapped body reads exactly like a native gRPC response body. The single
/// terminal trailer frame is split off, parsed, and yielded as HTTP
/// trailers. Errors latch: once a poll has failed, every subsequent poll
/// returns the same error.
#[pin_project]
pub struct ResponseReader<B> {
    #[pin]
    inner: B,
    codec: FrameCodec,
    buf: BytesMut,
    state: ReadState,
    consumed: u64,
    failed: Option<WebResponseError>,
}

impl<B> ResponseReader<B> {
    pub fn new(inner: B) -> Self {
        ResponseReader {
            inner,
            codec: FrameCodec::new(),
            buf: BytesMut::new(),
            state: ReadState::ReadingData,
            consumed: 0,
            failed: None,
        }
    }
}

impl<B> Body for ResponseReader<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = WebResponseError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, WebResponseError>>> {
        let mut this = self.project();

        if let Some(err) = this.failed {
            return Poll::Ready(Some(Err(err.clone())));
        }

        macro_rules! fail {
            ($err:expr) => {{
                let err: WebResponseError = $err;
                *this.failed = Some(err.clone());
                return Poll::Ready(Some(Err(err)));
            }};
        }

        loop {
            match this.state {
                ReadState::Done => return Poll::Ready(None),
                ReadState::ReadingData => {
                    match this.codec.decode(this.buf) {
                        Ok(Some(frame)) => {
                            if frame.is_metadata() {
                                if frame.is_compressed() {
                                    fail!(WebResponseError::CompressedTrailers);
                                }
                                match parse_trailers(&frame.payload) {
                                    Ok(map) => {
                                        *this.state = ReadState::ReadingTrailer(map);
                                        continue;
                                    }
                                    Err(err) => fail!(err.into()),
                                }
                            }
                            // Forward the complete frame, header included.
                            return Poll::Ready(Some(Ok(Frame::data(frame.into_bytes()))));
                        }
                        Ok(None) => {}
                        Err(err) => fail!(err.into()),
                    }
                }
                ReadState::ReadingTrailer(_) => {
                    if !this.buf.is_empty() {
                        fail!(WebResponseError::DataAfterTrailers);
                    }
                }
            }

            match ready!(this.inner.as_mut().poll_frame(cx)) {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        if data.is_empty() {
                            continue;
                        }
                        if matches!(this.state, ReadState::ReadingTrailer(_)) {
                            fail!(WebResponseError::DataAfterTrailers);
                        }
                        *this.consumed += data.len() as u64;
                        this.buf.extend_from_slice(&data);
                    }
                    // An HTTP/1.1 response body has no native trailers;
                    // anything the inner body reports as one is dropped.
                }
                Some(Err(err)) => {
                    let err: crate::BoxError = err.into();
                    fail!(WebResponseError::Body(err.to_string()));
                }
                None => match std::mem::replace(this.state, ReadState::Done) {
                    ReadState::ReadingData => {
                        if *this.consumed == 0 && this.buf.is_empty() {
                            // An entirely empty body is a valid trailers-only
                            // response whose status travelled in the headers.
                            return Poll::Ready(None);
                        }
                        fail!(WebResponseError::MissingTrailers);
                    }
                    ReadState::ReadingTrailer(map) => {
                        return Poll::Ready(Some(Ok(Frame::trailers(map))));
                    }
                    ReadState::Done => return Poll::Ready(None),
                },
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        matches!(self.state, ReadState::Done)
    }
}
