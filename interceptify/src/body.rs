use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Frame, SizeHint};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use tokio::sync::mpsc;

use crate::error::BoxError;

/// Body passed between the proxy, plugins, and the upstream client.
///
/// Wraps whatever an exchange produced: a streaming upstream body, a payload
/// a plugin materialized, or a live dashboard event stream. Frames stream
/// through unless something explicitly buffers them, so large responses never
/// have to fit in memory.
pub struct Body {
    inner: BoxBody<Bytes, BoxError>,
}

impl Body {
    /// A body with no frames.
    pub fn empty() -> Self {
        Self {
            inner: Empty::new().map_err(|never| match never {}).boxed(),
        }
    }

    /// A body streaming `data: <event>\n\n` frames from an event
    /// subscription. Ends when the subscription is pruned from the bus.
    pub(crate) fn from_events(rx: mpsc::Receiver<String>) -> Self {
        Self {
            inner: BoxBody::new(EventStream { rx }),
        }
    }

    /// Buffers all remaining frames into contiguous bytes.
    pub async fn collect_bytes(self) -> Result<Bytes, BoxError> {
        Ok(self.inner.collect().await?.to_bytes())
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Incoming> for Body {
    fn from(body: Incoming) -> Self {
        Self {
            inner: body.map_err(|e| Box::new(e) as BoxError).boxed(),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self {
            inner: Full::new(bytes).map_err(|never| match never {}).boxed(),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes::from(bytes).into()
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Bytes::from(text).into()
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Bytes::from_static(text.as_bytes()).into()
    }
}

impl http_body::Body for Body {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Server-sent-events framing over a subscriber queue.
struct EventStream {
    rx: mpsc::Receiver<String>,
}

impl http_body::Body for EventStream {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                let frame = Bytes::from(format!("data: {event}\n\n"));
                Poll::Ready(Some(Ok(Frame::data(frame))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
