use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

pub(crate) type StreamSender<T, E> = mpsc::UnboundedSender<Result<T, E>>;

/// Events of a streaming request.
///
/// Yields progress events until the request completes, in which case the
/// stream simply ends, or fails, in which case the error is the last item.
/// Dropping the stream unsubscribes without cancelling the request.
#[derive(Debug)]
pub struct RequestStream<T, E> {
    rx: mpsc::UnboundedReceiver<Result<T, E>>,
    finished: bool,
}

impl<T, E> Unpin for RequestStream<T, E> {}

impl<T, E> RequestStream<T, E> {
    pub(crate) fn channel() -> (StreamSender<T, E>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                rx,
                finished: false,
            },
        )
    }

    /// A stream that fails immediately, for requests rejected before they
    /// reached the connection manager.
    pub(crate) fn failed(error: E) -> Self {
        let (tx, stream) = Self::channel();
        let _ = tx.send(Err(error));
        stream
    }
}

impl<T, E> Stream for RequestStream<T, E> {
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Err(error))) => {
                this.finished = true;
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}
