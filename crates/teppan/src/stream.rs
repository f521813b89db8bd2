use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::queue::AdmissionQueue;

/// An event delivered to a streaming request.
///
/// A stream is a run of `Token` events closed by exactly one `End` or
/// `Error` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    /// One decoded token for the request `sequence_id`
    Token { token: String, sequence_id: Uuid },
    /// Generation finished normally
    End { sequence_id: Uuid },
    /// Generation was closed because of a failure
    Error { sequence_id: Uuid, message: String },
}

impl StreamEvent {
    pub fn sequence_id(&self) -> Uuid {
        match self {
            StreamEvent::Token { sequence_id, .. }
            | StreamEvent::End { sequence_id }
            | StreamEvent::Error { sequence_id, .. } => *sequence_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Token { .. })
    }
}

/// Producer half of a streaming sink, owned by the generation context
pub type StreamSender = mpsc::UnboundedSender<StreamEvent>;

/// # TokenStream
///
/// The consumer half of a streaming sink: an asynchronous stream of
/// [`StreamEvent`]s for one request, in generation order.
///
/// The scheduling loop is the only producer. The stream yields the terminal
/// event and then ends; it also ends if the request is removed from the
/// admission queue without one (the sink is dropped with the context).
///
/// Dropping a `TokenStream` before its terminal event cancels the request:
/// the context is removed from the admission queue and any result still in
/// flight for it is discarded by the scheduling loop.
pub struct TokenStream {
    id: Uuid,
    receiver: mpsc::UnboundedReceiver<StreamEvent>,
    queue: Option<Arc<AdmissionQueue>>,
    terminated: bool,
}

impl TokenStream {
    pub(crate) fn new(
        id: Uuid,
        receiver: mpsc::UnboundedReceiver<StreamEvent>,
        queue: Arc<AdmissionQueue>,
    ) -> Self {
        Self {
            id,
            receiver,
            queue: Some(queue),
            terminated: false,
        }
    }

    /// Stream over a bare receiver, with no queue to cancel on drop
    pub fn detached(id: Uuid, receiver: mpsc::UnboundedReceiver<StreamEvent>) -> Self {
        Self {
            id,
            receiver,
            queue: None,
            terminated: false,
        }
    }

    /// The request id this stream belongs to
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Stream for TokenStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.terminated {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.receiver).poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    this.terminated = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                this.terminated = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        if self.terminated {
            return;
        }
        let Some(queue) = self.queue.take() else {
            return;
        };
        let id = self.id;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if queue.remove(id).await {
                    tracing::debug!(request_id = %id, "stream dropped by client, request cancelled");
                }
            });
        }
    }
}
