use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::queue::AdmissionQueue;

/// Producer half of a completion sink, owned by the generation context
pub(crate) type CompletionSender = oneshot::Sender<Result<String>>;

/// # PendingCompletion
///
/// A future resolving to the full generated text of one run-to-completion
/// request. Whoever executes the batch containing the request settles it, so
/// the future resolves even when another caller drained the queue.
///
/// Resolves to [`Error::Cancelled`] if the request is removed before a result
/// is produced. Dropping it unresolved withdraws the request from the
/// admission queue.
pub struct PendingCompletion {
    id: Uuid,
    receiver: oneshot::Receiver<Result<String>>,
    queue: Option<Arc<AdmissionQueue>>,
    resolved: bool,
}

impl PendingCompletion {
    pub(crate) fn new(id: Uuid, receiver: oneshot::Receiver<Result<String>>, queue: Arc<AdmissionQueue>) -> Self {
        Self {
            id,
            receiver,
            queue: Some(queue),
            resolved: false,
        }
    }

    /// Completion over a bare receiver, with no queue to withdraw from on drop
    pub fn detached(id: Uuid, receiver: oneshot::Receiver<Result<String>>) -> Self {
        Self {
            id,
            receiver,
            queue: None,
            resolved: false,
        }
    }

    /// The request id this completion belongs to
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Future for PendingCompletion {
    type Output = Result<String>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let outcome = match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => result,
            Poll::Ready(Err(_)) => Err(Error::Cancelled(this.id)),
            Poll::Pending => return Poll::Pending,
        };
        this.resolved = true;
        Poll::Ready(outcome)
    }
}

impl Drop for PendingCompletion {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        let Some(queue) = self.queue.take() else {
            return;
        };
        let id = self.id;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if queue.remove(id).await {
                    tracing::debug!(request_id = %id, "completion dropped by caller, request withdrawn");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_resolves_to_sent_text() {
        let (tx, rx) = oneshot::channel();
        let pending = PendingCompletion::detached(Uuid::new_v4(), rx);
        tx.send(Ok("generated".to_string())).unwrap();
        assert_eq!(pending.await.unwrap(), "generated");
    }

    #[tokio::test]
    async fn test_dropped_sender_is_cancellation() {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel::<Result<String>>();
        let pending = PendingCompletion::detached(id, rx);
        drop(tx);
        assert_eq!(pending.await.unwrap_err(), Error::Cancelled(id));
    }

    #[tokio::test]
    async fn test_drop_before_result_withdraws_request() {
        let queue = Arc::new(AdmissionQueue::new(4));
        let pending = queue.submit_awaiting("prompt").await;
        let id = pending.id();
        assert_eq!(queue.pending().await, 1);

        drop(pending);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(queue.lookup(id).await.is_none());
        assert!(queue.next_batch(false).await.is_empty());
    }

    #[tokio::test]
    async fn test_drop_after_result_leaves_queue_alone() {
        let queue = Arc::new(AdmissionQueue::new(4));
        let pending = queue.submit_awaiting("prompt").await;
        let id = pending.id();
        let parked = queue.submit("parked").await;

        let batch = queue.next_batch(false).await;
        assert_eq!(batch.len(), 2);
        queue
            .settle_completions(vec![crate::protocol::Completion {
                request_id: id,
                generated_text: "prompt and more".into(),
            }])
            .await;
        assert_eq!(pending.await.unwrap(), "prompt and more");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.lookup(parked).await.is_some());
    }
}
