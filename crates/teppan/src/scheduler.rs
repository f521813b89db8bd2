//! # Scheduling Loop
//!
//! The background driver for streaming requests. Each cycle takes the next
//! batch of streaming contexts, advances it by one token through the bridge
//! and routes every token to its request's stream.
//!
//! When nothing is waiting the loop idles until a request is admitted or the
//! poll interval passes, whichever comes first.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info, trace, warn};
use uuid::Uuid;

use crate::bridge::ExecutorBridge;
use crate::error::Result;
use crate::queue::{AdmissionQueue, StepSummary};

/// What one cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cycle {
    /// No streaming context was waiting
    Idle,
    /// One batch was advanced
    Dispatched(StepSummary),
}

pub(crate) struct Scheduler {
    queue: Arc<AdmissionQueue>,
    bridge: Arc<ExecutorBridge>,
    max_tokens: usize,
    max_retries: u32,
    poll_interval: Duration,
}

impl Scheduler {
    pub(crate) fn new(
        queue: Arc<AdmissionQueue>,
        bridge: Arc<ExecutorBridge>,
        max_tokens: usize,
        max_retries: u32,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            bridge,
            max_tokens,
            max_retries,
            poll_interval,
        }
    }

    /// Advance the next streaming batch by one token.
    ///
    /// A transient bridge failure puts the batch back at the head of the
    /// queue, failing requests that have used up their retries; any other
    /// failure closes the batch's streams with the error.
    pub(crate) async fn run_cycle(&self) -> Result<Cycle> {
        let batch = self.queue.next_batch(true).await;
        if batch.is_empty() {
            return Ok(Cycle::Idle);
        }

        match self.bridge.execute_step(&batch).await {
            Ok(outputs) => {
                let summary = self.queue.apply_steps(&batch, outputs, self.max_tokens).await;
                Ok(Cycle::Dispatched(summary))
            }
            Err(e) => {
                let ids: Vec<Uuid> = batch.iter().map(|entry| entry.request_id).collect();
                if e.is_transient() {
                    self.queue.retry_or_abort(&ids, &e, self.max_retries).await;
                } else {
                    error!(error = %e, batch = ids.len(), "closing streams after failed step");
                    self.queue.abort(&ids, &e).await;
                }
                Err(e)
            }
        }
    }

    /// Run cycles until `running` is cleared
    pub(crate) async fn run(self, running: Arc<AtomicBool>, notifier: Arc<Notify>) {
        info!("scheduling loop started");
        while running.load(Ordering::SeqCst) {
            match self.run_cycle().await {
                Ok(Cycle::Idle) => {
                    let _ = tokio::time::timeout(self.poll_interval, notifier.notified()).await;
                }
                Ok(Cycle::Dispatched(summary)) => {
                    trace!(
                        delivered = summary.delivered,
                        finished = summary.finished,
                        dropped = summary.dropped,
                        requeued = summary.requeued,
                        "step dispatched"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "scheduling cycle failed");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
        info!("scheduling loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::EchoModel;
    use crate::config::WorkerConfig;
    use crate::error::Error;
    use crate::stream::StreamEvent;
    use tokio::sync::mpsc;

    async fn scheduler(model: EchoModel, batch_size: usize, max_tokens: usize) -> Scheduler {
        let bridge = ExecutorBridge::new(
            move |_: &str| -> Result<EchoModel> { Ok(model.clone()) },
            WorkerConfig::default(),
        );
        bridge.setup("echo").await.unwrap();
        Scheduler::new(
            Arc::new(AdmissionQueue::new(batch_size)),
            Arc::new(bridge),
            max_tokens,
            2,
            Duration::from_millis(10),
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_idle_when_nothing_is_streaming() {
        let scheduler = scheduler(EchoModel::default(), 4, 20).await;
        scheduler.queue.submit("not streamed").await;
        assert_eq!(scheduler.run_cycle().await.unwrap(), Cycle::Idle);
    }

    #[tokio::test]
    async fn test_cycles_stream_until_end_of_sequence() {
        let scheduler = scheduler(EchoModel::eos_after(4), 4, 20).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = scheduler.queue.submit_streaming("ab", tx).await;

        // "ab" -> "aba" -> "abaa" -> end of sequence
        for _ in 0..3 {
            assert!(matches!(scheduler.run_cycle().await.unwrap(), Cycle::Dispatched(_)));
        }
        assert_eq!(scheduler.run_cycle().await.unwrap(), Cycle::Idle);

        assert_eq!(
            drain(&mut rx),
            vec![
                StreamEvent::Token { token: "a".into(), sequence_id: id },
                StreamEvent::Token { token: "a".into(), sequence_id: id },
                StreamEvent::End { sequence_id: id },
            ]
        );
        assert!(scheduler.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_round_robin_beyond_batch_size() {
        let scheduler = scheduler(EchoModel::default(), 2, 2).await;
        let mut streams = Vec::new();
        for prompt in ["a", "b", "c"] {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = scheduler.queue.submit_streaming(prompt, tx).await;
            streams.push((prompt, id, rx));
        }

        while scheduler.run_cycle().await.unwrap() != Cycle::Idle {}

        for (prompt, id, rx) in streams.iter_mut() {
            let events = drain(rx);
            assert_eq!(
                events,
                vec![
                    StreamEvent::Token { token: prompt.to_string(), sequence_id: *id },
                    StreamEvent::Token { token: prompt.to_string(), sequence_id: *id },
                    StreamEvent::End { sequence_id: *id },
                ]
            );
        }
    }

    #[tokio::test]
    async fn test_model_failure_closes_the_batch() {
        let model = EchoModel {
            fail_on: Some("bad".into()),
            ..EchoModel::default()
        };
        let scheduler = scheduler(model, 4, 20).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = scheduler.queue.submit_streaming("bad", tx).await;

        let err = scheduler.run_cycle().await.unwrap_err();
        assert!(matches!(err, Error::Model(_)));
        match rx.recv().await {
            Some(StreamEvent::Error { sequence_id, .. }) => assert_eq!(sequence_id, id),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(scheduler.queue.lookup(id).await.is_none());
    }

    #[tokio::test]
    async fn test_worker_crash_requeues_batch_at_head() {
        let model = EchoModel {
            panic_on: Some("boom".into()),
            ..EchoModel::default()
        };
        let scheduler = scheduler(model, 4, 20).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = scheduler.queue.submit_streaming("boom", tx).await;

        let err = scheduler.run_cycle().await.unwrap_err();
        assert!(matches!(err, Error::WorkerUnavailable(_)));
        assert_eq!(scheduler.queue.pending().await, 1);
        assert!(scheduler.queue.lookup(id).await.is_some());
    }

    #[tokio::test]
    async fn test_crashing_stream_is_failed_and_others_still_run() {
        let model = EchoModel {
            panic_on: Some("boom".into()),
            ..EchoModel::eos_after(3)
        };
        let scheduler = scheduler(model, 4, 20).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let boom = scheduler.queue.submit_streaming("boom", tx).await;

        // the first round plus two retries each take the worker down
        for _ in 0..3 {
            let err = scheduler.run_cycle().await.unwrap_err();
            assert!(matches!(err, Error::WorkerUnavailable(_)));
        }
        match rx.recv().await {
            Some(StreamEvent::Error { sequence_id, .. }) => assert_eq!(sequence_id, boom),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(scheduler.queue.is_empty().await);

        // the worker is relaunched for the next request
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ok = scheduler.queue.submit_streaming("ok", tx).await;
        while scheduler.run_cycle().await.unwrap() != Cycle::Idle {}
        assert_eq!(
            drain(&mut rx),
            vec![
                StreamEvent::Token { token: "o".into(), sequence_id: ok },
                StreamEvent::End { sequence_id: ok },
            ]
        );
    }

    #[tokio::test]
    async fn test_run_stops_when_flag_clears() {
        let scheduler = scheduler(EchoModel::default(), 4, 20).await;
        let running = Arc::new(AtomicBool::new(true));
        let notifier = Arc::new(Notify::new());
        let task = tokio::spawn(scheduler.run(running.clone(), notifier.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        running.store(false, Ordering::SeqCst);
        notifier.notify_one();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
