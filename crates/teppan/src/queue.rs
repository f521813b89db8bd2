//! # Admission Queue
//!
//! The FIFO of pending generation contexts plus the id → context registry.
//!
//! Every mutation (admission, batch extraction, re-admission, removal and
//! result settlement) happens under a single lock, so a context is never seen
//! half-updated and never appears twice in the admission order.
//!
//! A context leaves the admission order when it is handed out in a batch and
//! stays in the registry while its batch is in flight. Streaming contexts that
//! are not finished after a step are re-admitted at the tail, which gives
//! round-robin scheduling across more than `batch_size` concurrent streams.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::completion::PendingCompletion;
use crate::context::{ContextSnapshot, GenerationContext, Mode, Sink};
use crate::error::Error;
use crate::protocol::{BatchEntry, Completion, StepOutput};
use crate::stream::StreamSender;

#[derive(Default)]
struct Registry {
    order: VecDeque<Uuid>,
    contexts: HashMap<Uuid, GenerationContext>,
}

impl Registry {
    fn admit(&mut self, mut ctx: GenerationContext) -> Uuid {
        let id = ctx.id();
        ctx.queued = true;
        self.order.push_back(id);
        self.contexts.insert(id, ctx);
        id
    }

    fn remove(&mut self, id: Uuid) -> Option<GenerationContext> {
        let ctx = self.contexts.remove(&id)?;
        if ctx.queued {
            self.order.retain(|queued| *queued != id);
        }
        Some(ctx)
    }
}

/// What happened to one step's worth of results
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StepSummary {
    /// Tokens written to a sink
    pub delivered: usize,
    /// Contexts that received their terminal signal
    pub finished: usize,
    /// Results for contexts that no longer exist or whose client went away
    pub dropped: usize,
    /// Contexts re-admitted at the tail of the queue
    pub requeued: usize,
}

pub struct AdmissionQueue {
    registry: Mutex<Registry>,
    batch_size: usize,
}

impl AdmissionQueue {
    /// Create an empty queue handing out batches of at most `batch_size`
    pub fn new(batch_size: usize) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Admit a run-to-completion request with no sink.
    ///
    /// The generated text stays in the registry once the request completes so
    /// it can be read back with [`AdmissionQueue::lookup`].
    pub async fn submit(&self, prompt: impl Into<String>) -> Uuid {
        let ctx = GenerationContext::new(prompt.into(), Mode::Complete, None);
        let id = self.registry.lock().await.admit(ctx);
        debug!(request_id = %id, "admitted request");
        id
    }

    /// Admit a streaming request whose tokens are written to `sink`
    pub async fn submit_streaming(&self, prompt: impl Into<String>, sink: StreamSender) -> Uuid {
        let ctx = GenerationContext::new(prompt.into(), Mode::Stream, Some(Sink::Stream(sink)));
        let id = self.registry.lock().await.admit(ctx);
        debug!(request_id = %id, "admitted streaming request");
        id
    }

    /// Admit a run-to-completion request and get a future for its result
    pub async fn submit_awaiting(self: &Arc<Self>, prompt: impl Into<String>) -> PendingCompletion {
        let (tx, rx) = oneshot::channel();
        let ctx = GenerationContext::new(prompt.into(), Mode::Complete, Some(Sink::Completion(tx)));
        let id = self.registry.lock().await.admit(ctx);
        debug!(request_id = %id, "admitted request");
        PendingCompletion::new(id, rx, self.clone())
    }

    /// Take up to `batch_size` pending contexts of the requested mode.
    ///
    /// Contexts are taken in admission order and leave the admission order;
    /// contexts of the other mode keep their place. Each entry carries the
    /// prompt followed by everything generated so far.
    pub async fn next_batch(&self, streaming: bool) -> Vec<BatchEntry> {
        let wanted = if streaming { Mode::Stream } else { Mode::Complete };
        let mut registry = self.registry.lock().await;
        let Registry { order, contexts } = &mut *registry;

        let mut batch = Vec::with_capacity(self.batch_size);
        order.retain(|id| {
            if batch.len() == self.batch_size {
                return true;
            }
            match contexts.get_mut(id) {
                Some(ctx) if ctx.mode() == wanted && !ctx.is_finished() => {
                    ctx.queued = false;
                    batch.push(BatchEntry {
                        request_id: *id,
                        prompt: ctx.input_text(),
                    });
                    false
                }
                Some(_) => true,
                None => false,
            }
        });
        batch
    }

    /// Read-only copy of a registered context
    pub async fn lookup(&self, id: Uuid) -> Option<ContextSnapshot> {
        self.registry.lock().await.contexts.get(&id).map(|ctx| ctx.snapshot())
    }

    /// Deregister a context.
    ///
    /// Idempotent. Dropping the context drops its sink: a stream ends and a
    /// pending completion resolves to [`Error::Cancelled`]. Returns whether a
    /// context was removed.
    pub async fn remove(&self, id: Uuid) -> bool {
        let removed = self.registry.lock().await.remove(id).is_some();
        if removed {
            debug!(request_id = %id, "removed request");
        }
        removed
    }

    /// Number of registered contexts, in flight or not
    pub async fn len(&self) -> usize {
        self.registry.lock().await.contexts.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of contexts waiting in the admission order
    pub async fn pending(&self) -> usize {
        self.registry.lock().await.order.len()
    }

    /// Re-admit unfinished contexts at the tail, in the given order
    pub async fn requeue(&self, ids: &[Uuid]) -> usize {
        let mut registry = self.registry.lock().await;
        requeue_locked(&mut registry, ids)
    }

    /// Handle a batch whose round was lost to an unavailable worker.
    ///
    /// Every context in the batch is charged one retry. Those still within
    /// `max_retries` go back to the head of the queue in batch order, so the
    /// batch keeps its FIFO position; the others are failed with `error` and
    /// deregistered. Returns the number of contexts failed.
    pub(crate) async fn retry_or_abort(&self, ids: &[Uuid], error: &Error, max_retries: u32) -> usize {
        let mut guard = self.registry.lock().await;
        let registry = &mut *guard;
        let mut failed = 0;
        for id in ids.iter().rev() {
            let Some(ctx) = registry.contexts.get_mut(id) else {
                continue;
            };
            ctx.retries += 1;
            if ctx.retries > max_retries {
                if let Some(mut ctx) = registry.remove(*id) {
                    warn!(request_id = %id, retries = max_retries, "giving up on request");
                    ctx.fail(error);
                    failed += 1;
                }
            } else if !ctx.is_finished() && !ctx.queued {
                ctx.queued = true;
                registry.order.push_front(*id);
            }
        }
        failed
    }

    /// Close the given contexts with an error and deregister them
    pub(crate) async fn abort(&self, ids: &[Uuid], error: &Error) {
        let mut registry = self.registry.lock().await;
        for id in ids {
            if let Some(mut ctx) = registry.remove(*id) {
                ctx.fail(error);
            }
        }
    }

    /// Close every registered context with an error and clear the queue
    pub(crate) async fn close_all(&self, error: &Error) -> usize {
        let mut registry = self.registry.lock().await;
        registry.order.clear();
        let contexts: Vec<GenerationContext> = registry.contexts.drain().map(|(_, ctx)| ctx).collect();
        let count = contexts.len();
        for mut ctx in contexts {
            ctx.fail(error);
        }
        count
    }

    /// Settle full completions.
    ///
    /// A context with a sink is resolved and deregistered; a bare submission
    /// keeps its result in the registry. Completions for unknown ids are
    /// dropped. Returns the number of contexts settled.
    pub(crate) async fn settle_completions(&self, completions: Vec<Completion>) -> usize {
        let mut registry = self.registry.lock().await;
        let mut settled = 0;
        for completion in completions {
            let id = completion.request_id;
            let Some(ctx) = registry.contexts.get_mut(&id) else {
                debug!(request_id = %id, "dropping completion for removed request");
                continue;
            };
            let owned = ctx.has_sink();
            ctx.complete(completion.generated_text);
            if owned {
                registry.remove(id);
            }
            settled += 1;
        }
        settled
    }

    /// Route one step's results to their contexts.
    ///
    /// Results are applied in batch order. A context finishes when the worker
    /// reports end of sequence or once `max_tokens` tokens have been
    /// delivered; finished contexts get their terminal signal and are
    /// deregistered. Results for missing or finished contexts are dropped.
    /// Survivors are re-admitted at the tail in batch order.
    pub(crate) async fn apply_steps(
        &self,
        batch: &[BatchEntry],
        outputs: Vec<StepOutput>,
        max_tokens: usize,
    ) -> StepSummary {
        let mut by_id: HashMap<Uuid, StepOutput> =
            outputs.into_iter().map(|output| (output.request_id, output)).collect();

        let mut registry = self.registry.lock().await;
        let mut summary = StepSummary::default();
        let mut survivors = Vec::with_capacity(batch.len());

        for entry in batch {
            let id = entry.request_id;
            let Some(output) = by_id.remove(&id) else {
                continue;
            };
            let Some(ctx) = registry.contexts.get_mut(&id) else {
                debug!(request_id = %id, "dropping token for removed request");
                summary.dropped += 1;
                continue;
            };
            if ctx.is_finished() {
                summary.dropped += 1;
                continue;
            }

            if output.is_finished || ctx.token_count() >= max_tokens {
                ctx.close();
                registry.remove(id);
                summary.finished += 1;
                debug!(request_id = %id, eos = output.is_finished, "stream finished");
            } else if ctx.push_token(&output.token) {
                summary.delivered += 1;
                survivors.push(id);
            } else {
                registry.remove(id);
                summary.dropped += 1;
                debug!(request_id = %id, "client went away, request removed");
            }
        }

        summary.requeued = requeue_locked(&mut registry, &survivors);
        summary
    }
}

fn requeue_locked(registry: &mut Registry, ids: &[Uuid]) -> usize {
    let Registry { order, contexts } = registry;
    let mut requeued = 0;
    for id in ids {
        if let Some(ctx) = contexts.get_mut(id) {
            if !ctx.is_finished() && !ctx.queued {
                ctx.queued = true;
                order.push_back(*id);
                requeued += 1;
            }
        }
    }
    requeued
}
