//! # Engine
//!
//! Ties the pipeline together: one admission queue, one executor bridge in
//! front of one model worker, and one background scheduling loop.
//!
//! Streaming requests are served by the scheduling loop. Run-to-completion
//! requests are batched on behalf of their callers: each call spawns a task
//! that drains the queue and settles every completion it produces to
//! whichever caller owns it, whether or not the spawning caller is still
//! waiting.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::future::try_join_all;
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::ModelLoader;
use crate::bridge::ExecutorBridge;
use crate::config::EngineConfig;
use crate::context::ContextSnapshot;
use crate::core_trait::{BatchGenerator, StreamingGenerator};
use crate::error::{Error, Result};
use crate::handle::LoopHandle;
use crate::queue::AdmissionQueue;
use crate::scheduler::Scheduler;
use crate::stream::TokenStream;

pub struct Engine {
    config: EngineConfig,
    queue: Arc<AdmissionQueue>,
    bridge: Arc<ExecutorBridge>,
    scheduling_loop: Mutex<LoopHandle>,
    notifier: Arc<Notify>,
    closed: AtomicBool,
}

impl Engine {
    /// Validate `config`, start the model worker and the scheduling loop.
    ///
    /// Fails if the configuration is invalid or the model cannot be loaded.
    pub async fn start<L: ModelLoader>(config: EngineConfig, loader: L) -> Result<Self> {
        config.validate()?;

        let bridge = Arc::new(ExecutorBridge::new(loader, config.worker.clone()));
        bridge.setup(&config.model).await?;

        let queue = Arc::new(AdmissionQueue::new(config.batch_size));
        let scheduler = Scheduler::new(
            queue.clone(),
            bridge.clone(),
            config.max_tokens,
            config.max_retries,
            config.poll_interval(),
        );
        let scheduling_loop = LoopHandle::new(|running, notifier| {
            tokio::spawn(scheduler.run(running, notifier))
        });
        let notifier = scheduling_loop.notifier();

        info!(
            model = %config.model,
            batch_size = config.batch_size,
            max_tokens = config.max_tokens,
            "engine started"
        );
        Ok(Self {
            config,
            queue,
            bridge,
            scheduling_loop: Mutex::new(scheduling_loop),
            notifier,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The admission queue shared with the scheduling loop
    pub fn queue(&self) -> &Arc<AdmissionQueue> {
        &self.queue
    }

    /// Generate text for a single prompt
    pub async fn generate(&self, prompt: impl Into<String>) -> Result<String> {
        let mut texts = self.generate_batch(vec![prompt.into()]).await?;
        texts
            .pop()
            .ok_or_else(|| Error::Protocol("no text generated for the prompt".to_string()))
    }

    /// Current state of a request
    pub async fn status(&self, id: Uuid) -> Result<ContextSnapshot> {
        self.queue.lookup(id).await.ok_or(Error::NotFound(id))
    }

    /// Cancel a request; returns whether it was still registered
    pub async fn cancel(&self, id: Uuid) -> bool {
        let cancelled = self.queue.remove(id).await;
        if cancelled {
            info!(request_id = %id, "request cancelled");
        }
        cancelled
    }

    /// Whether the engine accepts new requests
    pub fn is_running(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Whether requests can currently be served: the engine is open and the
    /// model worker is attached or can be relaunched
    pub async fn is_healthy(&self) -> bool {
        self.is_running() && self.bridge.is_available().await
    }

    /// Stop the scheduling loop, close every open request and stop the worker.
    ///
    /// Open streams end with an error event and pending completions resolve
    /// to [`Error::ShutDown`]. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("engine shutting down");
        self.scheduling_loop.lock().await.stop().await;
        let closed = self.queue.close_all(&Error::ShutDown).await;
        if closed > 0 {
            info!(requests = closed, "closed open requests");
        }
        self.bridge.shutdown().await;
        info!("engine shut down");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ShutDown);
        }
        Ok(())
    }
}

/// Run waiting run-to-completion batches until the queue holds none.
///
/// A batch that lost its worker goes back to the head of the queue, within
/// each request's retry budget; any other failure fails the whole batch.
async fn drain_completions(queue: Arc<AdmissionQueue>, bridge: Arc<ExecutorBridge>, max_retries: u32) {
    loop {
        let batch = queue.next_batch(false).await;
        if batch.is_empty() {
            return;
        }
        match bridge.execute_complete(&batch).await {
            Ok(completions) => {
                queue.settle_completions(completions).await;
            }
            Err(e) => {
                let ids: Vec<Uuid> = batch.iter().map(|entry| entry.request_id).collect();
                if e.is_transient() {
                    warn!(error = %e, batch = ids.len(), "completion batch lost its worker");
                    queue.retry_or_abort(&ids, &e, max_retries).await;
                } else {
                    warn!(error = %e, batch = ids.len(), "completion batch failed");
                    queue.abort(&ids, &e).await;
                }
            }
        }
    }
}

#[async_trait]
impl BatchGenerator for Engine {
    async fn generate_batch(&self, prompts: Vec<String>) -> Result<Vec<String>> {
        self.ensure_open()?;
        if prompts.is_empty() {
            return Ok(Vec::new());
        }

        let mut pending = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            pending.push(self.queue.submit_awaiting(prompt).await);
        }

        // a batch taken from the queue is settled even if this caller is dropped mid-round
        let rounds = tokio::spawn(drain_completions(
            self.queue.clone(),
            self.bridge.clone(),
            self.config.max_retries,
        ));
        if let Err(e) = rounds.await {
            warn!(error = %e, "completion rounds ended abnormally");
            let ids: Vec<Uuid> = pending.iter().map(|p| p.id()).collect();
            let error = Error::WorkerUnavailable(format!("completion rounds ended abnormally: {e}"));
            self.queue.abort(&ids, &error).await;
        }

        try_join_all(pending).await
    }
}

#[async_trait]
impl StreamingGenerator for Engine {
    async fn generate_stream(&self, prompt: String) -> Result<TokenStream> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.queue.submit_streaming(prompt, tx).await;
        self.notifier.notify_one();
        Ok(TokenStream::new(id, rx, self.queue.clone()))
    }
}
