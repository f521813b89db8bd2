//! # Executor Bridge
//!
//! Marshals batches to the model worker across the thread boundary and owns
//! the worker's lifecycle.
//!
//! Round-trips are serialized: the bridge holds its lock from sending a task
//! until the matching result arrives, so exactly one batch is in flight.
//!
//! ## Failures
//!
//! - No reply within the timeout, or the worker thread exited: the link is torn
//!   down and the call fails with [`Error::WorkerUnavailable`]. The next call
//!   relaunches the worker. After `max_restarts` relaunches in a row fail to
//!   bring a worker up, calls fail with [`Error::WorkerStart`] until the
//!   restart cooldown has passed, then relaunching is tried again.
//! - The caller went away while its task was in flight: the reply is read and
//!   discarded by the next round-trip before it sends its own task.
//! - A reply that does not answer the request (wrong tag, missing or unknown
//!   ids): the bridge is poisoned and refuses all further work with
//!   [`Error::Protocol`].

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::backend::ModelLoader;
use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::protocol::{BatchEntry, Completion, StepOutput, Task, TaskKind, TaskResult, ensure_answers};
use crate::worker::spawn_worker;

/// Starts a worker for a model id on the given channel ends
pub(crate) type Launcher = Arc<
    dyn Fn(&str, mpsc::Receiver<Task>, mpsc::Sender<TaskResult>) -> Result<JoinHandle<()>> + Send + Sync,
>;

struct Link {
    tasks: mpsc::Sender<Task>,
    results: mpsc::Receiver<TaskResult>,
    thread: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    model_id: Option<String>,
    link: Option<Link>,
    /// Consecutive relaunches that failed to bring a worker up
    restarts: u32,
    last_failed_restart: Option<Instant>,
    /// Tasks sent on the current link whose reply has not been read
    unanswered: usize,
    poisoned: Option<String>,
    stopped: bool,
}

pub struct ExecutorBridge {
    launcher: Launcher,
    config: WorkerConfig,
    state: Mutex<State>,
}

impl ExecutorBridge {
    /// Bridge to workers running models produced by `loader`
    pub fn new<L: ModelLoader>(loader: L, config: WorkerConfig) -> Self {
        let loader = Arc::new(loader);
        let worker_config = config.clone();
        let launcher: Launcher = Arc::new(
            move |model_id: &str, tasks: mpsc::Receiver<Task>, results: mpsc::Sender<TaskResult>| {
                spawn_worker(loader.clone(), model_id.to_string(), worker_config.clone(), tasks, results)
            },
        );
        Self::with_launcher(launcher, config)
    }

    pub(crate) fn with_launcher(launcher: Launcher, config: WorkerConfig) -> Self {
        Self {
            launcher,
            config,
            state: Mutex::new(State::default()),
        }
    }

    /// Start the worker for `model_id` and wait until its model is loaded.
    ///
    /// Fails with [`Error::WorkerStart`] if the model cannot be loaded within
    /// the startup timeout.
    pub async fn setup(&self, model_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.stopped {
            return Err(Error::ShutDown);
        }
        if let Some(link) = state.link.take() {
            release(link);
        }
        state.model_id = Some(model_id.to_string());
        state.restarts = 0;
        state.last_failed_restart = None;
        state.unanswered = 0;
        state.poisoned = None;
        state.link = Some(self.launch(model_id).await?);
        Ok(())
    }

    /// Run a batch to completion
    pub async fn execute_complete(&self, batch: &[BatchEntry]) -> Result<Vec<Completion>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        match self.round_trip(Task::Complete(batch.to_vec())).await? {
            TaskResult::Complete(completions) => {
                self.check_answers(batch, completions.iter().map(|c| c.request_id)).await?;
                Ok(completions)
            }
            TaskResult::Failed(message) => Err(Error::Model(message)),
            other => Err(self.unexpected(TaskKind::Complete, &other).await),
        }
    }

    /// Advance a batch by one token
    pub async fn execute_step(&self, batch: &[BatchEntry]) -> Result<Vec<StepOutput>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        match self.round_trip(Task::Step(batch.to_vec())).await? {
            TaskResult::Step(outputs) => {
                self.check_answers(batch, outputs.iter().map(|o| o.request_id)).await?;
                Ok(outputs)
            }
            TaskResult::Failed(message) => Err(Error::Model(message)),
            other => Err(self.unexpected(TaskKind::Step, &other).await),
        }
    }

    /// Stop the worker and release the channels.
    ///
    /// Sends the stop sentinel and waits, bounded by the worker timeout, for
    /// the thread to exit. Idempotent, and a no-op if the worker never started.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if state.stopped {
            return;
        }
        state.stopped = true;
        let Some(link) = state.link.take() else {
            return;
        };

        let Link { tasks, results, thread } = link;
        if tokio::time::timeout(self.config.timeout(), tasks.send(Task::Stop)).await.is_err() {
            warn!("model worker did not accept the stop request");
        }
        drop(tasks);
        drop(results);

        let joined = tokio::time::timeout(
            self.config.timeout(),
            tokio::task::spawn_blocking(move || thread.join()),
        )
        .await;
        match joined {
            Ok(Ok(Ok(()))) => info!("model worker shut down"),
            Ok(_) => warn!("model worker ended abnormally"),
            Err(_) => warn!("model worker did not exit in time; detaching it"),
        }
    }

    /// Whether a worker is currently attached and accepting tasks
    pub async fn is_running(&self) -> bool {
        let state = self.state.lock().await;
        !state.stopped && state.poisoned.is_none() && state.link.is_some()
    }

    /// Whether the next round-trip can reach a worker: one is attached, or a
    /// relaunch would be attempted.
    ///
    /// False once the bridge is stopped or poisoned, and while relaunching is
    /// paused after repeated failed restarts.
    pub async fn is_available(&self) -> bool {
        let state = self.state.lock().await;
        if state.stopped || state.poisoned.is_some() || state.model_id.is_none() {
            return false;
        }
        state.link.is_some() || !self.restarts_paused(&state)
    }

    async fn launch(&self, model_id: &str) -> Result<Link> {
        let capacity = self.config.channel_capacity.max(1);
        let (task_tx, task_rx) = mpsc::channel(capacity);
        let (result_tx, mut result_rx) = mpsc::channel(capacity);
        let thread = (self.launcher)(model_id, task_rx, result_tx)?;

        let startup = self.config.startup_timeout();
        match tokio::time::timeout(startup, result_rx.recv()).await {
            Ok(Some(TaskResult::Ready)) => {
                info!(model = %model_id, "model worker started");
                Ok(Link {
                    tasks: task_tx,
                    results: result_rx,
                    thread,
                })
            }
            Ok(Some(TaskResult::LoadFailed(message))) => Err(Error::WorkerStart(message)),
            Ok(Some(other)) => Err(Error::WorkerStart(format!(
                "expected a ready signal, got {:?}",
                other.kind()
            ))),
            Ok(None) => Err(Error::WorkerStart("worker exited while loading the model".to_string())),
            Err(_) => Err(Error::WorkerStart(format!(
                "model did not load within {}",
                describe(startup)
            ))),
        }
    }

    async fn round_trip(&self, task: Task) -> Result<TaskResult> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.stopped {
            return Err(Error::ShutDown);
        }
        if let Some(reason) = &state.poisoned {
            return Err(Error::Protocol(reason.clone()));
        }
        if state.link.is_none() {
            self.relaunch(state).await?;
        }

        let kind = task.kind();
        let outcome = match state.link.as_mut() {
            Some(link) => exchange(link, &mut state.unanswered, task, self.config.timeout()).await,
            None => Err("worker is not running".to_string()),
        };

        match outcome {
            Ok(result) => {
                debug!(task = %kind, "round-trip complete");
                Ok(result)
            }
            Err(reason) => {
                warn!(task = %kind, reason = %reason, "model worker unavailable; tearing down link");
                if let Some(link) = state.link.take() {
                    release(link);
                }
                state.unanswered = 0;
                Err(Error::WorkerUnavailable(reason))
            }
        }
    }

    fn restarts_paused(&self, state: &State) -> bool {
        state.restarts >= self.config.max_restarts
            && state
                .last_failed_restart
                .is_some_and(|at| at.elapsed() < self.config.restart_cooldown())
    }

    /// Bring up a new worker for the last model id.
    ///
    /// A crash of a worker that did start is charged to the batch that caused
    /// it, not to the restart budget: only relaunches that fail to load the
    /// model count.
    async fn relaunch(&self, state: &mut State) -> Result<()> {
        let Some(model_id) = state.model_id.clone() else {
            return Err(Error::WorkerUnavailable("worker was never started".to_string()));
        };
        if self.restarts_paused(state) {
            return Err(Error::WorkerStart(format!(
                "{} restarts failed in a row; retrying after {}",
                state.restarts,
                describe(self.config.restart_cooldown())
            )));
        }
        if state.restarts >= self.config.max_restarts {
            state.restarts = 0;
        }

        warn!(model = %model_id, "restarting model worker");
        match self.launch(&model_id).await {
            Ok(link) => {
                state.restarts = 0;
                state.last_failed_restart = None;
                state.unanswered = 0;
                state.link = Some(link);
                Ok(())
            }
            Err(e) => {
                state.restarts += 1;
                state.last_failed_restart = Some(Instant::now());
                error!(error = %e, attempt = state.restarts, "model worker restart failed");
                Err(Error::WorkerUnavailable(e.to_string()))
            }
        }
    }

    async fn check_answers<I>(&self, batch: &[BatchEntry], answered: I) -> Result<()>
    where
        I: IntoIterator<Item = uuid::Uuid>,
    {
        match ensure_answers(batch, answered) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.poison(e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn unexpected(&self, expected: TaskKind, got: &TaskResult) -> Error {
        let reason = match got.kind() {
            Some(kind) => format!("expected a {} result, got {}", expected, kind),
            None => format!("expected a {} result", expected),
        };
        self.poison(reason.clone()).await;
        Error::Protocol(reason)
    }

    async fn poison(&self, reason: String) {
        error!(reason = %reason, "worker protocol violation; refusing further work");
        let mut state = self.state.lock().await;
        if let Some(link) = state.link.take() {
            release(link);
        }
        state.unanswered = 0;
        state.poisoned = Some(reason);
    }
}

impl Drop for ExecutorBridge {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.try_lock() {
            if let Some(link) = state.link.take() {
                release(link);
            }
        }
    }
}

/// Ask the worker to stop and detach it; it exits once it sees the stop
/// request or notices its channels are closed
fn release(link: Link) {
    let _ = link.tasks.try_send(Task::Stop);
}

/// Send one task and read its reply.
///
/// Replies owed to earlier callers that were dropped mid round-trip are read
/// first and discarded; the worker answers tasks in the order it gets them.
async fn exchange(
    link: &mut Link,
    unanswered: &mut usize,
    task: Task,
    timeout: Duration,
) -> std::result::Result<TaskResult, String> {
    while *unanswered > 0 {
        match tokio::time::timeout(timeout, link.results.recv()).await {
            Ok(Some(stale)) => {
                *unanswered -= 1;
                debug!(result = ?stale.kind(), "discarding reply to an abandoned task");
            }
            Ok(None) => return Err("worker exited".to_string()),
            Err(_) => {
                return Err(format!(
                    "no reply to an abandoned task within {}",
                    describe(timeout)
                ));
            }
        }
    }

    let kind = task.kind();
    if link.tasks.send(task).await.is_err() {
        return Err("worker exited".to_string());
    }
    *unanswered += 1;
    match tokio::time::timeout(timeout, link.results.recv()).await {
        Ok(Some(result)) => {
            *unanswered -= 1;
            Ok(result)
        }
        Ok(None) => Err("worker exited".to_string()),
        Err(_) => Err(format!("no reply to {} task within {}", kind, describe(timeout))),
    }
}

fn describe(duration: Duration) -> String {
    format!("{}ms", duration.as_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::EchoModel;
    use crate::protocol::StepOutput;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn entry(prompt: &str) -> BatchEntry {
        BatchEntry {
            request_id: Uuid::new_v4(),
            prompt: prompt.to_string(),
        }
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            timeout_ms: 2_000,
            startup_timeout_ms: 2_000,
            ..WorkerConfig::default()
        }
    }

    fn echo_bridge(model: EchoModel, config: WorkerConfig) -> ExecutorBridge {
        ExecutorBridge::new(move |_: &str| -> Result<EchoModel> { Ok(model.clone()) }, config)
    }

    /// A launcher whose worker answers every task with whatever `reply` returns
    fn scripted(reply: fn(Task) -> TaskResult) -> Launcher {
        Arc::new(move |_: &str, mut tasks: mpsc::Receiver<Task>, results: mpsc::Sender<TaskResult>| {
            Ok(std::thread::spawn(move || {
                if results.blocking_send(TaskResult::Ready).is_err() {
                    return;
                }
                while let Some(task) = tasks.blocking_recv() {
                    if task == Task::Stop {
                        break;
                    }
                    if results.blocking_send(reply(task)).is_err() {
                        break;
                    }
                }
            }))
        })
    }

    #[tokio::test]
    async fn test_step_and_complete_round_trips() {
        let bridge = echo_bridge(EchoModel::eos_after(5), fast_config());
        bridge.setup("echo").await.unwrap();
        assert!(bridge.is_running().await);

        let batch = vec![entry("ab"), entry("x")];
        let outputs = bridge.execute_step(&batch).await.unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].token, "a");

        let completions = bridge.execute_complete(&batch).await.unwrap();
        assert_eq!(completions[0].generated_text, "abaaa");
        assert_eq!(completions[1].generated_text, "xxxxx");

        bridge.shutdown().await;
        assert!(!bridge.is_running().await);
        assert_eq!(bridge.execute_step(&batch).await.unwrap_err(), Error::ShutDown);
    }

    #[tokio::test]
    async fn test_empty_batch_needs_no_worker() {
        let bridge = echo_bridge(EchoModel::default(), fast_config());
        assert!(bridge.execute_step(&[]).await.unwrap().is_empty());
        assert!(bridge.execute_complete(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_without_setup() {
        let bridge = echo_bridge(EchoModel::default(), fast_config());
        bridge.shutdown().await;
        bridge.shutdown().await;
        assert!(!bridge.is_running().await);
    }

    #[tokio::test]
    async fn test_setup_reports_load_failure() {
        let bridge = ExecutorBridge::new(
            |id: &str| -> Result<EchoModel> { Err(Error::Model(format!("{id} is missing"))) },
            fast_config(),
        );
        let err = bridge.setup("nowhere").await.unwrap_err();
        assert!(matches!(err, Error::WorkerStart(message) if message.contains("nowhere is missing")));
        assert!(!bridge.is_running().await);
    }

    #[tokio::test]
    async fn test_model_failure_keeps_worker_alive() {
        let model = EchoModel {
            fail_on: Some("bad".into()),
            ..EchoModel::default()
        };
        let bridge = echo_bridge(model, fast_config());
        bridge.setup("echo").await.unwrap();

        let err = bridge.execute_step(&[entry("bad")]).await.unwrap_err();
        assert!(matches!(err, Error::Model(_)));
        assert!(bridge.is_running().await);
        assert!(bridge.execute_step(&[entry("good")]).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timeout_tears_down_and_restarts() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let config = WorkerConfig {
            timeout_ms: 100,
            ..fast_config()
        };
        let bridge = ExecutorBridge::new(
            move |_: &str| -> Result<EchoModel> {
                // only the first worker is slow
                let slow = counter.fetch_add(1, Ordering::SeqCst) == 0;
                Ok(EchoModel {
                    delay: slow.then(|| Duration::from_millis(500)),
                    ..EchoModel::default()
                })
            },
            config,
        );
        bridge.setup("echo").await.unwrap();

        let batch = vec![entry("a")];
        let err = bridge.execute_step(&batch).await.unwrap_err();
        assert!(matches!(err, Error::WorkerUnavailable(_)));
        assert!(!bridge.is_running().await);

        let outputs = bridge.execute_step(&batch).await.unwrap();
        assert_eq!(outputs[0].token, "a");
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_worker_exit_is_unavailable_then_restarted() {
        let model = EchoModel {
            panic_on: Some("boom".into()),
            ..EchoModel::default()
        };
        let bridge = echo_bridge(model, fast_config());
        bridge.setup("echo").await.unwrap();

        let err = bridge.execute_step(&[entry("boom")]).await.unwrap_err();
        assert!(matches!(err, Error::WorkerUnavailable(_)));

        let outputs = bridge.execute_step(&[entry("fine")]).await.unwrap();
        assert_eq!(outputs[0].token, "f");
    }

    #[tokio::test]
    async fn test_crashing_batches_do_not_use_up_restarts() {
        let model = EchoModel {
            panic_on: Some("boom".into()),
            ..EchoModel::default()
        };
        let config = WorkerConfig {
            max_restarts: 2,
            ..fast_config()
        };
        let bridge = echo_bridge(model, config);
        bridge.setup("echo").await.unwrap();

        // every relaunch loads fine; only the batch is bad
        for _ in 0..4 {
            let err = bridge.execute_step(&[entry("boom")]).await.unwrap_err();
            assert!(matches!(err, Error::WorkerUnavailable(_)));
            assert!(bridge.is_available().await);
        }
        let outputs = bridge.execute_step(&[entry("ok")]).await.unwrap();
        assert_eq!(outputs[0].token, "o");
    }

    #[tokio::test]
    async fn test_failed_restarts_pause_then_recover() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let config = WorkerConfig {
            max_restarts: 1,
            restart_cooldown_ms: 200,
            ..fast_config()
        };
        let bridge = ExecutorBridge::new(
            move |_: &str| -> Result<EchoModel> {
                // the first relaunch cannot load the model
                match counter.fetch_add(1, Ordering::SeqCst) {
                    1 => Err(Error::Model("disk unavailable".into())),
                    _ => Ok(EchoModel {
                        panic_on: Some("boom".into()),
                        ..EchoModel::default()
                    }),
                }
            },
            config,
        );
        bridge.setup("echo").await.unwrap();

        assert!(matches!(
            bridge.execute_step(&[entry("boom")]).await,
            Err(Error::WorkerUnavailable(_))
        ));
        // relaunch fails to load
        assert!(matches!(
            bridge.execute_step(&[entry("fine")]).await,
            Err(Error::WorkerUnavailable(_))
        ));
        // out of relaunches until the cooldown passes
        let err = bridge.execute_step(&[entry("fine")]).await.unwrap_err();
        assert!(matches!(err, Error::WorkerStart(_)));
        assert!(!err.is_transient());
        assert!(!bridge.is_available().await);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(bridge.is_available().await);
        let outputs = bridge.execute_step(&[entry("fine")]).await.unwrap();
        assert_eq!(outputs[0].token, "f");
        assert_eq!(loads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_reply_to_abandoned_caller_is_discarded() {
        let model = EchoModel {
            delay: Some(Duration::from_millis(200)),
            ..EchoModel::eos_after(3)
        };
        let bridge = Arc::new(echo_bridge(model, fast_config()));
        bridge.setup("echo").await.unwrap();

        let abandoned = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.execute_complete(&[entry("a")]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        abandoned.abort();
        assert!(abandoned.await.unwrap_err().is_cancelled());

        let batch = vec![entry("b")];
        let outputs = bridge.execute_step(&batch).await.unwrap();
        assert_eq!(outputs[0].request_id, batch[0].request_id);
        assert_eq!(outputs[0].token, "b");
        assert!(bridge.is_running().await);

        let completions = bridge.execute_complete(&[entry("c")]).await.unwrap();
        assert!(completions[0].generated_text.starts_with('c'));
    }

    #[tokio::test]
    async fn test_wrong_tag_poisons_bridge() {
        let bridge = ExecutorBridge::with_launcher(scripted(|_| TaskResult::Complete(vec![])), fast_config());
        bridge.setup("scripted").await.unwrap();

        let err = bridge.execute_step(&[entry("a")]).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(!bridge.is_running().await);
        assert!(!bridge.is_available().await);

        // every later call is refused
        let err = bridge.execute_complete(&[entry("b")]).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_mismatched_ids_poison_bridge() {
        let bridge = ExecutorBridge::with_launcher(
            scripted(|_| {
                TaskResult::Step(vec![StepOutput {
                    request_id: Uuid::new_v4(),
                    token: "a".into(),
                    is_finished: false,
                }])
            }),
            fast_config(),
        );
        bridge.setup("scripted").await.unwrap();

        let err = bridge.execute_step(&[entry("a")]).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(matches!(bridge.execute_step(&[entry("a")]).await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_results_in_any_order_are_accepted() {
        let bridge = ExecutorBridge::with_launcher(
            scripted(|task| match task {
                Task::Step(batch) => TaskResult::Step(
                    batch
                        .into_iter()
                        .rev()
                        .map(|entry| StepOutput {
                            request_id: entry.request_id,
                            token: entry.prompt,
                            is_finished: false,
                        })
                        .collect(),
                ),
                _ => TaskResult::Failed("unsupported".into()),
            }),
            fast_config(),
        );
        bridge.setup("scripted").await.unwrap();

        let batch = vec![entry("a"), entry("b"), entry("c")];
        let outputs = bridge.execute_step(&batch).await.unwrap();
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[0].request_id, batch[2].request_id);
    }
}
