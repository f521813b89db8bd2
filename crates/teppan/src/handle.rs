//! Ownership of the background scheduling task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Owns the task that drives the scheduling loop.
///
/// The task is handed a `running` flag and the admission notifier. It must
/// check the flag between cycles and may park on the notifier while idle;
/// [`stop`](Self::stop) clears the flag and wakes it so it can return.
///
/// Dropping the handle signals the task without waiting for it.
pub struct LoopHandle {
    running: Arc<AtomicBool>,
    notifier: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl LoopHandle {
    /// Spawn the loop through `spawn`, which receives the running flag and
    /// the notifier and returns the task's join handle.
    pub fn new<F>(spawn: F) -> Self
    where
        F: FnOnce(Arc<AtomicBool>, Arc<Notify>) -> JoinHandle<()>,
    {
        let running = Arc::new(AtomicBool::new(true));
        let notifier = Arc::new(Notify::new());
        let task = spawn(running.clone(), notifier.clone());
        Self {
            running,
            notifier,
            task: Some(task),
        }
    }

    /// Wake the loop if it is idle
    pub fn notify(&self) {
        self.notifier.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The notifier admission paths use to wake the loop
    pub fn notifier(&self) -> Arc<Notify> {
        self.notifier.clone()
    }

    /// Ask the loop to stop and wait until its current cycle has returned.
    pub async fn stop(&mut self) {
        self.signal_stop();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "scheduling loop ended abnormally");
            }
        }
    }

    fn signal_stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            debug!("stopping scheduling loop");
        }
        // notify_one stores a permit, so a loop that is between its flag check
        // and its idle wait still wakes up
        self.notifier.notify_one();
    }
}

impl Drop for LoopHandle {
    fn drop(&mut self) {
        self.signal_stop();
        // the task is left detached; it exits on its next flag check
        self.task.take();
    }
}
