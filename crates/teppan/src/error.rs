use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the generation pipeline.
///
/// Every variant carries owned, cloneable data so a single failure can be
/// fanned out to every request that was part of the failing batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// No generation context is registered under this id
    #[error("request not found: {0}")]
    NotFound(Uuid),

    /// The model worker did not answer (timed out, exited, or is being restarted)
    #[error("model worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// The model worker could not be started
    #[error("model worker failed to start: {0}")]
    WorkerStart(String),

    /// The worker answered with something that does not match the request
    #[error("worker protocol violation: {0}")]
    Protocol(String),

    /// The model runtime reported a failure while processing a batch
    #[error("model error: {0}")]
    Model(String),

    /// Invalid or unreadable configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The request was removed before it produced a result
    #[error("request cancelled: {0}")]
    Cancelled(Uuid),

    /// The engine is shutting down
    #[error("engine is shut down")]
    ShutDown,
}

impl Error {
    /// Whether a retry of the same round may succeed.
    ///
    /// Worker outages are transient: the bridge restarts the worker on the next
    /// round-trip. A model failure repeats for the same batch, protocol
    /// violations poison the bridge and a shut down engine never comes back.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::WorkerUnavailable(_))
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;
