//! Engine configuration
//!
//! Scheduling knobs live on [`EngineConfig`]; everything the model worker and
//! its bridge need lives on the nested [`WorkerConfig`].

mod worker;

pub use worker::WorkerConfig;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Identifier handed to the model loader (a path, a hub id, ...)
    pub model: String,

    /// Maximum number of contexts per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum number of tokens streamed to a single request
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Idle backoff of the scheduling loop
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Rounds a request may lose to an unavailable worker before it is failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Model worker settings
    #[serde(default)]
    pub worker: WorkerConfig,
}

fn default_batch_size() -> usize {
    4
}

fn default_max_tokens() -> usize {
    20
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_max_retries() -> u32 {
    2
}

impl EngineConfig {
    /// Create a configuration with default settings for the given model
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            batch_size: default_batch_size(),
            max_tokens: default_max_tokens(),
            poll_interval_ms: default_poll_interval_ms(),
            max_retries: default_max_retries(),
            worker: WorkerConfig::default(),
        }
    }

    /// Load configuration from a YAML file
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = read(path.as_ref())?;
        serde_yaml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load configuration from a JSON file
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = read(path.as_ref())?;
        serde_json::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load configuration, picking the format from the file extension
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(path),
            Some("yaml") | Some("yml") => Self::from_yaml(path),
            other => Err(Error::Config(format!(
                "unsupported config format {:?} for {}",
                other,
                path.display()
            ))),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(Error::Config("model identifier is empty".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if self.max_tokens == 0 {
            return Err(Error::Config("max_tokens must be at least 1".to_string()));
        }
        if !self.worker.temperature.is_finite() || self.worker.temperature < 0.0 {
            return Err(Error::Config(format!(
                "temperature must be a non-negative number, got {}",
                self.worker.temperature
            )));
        }
        if self.worker.max_length == 0 {
            return Err(Error::Config("max_length must be at least 1".to_string()));
        }
        if self.worker.channel_capacity == 0 {
            return Err(Error::Config("channel_capacity must be at least 1".to_string()));
        }
        if self.worker.timeout_ms == 0 || self.worker.startup_timeout_ms == 0 {
            return Err(Error::Config("worker timeouts must be non-zero".to_string()));
        }
        Ok(())
    }
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))
}
