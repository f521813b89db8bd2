//! Model worker settings

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the isolated model worker and the bridge that talks to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Sampling temperature (0 means greedy)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Sequence length cap (prompt included) for run-to-completion generation
    #[serde(default = "default_max_length")]
    pub max_length: usize,

    /// Seed for the sampler; random when absent
    #[serde(default)]
    pub seed: Option<u64>,

    /// How long to wait for a batch result before declaring the worker unavailable
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// How long to wait for the model to load
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// Relaunches in a row that may fail to load the model before restarting
    /// is paused for `restart_cooldown_ms`
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Pause before relaunching again once `max_restarts` is used up
    #[serde(default = "default_restart_cooldown_ms")]
    pub restart_cooldown_ms: u64,

    /// Capacity of the task and result channels
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_length() -> usize {
    50
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_startup_timeout_ms() -> u64 {
    300_000
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_cooldown_ms() -> u64 {
    1_000
}

fn default_channel_capacity() -> usize {
    1
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_length: default_max_length(),
            seed: None,
            timeout_ms: default_timeout_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
            max_restarts: default_max_restarts(),
            restart_cooldown_ms: default_restart_cooldown_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl WorkerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_millis(self.restart_cooldown_ms)
    }
}
