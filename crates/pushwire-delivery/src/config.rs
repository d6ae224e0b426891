//! Runtime settings for the feeder and app runners.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_BATCH_SIZE, DEFAULT_MAX_BATCH, DEFAULT_PUSH_POLL_SECONDS};

/// Feeder settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeederConfig {
    /// Upper bound on notifications queued across all apps.
    pub batch_size: usize,

    /// Pause between fetch cycles.
    pub push_poll: Duration,

    /// Run the loop on a spawned task instead of the caller's.
    pub embedded: bool,

    /// Run a single unbounded cycle and exit.
    pub push: bool,
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            push_poll: Duration::from_secs(DEFAULT_PUSH_POLL_SECONDS),
            embedded: false,
            push: false,
        }
    }
}

/// Per-app runner settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Capacity of each app's queue.
    pub queue_capacity: usize,

    /// Most notifications a worker sends to the gateway at once.
    pub max_batch: usize,

    /// Time allowed for workers to drain on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_BATCH_SIZE,
            max_batch: DEFAULT_MAX_BATCH,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}
