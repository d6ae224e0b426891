//! Reconnect-and-retry policy for store operations.
//!
//! A transient connectivity error suspends the operation, probes the
//! database until it answers again, then re-runs the operation from the
//! start. Any other error propagates untouched.

use std::{future::Future, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{CoreError, Result};

/// How a store recovers from lost connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Pause between reconnect probes.
    pub delay: Duration,

    /// Give up after this many consecutive transient failures. `None` keeps
    /// trying until the database comes back.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { delay: Duration::from_secs(2), max_attempts: None }
    }
}

impl ReconnectPolicy {
    /// Runs `op`, reconnecting through `probe` and retrying on transient
    /// failures.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient error from `op` or `probe`, or the last
    /// transient error once `max_attempts` is exhausted.
    pub async fn run<T, Op, OpFut, Probe, ProbeFut>(
        &self,
        operation: &str,
        mut op: Op,
        mut probe: Probe,
    ) -> Result<T>
    where
        Op: FnMut() -> OpFut,
        OpFut: Future<Output = Result<T>>,
        Probe: FnMut() -> ProbeFut,
        ProbeFut: Future<Output = Result<()>>,
    {
        let mut attempts = 0u32;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    attempts += 1;
                    self.check_attempts(attempts, &err)?;
                    error!(operation, attempt = attempts, error = %err, "lost database connection");
                    attempts = self.reconnect(operation, attempts, &mut probe).await?;
                },
                Err(err) => return Err(err),
            }
        }
    }

    async fn reconnect<Probe, ProbeFut>(
        &self,
        operation: &str,
        mut attempts: u32,
        probe: &mut Probe,
    ) -> Result<u32>
    where
        Probe: FnMut() -> ProbeFut,
        ProbeFut: Future<Output = Result<()>>,
    {
        loop {
            tokio::time::sleep(self.delay).await;

            match probe().await {
                Ok(()) => {
                    info!(operation, attempts, "database connection re-established");
                    return Ok(attempts);
                },
                Err(err) if err.is_transient() => {
                    attempts += 1;
                    self.check_attempts(attempts, &err)?;
                    warn!(operation, attempt = attempts, error = %err, "database still unreachable");
                },
                Err(err) => return Err(err),
            }
        }
    }

    fn check_attempts(&self, attempts: u32, err: &CoreError) -> Result<()> {
        match self.max_attempts {
            Some(max) if attempts >= max => Err(err.clone()),
            _ => Ok(()),
        }
    }
}
