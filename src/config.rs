//! Daemon configuration.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use pushwire_core::ReconnectPolicy;
use pushwire_delivery::{
    BackoffPolicy, DaemonConfig, FeederConfig, HttpGatewayConfig, RunnerConfig,
    DEFAULT_BATCH_SIZE, DEFAULT_MAX_BATCH, DEFAULT_PUSH_POLL_SECONDS,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "pushwire.toml";

const ENV_PREFIX: &str = "PUSHWIRE_";

/// Complete daemon configuration.
///
/// Loaded in priority order:
/// 1. Environment variables (`PUSHWIRE_BATCH_SIZE`, ...; `DATABASE_URL` and
///    `RUST_LOG` are also read unprefixed)
/// 2. Configuration file (`pushwire.toml`)
/// 3. Built-in defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Maximum number of pooled connections.
    pub database_max_connections: u32,
    /// Seconds to wait for a pooled connection.
    pub database_acquire_timeout: u64,

    // Feeder
    /// Upper bound on notifications queued across all apps.
    pub batch_size: usize,
    /// Seconds between feeder cycles.
    pub push_poll: u64,
    /// Run the feeder on a background task.
    pub embedded: bool,
    /// Run a single unbounded cycle, drain and exit.
    pub push: bool,

    // Runners
    /// Per-app queue capacity. Defaults to `batch_size`.
    pub queue_capacity: Option<usize>,
    /// Notifications per gateway send.
    pub max_batch: usize,
    /// Seconds allowed for workers to drain on shutdown.
    pub shutdown_timeout: u64,
    /// Seconds before a gateway request times out.
    pub gateway_timeout: u64,

    // Retry
    /// Cap on the exponential retry delay, in seconds.
    pub retry_max_delay: Option<u64>,
    /// Retries after which a notification is failed.
    pub max_retries: Option<u32>,

    // Reconnect
    /// Seconds between database reconnect probes.
    pub reconnect_delay: u64,
    /// Consecutive transient failures tolerated before giving up.
    pub reconnect_max_attempts: Option<u32>,

    /// Default log filter when `RUST_LOG` is unset.
    pub rust_log: String,
}

impl Config {
    /// Loads defaults, then `pushwire.toml`, then the environment.
    ///
    /// # Errors
    ///
    /// Returns error if a source cannot be parsed or validation fails.
    pub fn load() -> Result<Self> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::raw().only(&["DATABASE_URL", "RUST_LOG"]))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .context("failed to load configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the daemon cannot run with.
    ///
    /// # Errors
    ///
    /// Returns error naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be greater than 0");
        }
        if self.queue_capacity == Some(0) {
            bail!("queue_capacity must be greater than 0");
        }
        if self.max_batch == 0 {
            bail!("max_batch must be greater than 0");
        }
        if self.database_max_connections == 0 {
            bail!("database_max_connections must be greater than 0");
        }
        Ok(())
    }

    /// Settings for every daemon component.
    pub fn daemon_config(&self) -> DaemonConfig {
        DaemonConfig {
            feeder: FeederConfig {
                batch_size: self.batch_size,
                push_poll: Duration::from_secs(self.push_poll),
                embedded: self.embedded,
                push: self.push,
            },
            runners: RunnerConfig {
                queue_capacity: self.queue_capacity.unwrap_or(self.batch_size),
                max_batch: self.max_batch,
                shutdown_timeout: Duration::from_secs(self.shutdown_timeout),
            },
            backoff: BackoffPolicy {
                max_delay: self.retry_max_delay.map(Duration::from_secs),
                max_retries: self.max_retries,
            },
        }
    }

    /// Reconnect behaviour for the Postgres store.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            delay: Duration::from_secs(self.reconnect_delay),
            max_attempts: self.reconnect_max_attempts,
        }
    }

    /// HTTP client settings for webhook gateways.
    pub fn http_gateway_config(&self) -> HttpGatewayConfig {
        HttpGatewayConfig {
            timeout: Duration::from_secs(self.gateway_timeout),
            ..HttpGatewayConfig::default()
        }
    }

    /// Database URL with the password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                if !self.database_url[colon_pos + 1..].starts_with("//") {
                    let mut masked = self.database_url.clone();
                    masked.replace_range(colon_pos + 1..at_pos, "***");
                    return masked;
                }
            }
        }
        self.database_url.clone()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/pushwire".to_string(),
            database_max_connections: 10,
            database_acquire_timeout: 10,
            batch_size: DEFAULT_BATCH_SIZE,
            push_poll: DEFAULT_PUSH_POLL_SECONDS,
            embedded: false,
            push: false,
            queue_capacity: None,
            max_batch: DEFAULT_MAX_BATCH,
            shutdown_timeout: 30,
            gateway_timeout: 30,
            retry_max_delay: None,
            max_retries: None,
            reconnect_delay: 2,
            reconnect_max_attempts: None,
            rust_log: "info,pushwire=debug".to_string(),
        }
    }
}
