//! Push notification delivery engine.
//!
//! Moves deliverable notifications from storage to push gateways and records
//! what happened to them.
//!
//! # Architecture
//!
//! 1. **Feeder** - polls the store for deliverable notifications, admitting
//!    no more than the room left under `batch_size`
//! 2. **App runners** - one bounded queue per app, drained by one worker per
//!    gateway connection
//! 3. **Gateways** - send batches and report a typed outcome
//! 4. **Delivery** - records delivered, retryable (exponential backoff,
//!    deadline-aware) or failed outcomes with one bulk write per outcome
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use pushwire_core::{MemoryStore, RealClock};
//! use pushwire_delivery::{Daemon, DaemonConfig, DefaultGatewayFactory};
//!
//! # async fn example() -> pushwire_delivery::Result<()> {
//! let clock = Arc::new(RealClock::new());
//! let store = Arc::new(MemoryStore::new(clock.clone()));
//! let mut config = DaemonConfig::default();
//! config.feeder.embedded = true;
//!
//! let daemon = Daemon::new(store, clock, Arc::new(DefaultGatewayFactory::default()), config);
//! daemon.start().await?;
//! daemon.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod app_runner;
pub mod config;
pub mod daemon;
pub mod delivery;
pub mod error;
pub mod feeder;
pub mod gateway;
pub mod http;
pub mod retry;
pub mod sleep;

pub use app_runner::{AppRunner, AppRunners, Dispatcher};
pub use config::{FeederConfig, RunnerConfig};
pub use daemon::{Daemon, DaemonConfig};
pub use delivery::Delivery;
pub use error::{DeliveryError, Result};
pub use feeder::Feeder;
pub use gateway::{DefaultGatewayFactory, Gateway, GatewayFactory};
pub use http::{HttpGateway, HttpGatewayConfig};
pub use retry::BackoffPolicy;
pub use sleep::{InterruptibleSleep, Wake};

/// Default upper bound on notifications queued across all apps.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default pause between feeder cycles, in seconds.
pub const DEFAULT_PUSH_POLL_SECONDS: u64 = 2;

/// Default number of notifications per gateway send.
pub const DEFAULT_MAX_BATCH: usize = 10;
