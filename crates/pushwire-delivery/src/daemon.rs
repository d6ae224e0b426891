//! Wiring of store, app runners and feeder into one service.

use std::{sync::Arc, time::Duration};

use pushwire_core::{Clock, NotificationStore};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    app_runner::{AppRunners, Dispatcher},
    config::{FeederConfig, RunnerConfig},
    delivery::Delivery,
    error::{DeliveryError, Result},
    feeder::Feeder,
    gateway::GatewayFactory,
    retry::BackoffPolicy,
};

/// How often a push-mode shutdown checks whether the runners have drained.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Settings for every daemon component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Feeder settings.
    pub feeder: FeederConfig,
    /// Per-app runner settings.
    pub runners: RunnerConfig,
    /// Backoff for retryable failures.
    pub backoff: BackoffPolicy,
}

/// The delivery daemon.
pub struct Daemon {
    store: Arc<dyn NotificationStore>,
    runners: Arc<AppRunners>,
    feeder: Arc<Feeder>,
    config: DaemonConfig,
}

impl Daemon {
    /// Builds a daemon over `store`, creating gateways through `gateways`.
    pub fn new(
        store: Arc<dyn NotificationStore>,
        clock: Arc<dyn Clock>,
        gateways: Arc<dyn GatewayFactory>,
        config: DaemonConfig,
    ) -> Self {
        let delivery = Delivery::new(store.clone(), clock).with_backoff(config.backoff.clone());
        let runners = Arc::new(AppRunners::new(gateways, delivery, config.runners.clone()));
        let dispatcher: Arc<dyn Dispatcher> = runners.clone();
        let feeder = Arc::new(Feeder::new(store.clone(), dispatcher, config.feeder.clone()));
        Self { store, runners, feeder, config }
    }

    /// Starts runners for every app, then starts the feeder.
    ///
    /// Returns immediately in embedded mode; otherwise returns once the
    /// feeder has stopped.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Store` if the apps cannot be loaded.
    pub async fn start(&self) -> Result<()> {
        self.runners.sync(self.store.as_ref()).await?;
        let apps = self.runners.app_ids().await.len();
        info!(apps, "daemon started");
        self.feeder.start().await;
        Ok(())
    }

    /// Re-reads apps from the store, starting, restarting and stopping
    /// runners as needed.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Store` if the apps cannot be loaded.
    pub async fn sync_apps(&self) -> Result<()> {
        self.runners.sync(self.store.as_ref()).await
    }

    /// Starts the next feeder cycle now.
    pub fn wakeup(&self) {
        self.feeder.wakeup();
    }

    /// The app runner registry.
    pub fn runners(&self) -> &Arc<AppRunners> {
        &self.runners
    }

    /// The feeder.
    pub fn feeder(&self) -> &Arc<Feeder> {
        &self.feeder
    }

    /// Stops the feeder, then stops every app runner.
    ///
    /// In push mode the runners are first given up to the shutdown timeout
    /// to deliver what the single cycle queued.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if runners do not stop in
    /// time.
    pub async fn shutdown(&self) -> Result<()> {
        let timeout = self.config.runners.shutdown_timeout;
        self.feeder.stop().await;

        if self.config.feeder.push
            && tokio::time::timeout(timeout, self.runners.wait_until_idle(IDLE_POLL)).await.is_err()
        {
            warn!(timeout_seconds = timeout.as_secs(), "runners still busy after push cycle");
        }

        let result = self.runners.shutdown(timeout).await;
        match &result {
            Ok(()) => info!("daemon stopped"),
            Err(DeliveryError::ShutdownTimeout { .. }) => warn!("daemon stopped with workers still running"),
            Err(e) => warn!(error = %e, "daemon stopped with errors"),
        }
        result
    }
}
