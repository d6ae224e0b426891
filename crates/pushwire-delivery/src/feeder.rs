//! Polling loop that moves deliverable notifications into app runners.
//!
//! Each cycle asks the dispatcher how much is already queued, fetches at most
//! the remaining room from the store and hands the whole batch over in one
//! call. Between cycles the feeder sleeps for `push_poll`, and the sleep can
//! be cut short with [`Feeder::wakeup`] or ended with [`Feeder::stop`].

use std::sync::Arc;

use pushwire_core::NotificationStore;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, error, info};

use crate::{
    app_runner::Dispatcher,
    config::FeederConfig,
    error::Result,
    sleep::{InterruptibleSleep, Wake},
};

/// Feeds deliverable notifications from the store to the dispatcher.
pub struct Feeder {
    store: Arc<dyn NotificationStore>,
    dispatcher: Arc<dyn Dispatcher>,
    config: FeederConfig,
    sleep: InterruptibleSleep,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Feeder {
    /// Creates a stopped feeder.
    pub fn new(
        store: Arc<dyn NotificationStore>,
        dispatcher: Arc<dyn Dispatcher>,
        config: FeederConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            config,
            sleep: InterruptibleSleep::new(),
            handle: Mutex::new(None),
        }
    }

    /// Runs the feed loop.
    ///
    /// In embedded mode the loop is spawned and this returns immediately;
    /// otherwise the loop runs on the caller until [`stop`](Self::stop) is
    /// called from another task. Push mode runs a single cycle either way.
    pub async fn start(self: &Arc<Self>) {
        info!(
            batch_size = self.config.batch_size,
            push_poll_seconds = self.config.push_poll.as_secs(),
            embedded = self.config.embedded,
            push = self.config.push,
            "starting feeder"
        );

        if self.config.embedded {
            let feeder = Arc::clone(self);
            let handle = tokio::spawn(async move { feeder.feed_forever().await });
            *self.handle.lock().await = Some(handle);
        } else {
            self.feed_forever().await;
        }
    }

    /// Stops the loop, releases the store connection and waits for a spawned
    /// loop to finish its current cycle.
    pub async fn stop(&self) {
        self.sleep.stop();
        self.store.release_connection().await;

        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "feeder task panicked");
            }
        }
        info!("feeder stopped");
    }

    /// Interrupts the current sleep so the next cycle starts now.
    pub fn wakeup(&self) {
        self.sleep.wakeup();
    }

    /// Runs one fetch-and-dispatch cycle, returning how many notifications
    /// were handed over.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Store` if the fetch fails.
    pub async fn enqueue_notifications(&self) -> Result<usize> {
        let queued = self.dispatcher.cumulative_queue_size().await;
        let available = self.config.batch_size.saturating_sub(queued);
        if available == 0 {
            debug!(queued, batch_size = self.config.batch_size, "runners full, skipping cycle");
            return Ok(0);
        }

        let limit = if self.config.push { None } else { Some(available) };
        let notifications = self.store.deliverable_notifications(limit).await?;
        let count = notifications.len();
        if count > 0 {
            debug!(count, available, "dispatching notifications");
            self.dispatcher.enqueue(notifications).await;
        }
        Ok(count)
    }

    async fn feed_forever(&self) {
        if self.config.push {
            self.run_cycle().await;
            return;
        }

        while !self.sleep.is_stopped() {
            self.run_cycle().await;
            if self.sleep.sleep(self.config.push_poll).await == Wake::Stopped {
                break;
            }
        }
    }

    async fn run_cycle(&self) {
        if let Err(e) = self.enqueue_notifications().await {
            error!(error = %e, "feeder cycle failed");
        }
    }
}
