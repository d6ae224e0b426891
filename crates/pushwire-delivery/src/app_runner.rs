//! Per-app queues and delivery workers.
//!
//! Each app gets an [`AppRunner`]: a bounded queue drained by one worker per
//! configured gateway connection. [`AppRunners`] is the registry the feeder
//! dispatches through and sums queue depth over.
//!
//! A notification counts towards its app's queue size from the moment it is
//! enqueued until its outcome has been persisted, so the feeder never admits
//! more work than the runners have room for, and a notification that is still
//! queued or in flight is not enqueued a second time.
//!
//! Delivery is at-least-once. A row fetched just before a worker persists its
//! outcome can be enqueued again after the worker lets go of it and is then
//! resent. The store's terminal guard skips the second outcome.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use pushwire_core::{App, AppId, Notification, NotificationId, NotificationStore};
use tokio::{
    sync::{mpsc, Mutex as AsyncMutex, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::RunnerConfig,
    delivery::Delivery,
    error::{DeliveryError, Result},
    gateway::{BoxFuture, Gateway, GatewayFactory},
};

/// The feeder's view of the app runners.
pub trait Dispatcher: Send + Sync + 'static {
    /// Hands a fetched batch to the runners, in store order.
    fn enqueue(&self, notifications: Vec<Notification>) -> BoxFuture<'_, ()>;

    /// Notifications queued or in flight across every app.
    fn cumulative_queue_size(&self) -> BoxFuture<'_, usize>;
}

type InFlight = Arc<Mutex<HashSet<NotificationId>>>;

fn lock(in_flight: &InFlight) -> std::sync::MutexGuard<'_, HashSet<NotificationId>> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Queue and workers for a single app.
pub struct AppRunner {
    app: App,
    sender: mpsc::Sender<Notification>,
    in_flight: InFlight,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
}

impl AppRunner {
    /// Starts `app.connections` workers sending through `gateway`.
    pub fn start(
        app: App,
        gateway: Arc<dyn Gateway>,
        delivery: Delivery,
        config: &RunnerConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(AsyncMutex::new(receiver));
        let in_flight: InFlight = Arc::default();
        let cancellation_token = CancellationToken::new();
        let worker_count = app.worker_count();

        info!(app_id = %app.id, app = %app.name, worker_count, "starting app runner");

        let worker_handles = (0..worker_count)
            .map(|worker_id| {
                let worker = Worker {
                    worker_id,
                    app: app.clone(),
                    gateway: gateway.clone(),
                    delivery: delivery.clone(),
                    receiver: receiver.clone(),
                    in_flight: in_flight.clone(),
                    cancellation_token: cancellation_token.clone(),
                    max_batch: config.max_batch.max(1),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        Self { app, sender, in_flight, cancellation_token, worker_handles }
    }

    /// The app this runner delivers for.
    pub fn app(&self) -> &App {
        &self.app
    }

    /// Notifications queued or being delivered.
    pub fn queue_size(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Queues notifications for delivery, skipping any already in flight.
    ///
    /// Waits for room when the queue is full.
    pub async fn enqueue(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            let id = notification.id;
            if !lock(&self.in_flight).insert(id) {
                debug!(notification_id = %id, "notification already in flight");
                continue;
            }

            if self.sender.send(notification).await.is_err() {
                lock(&self.in_flight).remove(&id);
                warn!(app_id = %self.app.id, notification_id = %id, "app runner closed, leaving notification pending");
            }
        }
    }

    /// Stops the workers, letting each finish the batch it holds.
    ///
    /// Notifications still queued stay pending in storage and are fetched
    /// again later.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if workers do not finish in
    /// time, or `DeliveryError::WorkerPanic` if one of them panicked.
    pub async fn shutdown(mut self, timeout: Duration) -> Result<()> {
        info!(
            app_id = %self.app.id,
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "stopping app runner"
        );
        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let app_id = self.app.id;
        let join_all = async move {
            let mut first_panic = None;
            for (worker_id, handle) in handles.into_iter().enumerate() {
                if let Err(join_error) = handle.await {
                    error!(%app_id, worker_id, error = %join_error, "worker task panicked");
                    first_panic.get_or_insert(DeliveryError::WorkerPanic {
                        worker_id,
                        error: join_error.to_string(),
                    });
                }
            }
            first_panic.map_or(Ok(()), Err)
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(result) => result,
            Err(_elapsed) => {
                error!(%app_id, timeout_seconds = timeout.as_secs(), "app runner shutdown timed out");
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl Drop for AppRunner {
    fn drop(&mut self) {
        if self.worker_handles.iter().any(|h| !h.is_finished())
            && !self.cancellation_token.is_cancelled()
        {
            warn!(app_id = %self.app.id, "app runner dropped without shutdown, cancelling workers");
            self.cancellation_token.cancel();
        }
    }
}

struct Worker {
    worker_id: usize,
    app: App,
    gateway: Arc<dyn Gateway>,
    delivery: Delivery,
    receiver: Arc<AsyncMutex<mpsc::Receiver<Notification>>>,
    in_flight: InFlight,
    cancellation_token: CancellationToken,
    max_batch: usize,
}

impl Worker {
    async fn run(self) {
        debug!(app_id = %self.app.id, worker_id = self.worker_id, "worker started");
        while let Some(batch) = self.next_batch().await {
            self.deliver(batch).await;
        }
        debug!(app_id = %self.app.id, worker_id = self.worker_id, "worker stopped");
    }

    /// Waits for one notification, then takes up to `max_batch` without
    /// waiting further.
    async fn next_batch(&self) -> Option<Vec<Notification>> {
        let mut receiver = tokio::select! {
            biased;
            () = self.cancellation_token.cancelled() => return None,
            guard = self.receiver.lock() => guard,
        };

        let first = tokio::select! {
            biased;
            () = self.cancellation_token.cancelled() => return None,
            next = receiver.recv() => next?,
        };

        let mut batch = Vec::with_capacity(self.max_batch);
        batch.push(first);
        while batch.len() < self.max_batch {
            match receiver.try_recv() {
                Ok(notification) => batch.push(notification),
                Err(_) => break,
            }
        }
        Some(batch)
    }

    async fn deliver(&self, mut batch: Vec<Notification>) {
        let ids: Vec<NotificationId> = batch.iter().map(|n| n.id).collect();

        let recorded = match self.gateway.send(&self.app, &batch).await {
            Ok(()) => self.delivery.mark_batch_delivered(&mut batch).await,
            Err(e) if e.is_retryable() => {
                warn!(app_id = %self.app.id, batch_size = batch.len(), error = %e, "retryable delivery failure");
                match e.retry_after() {
                    Some(delay) => self.delivery.mark_batch_retryable_in(&mut batch, delay).await,
                    None => self.delivery.mark_batch_retryable_exponential(&mut batch).await,
                }
            },
            Err(e) => self.delivery.mark_batch_failed(&mut batch, &e).await,
        };

        if let Err(e) = recorded {
            error!(
                app_id = %self.app.id,
                worker_id = self.worker_id,
                batch_size = ids.len(),
                error = %e,
                "failed to record delivery outcome"
            );
        }

        let mut in_flight = lock(&self.in_flight);
        for id in &ids {
            in_flight.remove(id);
        }
    }
}

/// Registry of running app runners keyed by app.
pub struct AppRunners {
    runners: RwLock<HashMap<AppId, AppRunner>>,
    gateways: Arc<dyn GatewayFactory>,
    delivery: Delivery,
    config: RunnerConfig,
}

impl AppRunners {
    /// Creates an empty registry.
    pub fn new(gateways: Arc<dyn GatewayFactory>, delivery: Delivery, config: RunnerConfig) -> Self {
        Self { runners: RwLock::new(HashMap::new()), gateways, delivery, config }
    }

    /// Starts a runner for `app` unless one is already running.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if no gateway can be built for
    /// the app.
    pub async fn start(&self, app: App) -> Result<()> {
        let mut runners = self.runners.write().await;
        if runners.contains_key(&app.id) {
            return Ok(());
        }

        let gateway = self.gateways.build(&app)?;
        let runner = AppRunner::start(app, gateway, self.delivery.clone(), &self.config);
        runners.insert(runner.app().id, runner);
        Ok(())
    }

    /// Stops and removes the runner for `id`, if any.
    ///
    /// # Errors
    ///
    /// Propagates the runner's shutdown error.
    pub async fn stop_app(&self, id: AppId) -> Result<()> {
        let runner = self.runners.write().await.remove(&id);
        match runner {
            Some(runner) => runner.shutdown(self.config.shutdown_timeout).await,
            None => Ok(()),
        }
    }

    /// Brings the running set in line with the store's apps.
    ///
    /// New apps are started, removed apps stopped, and apps whose settings
    /// changed restarted. Apps that cannot be started are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Store` if the apps cannot be loaded.
    pub async fn sync(&self, store: &dyn NotificationStore) -> Result<()> {
        let apps = store.all_apps().await?;
        let wanted: HashSet<AppId> = apps.iter().map(|app| app.id).collect();

        let stale: Vec<AppId> = {
            let runners = self.runners.read().await;
            runners
                .values()
                .filter(|runner| {
                    let app = runner.app();
                    !wanted.contains(&app.id) || apps.iter().any(|a| a.id == app.id && a != app)
                })
                .map(|runner| runner.app().id)
                .collect()
        };

        for id in stale {
            if let Err(e) = self.stop_app(id).await {
                warn!(app_id = %id, error = %e, "app runner did not stop cleanly");
            }
        }

        for app in apps {
            let (app_id, name) = (app.id, app.name.clone());
            if let Err(e) = self.start(app).await {
                error!(%app_id, app = %name, error = %e, "failed to start app runner");
            }
        }
        Ok(())
    }

    /// Distributes notifications to their apps' queues, preserving order
    /// within each app.
    pub async fn enqueue(&self, notifications: Vec<Notification>) {
        let mut by_app: Vec<(AppId, Vec<Notification>)> = Vec::new();
        for notification in notifications {
            match by_app.iter_mut().find(|(id, _)| *id == notification.app_id) {
                Some((_, group)) => group.push(notification),
                None => by_app.push((notification.app_id, vec![notification])),
            }
        }

        let runners = self.runners.read().await;
        for (app_id, group) in by_app {
            match runners.get(&app_id) {
                Some(runner) => runner.enqueue(group).await,
                None => {
                    warn!(%app_id, count = group.len(), "no runner for app, leaving notifications pending");
                },
            }
        }
    }

    /// Notifications queued or in flight across every app.
    pub async fn cumulative_queue_size(&self) -> usize {
        self.runners.read().await.values().map(AppRunner::queue_size).sum()
    }

    /// Per-app queue sizes.
    pub async fn queue_sizes(&self) -> HashMap<AppId, usize> {
        self.runners.read().await.iter().map(|(id, runner)| (*id, runner.queue_size())).collect()
    }

    /// Resolves once nothing is queued or in flight, checking every `poll`.
    pub async fn wait_until_idle(&self, poll: Duration) {
        loop {
            let queued = self.cumulative_queue_size().await;
            if queued == 0 {
                return;
            }
            debug!(queued, "waiting for app runners to drain");
            tokio::time::sleep(poll).await;
        }
    }

    /// Ids of apps with a running runner.
    pub async fn app_ids(&self) -> Vec<AppId> {
        self.runners.read().await.keys().copied().collect()
    }

    /// Stops every runner.
    ///
    /// # Errors
    ///
    /// Returns the first runner shutdown error after attempting all of them.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let runners: Vec<AppRunner> = self.runners.write().await.drain().map(|(_, r)| r).collect();
        info!(app_count = runners.len(), "stopping all app runners");

        let mut first_error = None;
        for runner in runners {
            if let Err(e) = runner.shutdown(timeout).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Dispatcher for AppRunners {
    fn enqueue(&self, notifications: Vec<Notification>) -> BoxFuture<'_, ()> {
        Box::pin(AppRunners::enqueue(self, notifications))
    }

    fn cumulative_queue_size(&self) -> BoxFuture<'_, usize> {
        Box::pin(AppRunners::cumulative_queue_size(self))
    }
}
