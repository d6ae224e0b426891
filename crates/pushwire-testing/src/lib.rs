//! Test infrastructure for deterministic delivery tests.
//!
//! Provides an in-memory test environment with a controllable clock,
//! notification builders, scripted gateway doubles and a recording
//! dispatcher for exercising the feeder in isolation.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use pushwire_core::{
    App, Clock, MemoryStore, Notification, NotificationId, NotificationStore, Protocol, TestClock,
};
use serde_json::json;

pub mod dispatcher;
pub mod fixtures;
pub mod gateway;

pub use dispatcher::RecordingDispatcher;
pub use fixtures::NotificationBuilder;
pub use gateway::{ScriptedGateway, StaticGatewayFactory};

/// Fixed start time shared by every test environment.
pub fn epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// In-memory store plus the clock it reads.
pub struct TestEnv {
    /// Deterministic clock shared with the store.
    pub clock: TestClock,
    /// Storage backing this environment.
    pub store: MemoryStore,
}

impl TestEnv {
    /// Creates an empty environment with the clock at [`epoch`].
    pub fn new() -> Self {
        let clock = TestClock::at(epoch());
        let store = MemoryStore::new(Arc::new(clock.clone()));
        Self { clock, store }
    }

    /// The store as a trait object.
    pub fn store_handle(&self) -> Arc<dyn NotificationStore> {
        Arc::new(self.store.clone())
    }

    /// The clock as a trait object.
    pub fn clock_handle(&self) -> Arc<dyn Clock> {
        Arc::new(self.clock.clone())
    }

    /// Current test time.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Moves test time forward.
    pub fn advance_time(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Registers an app with `connections` workers.
    pub async fn create_app(&self, name: &str, protocol: Protocol, connections: i32) -> App {
        let mut app = App::new(name, protocol, json!({"endpoint": "http://127.0.0.1:1/push"}), self.now());
        app.connections = connections;
        self.store.add_app(app.clone()).await;
        app
    }

    /// Creates a default pending notification for `app`.
    ///
    /// # Errors
    ///
    /// Returns error if the store rejects the notification.
    pub async fn create_notification(&self, app: &App) -> Result<Notification> {
        NotificationBuilder::new().create(self, app).await
    }

    /// Creates `count` pending notifications for `app` in order.
    ///
    /// # Errors
    ///
    /// Returns error if the store rejects any notification.
    pub async fn create_notifications(&self, app: &App, count: usize) -> Result<Vec<Notification>> {
        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            created.push(self.create_notification(app).await?);
        }
        Ok(created)
    }

    /// Reloads a notification from the store.
    ///
    /// # Errors
    ///
    /// Returns error if the notification does not exist.
    pub async fn reload(&self, id: NotificationId) -> Result<Notification> {
        match self.store.get(id).await {
            Some(notification) => Ok(notification),
            None => bail!("notification {id} not found"),
        }
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls `check` every 10ms until it returns true or `timeout` elapses.
///
/// # Errors
///
/// Returns error naming `what` if the condition never held.
pub async fn eventually<F, Fut>(what: &str, timeout: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out after {timeout:?} waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
