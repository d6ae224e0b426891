//! In-memory notification store.
//!
//! Deterministic storage for tests and embedded setups that do not need
//! durability. Records every fetch limit and persist call so callers can
//! assert on store traffic, and supports injecting fetch errors.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{BoxFuture, NotificationStore};
use crate::{
    error::{CoreError, Result},
    models::{App, AppId, NewNotification, Notification, NotificationId},
    time::Clock,
};

/// A persist primitive observed by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistCall {
    /// `persist_delivered` with this many ids.
    Delivered(usize),
    /// `persist_retryable` with this many ids.
    Retryable(usize),
    /// `persist_failed` with this many ids.
    Failed(usize),
}

#[derive(Default)]
struct State {
    // Insertion order doubles as the stable fetch order.
    notifications: Vec<Notification>,
    apps: HashMap<AppId, App>,
    fetch_limits: Vec<Option<usize>>,
    persist_calls: Vec<PersistCall>,
    fetch_errors: Vec<CoreError>,
    released: usize,
}

/// In-memory implementation of [`NotificationStore`].
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Creates an empty store reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { state: Arc::new(RwLock::new(State::default())), clock }
    }

    /// Registers an app.
    pub async fn add_app(&self, app: App) {
        self.state.write().await.apps.insert(app.id, app);
    }

    /// Removes an app, leaving its notifications in place.
    pub async fn remove_app(&self, id: AppId) {
        self.state.write().await.apps.remove(&id);
    }

    /// Inserts a notification as-is, bypassing validation.
    pub async fn insert(&self, notification: Notification) {
        self.state.write().await.notifications.push(notification);
    }

    /// Returns the stored copy of a notification.
    pub async fn get(&self, id: NotificationId) -> Option<Notification> {
        self.state.read().await.notifications.iter().find(|n| n.id == id).cloned()
    }

    /// Returns every stored notification in insertion order.
    pub async fn notifications(&self) -> Vec<Notification> {
        self.state.read().await.notifications.clone()
    }

    /// Makes the next fetch fail with `error`. Multiple injections are
    /// consumed in order.
    pub async fn inject_fetch_error(&self, error: CoreError) {
        self.state.write().await.fetch_errors.push(error);
    }

    /// Limits passed to every `deliverable_notifications` call so far.
    pub async fn fetch_limits(&self) -> Vec<Option<usize>> {
        self.state.read().await.fetch_limits.clone()
    }

    /// Persist primitives invoked so far.
    pub async fn persist_calls(&self) -> Vec<PersistCall> {
        self.state.read().await.persist_calls.clone()
    }

    /// Number of times `release_connection` was called.
    pub async fn released_connections(&self) -> usize {
        self.state.read().await.released
    }

    async fn update_pending(
        &self,
        ids: &[NotificationId],
        call: PersistCall,
        mut apply: impl FnMut(&mut Notification),
    ) {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        state.persist_calls.push(call);
        for notification in state
            .notifications
            .iter_mut()
            .filter(|n| ids.contains(&n.id) && !n.is_terminal())
        {
            apply(notification);
            notification.updated_at = now;
        }
    }
}

impl NotificationStore for MemoryStore {
    fn deliverable_notifications(
        &self,
        limit: Option<usize>,
    ) -> BoxFuture<'_, Result<Vec<Notification>>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut state = self.state.write().await;
            state.fetch_limits.push(limit);

            if !state.fetch_errors.is_empty() {
                return Err(state.fetch_errors.remove(0));
            }

            let eligible = state.notifications.iter().filter(|n| n.is_deliverable(now)).cloned();
            Ok(match limit {
                Some(limit) => eligible.take(limit).collect(),
                None => eligible.collect(),
            })
        })
    }

    fn persist_delivered<'a>(
        &'a self,
        ids: &'a [NotificationId],
        time: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.update_pending(ids, PersistCall::Delivered(ids.len()), |n| {
                n.delivered = true;
                n.delivered_at = Some(time);
            })
            .await;
            Ok(())
        })
    }

    fn persist_retryable<'a>(
        &'a self,
        ids: &'a [NotificationId],
        deliver_after: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.update_pending(ids, PersistCall::Retryable(ids.len()), |n| {
                n.delivered = false;
                n.delivered_at = None;
                n.failed = false;
                n.failed_at = None;
                n.retries = n.retries.saturating_add(1);
                n.deliver_after = Some(deliver_after);
            })
            .await;
            Ok(())
        })
    }

    fn persist_failed<'a>(
        &'a self,
        ids: &'a [NotificationId],
        code: Option<i32>,
        description: &'a str,
        time: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.update_pending(ids, PersistCall::Failed(ids.len()), |n| {
                n.delivered = false;
                n.delivered_at = None;
                n.failed = true;
                n.failed_at = Some(time);
                n.error_code = code;
                n.error_description = Some(description.to_string());
            })
            .await;
            Ok(())
        })
    }

    fn create_notification<'a>(
        &'a self,
        attrs: NewNotification,
        data: serde_json::Value,
        registration_ids: Vec<String>,
        deliver_after: Option<DateTime<Utc>>,
        app: &'a App,
    ) -> BoxFuture<'a, Result<Notification>> {
        Box::pin(async move {
            let notification =
                Notification::new(app, attrs, data, registration_ids, deliver_after, self.clock.now())?;
            self.state.write().await.notifications.push(notification.clone());
            Ok(notification)
        })
    }

    fn app(&self, id: AppId) -> BoxFuture<'_, Result<App>> {
        Box::pin(async move {
            self.state
                .read()
                .await
                .apps
                .get(&id)
                .cloned()
                .ok_or_else(|| CoreError::NotFound(format!("app {id} not found")))
        })
    }

    fn all_apps(&self) -> BoxFuture<'_, Result<Vec<App>>> {
        Box::pin(async move {
            let mut apps: Vec<App> = self.state.read().await.apps.values().cloned().collect();
            apps.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(apps)
        })
    }

    fn update_app<'a>(&'a self, app: &'a App) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let stored = state
                .apps
                .get_mut(&app.id)
                .ok_or_else(|| CoreError::NotFound(format!("app {} not found", app.id)))?;
            *stored = App { updated_at: self.clock.now(), ..app.clone() };
            Ok(())
        })
    }

    fn update_notification<'a>(
        &'a self,
        notification: &'a Notification,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if notification.delivered && notification.failed {
                return Err(CoreError::InvalidInput(format!(
                    "notification {} cannot be both delivered and failed",
                    notification.id
                )));
            }

            let mut state = self.state.write().await;
            let stored = state
                .notifications
                .iter_mut()
                .find(|n| n.id == notification.id)
                .ok_or_else(|| {
                    CoreError::NotFound(format!("notification {} not found", notification.id))
                })?;
            if stored.is_terminal() {
                return Err(CoreError::TerminalState { id: stored.id });
            }
            *stored = Notification { updated_at: self.clock.now(), ..notification.clone() };
            Ok(())
        })
    }

    fn release_connection(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.state.write().await.released += 1;
        })
    }
}
