//! Notification persistence boundary.
//!
//! The store is the single source of truth for delivery eligibility. Every
//! lifecycle change is expressed as a pure transition on [`Notification`]
//! followed by exactly one persist call, so a batch of N notifications that
//! share an outcome costs one bulk write instead of N.
//!
//! Implementations:
//!
//! - [`postgres::PgStore`] for production, with reconnect-and-retry on
//!   connectivity loss.
//! - [`memory::MemoryStore`] for tests and embedded setups.

use std::{future::Future, pin::Pin};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::{
    error::Result,
    models::{App, AppId, NewNotification, Notification, NotificationId},
};

pub mod memory;
pub mod postgres;
pub mod reconnect;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use reconnect::ReconnectPolicy;

/// Boxed future returned by store operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Storage operations required by the delivery engine.
///
/// The required methods are persistence primitives; the provided `mark_*`
/// methods compose them with the in-memory transitions on `Notification`.
/// Persist primitives only touch rows that are still pending, so a terminal
/// row is never regressed.
pub trait NotificationStore: Send + Sync + 'static {
    /// Returns notifications that are neither delivered nor failed and whose
    /// `deliver_after` is unset or in the past, in a stable order.
    ///
    /// `None` returns every eligible notification.
    fn deliverable_notifications(
        &self,
        limit: Option<usize>,
    ) -> BoxFuture<'_, Result<Vec<Notification>>>;

    /// Persists `delivered = true, delivered_at = time` for `ids` in one write.
    fn persist_delivered<'a>(
        &'a self,
        ids: &'a [NotificationId],
        time: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Increments `retries` and sets `deliver_after` for `ids` in one write.
    fn persist_retryable<'a>(
        &'a self,
        ids: &'a [NotificationId],
        deliver_after: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Persists a permanent failure for `ids` in one write.
    fn persist_failed<'a>(
        &'a self,
        ids: &'a [NotificationId],
        code: Option<i32>,
        description: &'a str,
        time: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Creates a pending notification bound to `app`.
    fn create_notification<'a>(
        &'a self,
        attrs: NewNotification,
        data: serde_json::Value,
        registration_ids: Vec<String>,
        deliver_after: Option<DateTime<Utc>>,
        app: &'a App,
    ) -> BoxFuture<'a, Result<Notification>>;

    /// Finds an app by id.
    fn app(&self, id: AppId) -> BoxFuture<'_, Result<App>>;

    /// Returns every configured app.
    fn all_apps(&self) -> BoxFuture<'_, Result<Vec<App>>>;

    /// Saves changes to an app's configuration.
    fn update_app<'a>(&'a self, app: &'a App) -> BoxFuture<'a, Result<()>>;

    /// Saves every mutable field of a pending notification.
    ///
    /// Returns `CoreError::TerminalState` if the stored row is already
    /// delivered or failed.
    fn update_notification<'a>(
        &'a self,
        notification: &'a Notification,
    ) -> BoxFuture<'a, Result<()>>;

    /// Gives back any connection held on behalf of the caller.
    fn release_connection(&self) -> BoxFuture<'_, ()>;

    /// Marks one notification delivered and persists it.
    fn mark_delivered<'a>(
        &'a self,
        notification: &'a mut Notification,
        time: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            notification.mark_delivered(time)?;
            self.persist_delivered(&[notification.id], time).await
        })
    }

    /// Marks every pending member of the batch delivered with one write.
    fn mark_batch_delivered<'a>(
        &'a self,
        notifications: &'a mut [Notification],
        time: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let ids = transition_pending(notifications, |n| n.mark_delivered(time))?;
            if ids.is_empty() {
                return Ok(());
            }
            self.persist_delivered(&ids, time).await
        })
    }

    /// Counts a retryable failure for one notification and persists it.
    fn mark_retryable<'a>(
        &'a self,
        notification: &'a mut Notification,
        deliver_after: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            notification.mark_retryable(deliver_after)?;
            self.persist_retryable(&[notification.id], deliver_after).await
        })
    }

    /// Counts a retryable failure for every pending member with one write.
    fn mark_batch_retryable<'a>(
        &'a self,
        notifications: &'a mut [Notification],
        deliver_after: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let ids = transition_pending(notifications, |n| n.mark_retryable(deliver_after))?;
            if ids.is_empty() {
                return Ok(());
            }
            self.persist_retryable(&ids, deliver_after).await
        })
    }

    /// Marks one notification permanently failed and persists it.
    fn mark_failed<'a>(
        &'a self,
        notification: &'a mut Notification,
        code: Option<i32>,
        description: String,
        time: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            notification.mark_failed(code, description.as_str(), time)?;
            self.persist_failed(&[notification.id], code, &description, time).await
        })
    }

    /// Marks every pending member permanently failed with one write.
    fn mark_batch_failed<'a>(
        &'a self,
        notifications: &'a mut [Notification],
        code: Option<i32>,
        description: String,
        time: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let ids =
                transition_pending(notifications, |n| n.mark_failed(code, description.as_str(), time))?;
            if ids.is_empty() {
                return Ok(());
            }
            self.persist_failed(&ids, code, &description, time).await
        })
    }
}

/// Applies `transition` to every non-terminal notification and returns the
/// ids that changed. Terminal members are left untouched.
fn transition_pending(
    notifications: &mut [Notification],
    mut transition: impl FnMut(&mut Notification) -> Result<()>,
) -> Result<Vec<NotificationId>> {
    let mut ids = Vec::with_capacity(notifications.len());
    for notification in notifications.iter_mut() {
        if notification.is_terminal() {
            debug!(notification_id = %notification.id, "skipping terminal notification in batch");
            continue;
        }
        transition(notification)?;
        ids.push(notification.id);
    }
    Ok(ids)
}
