//! Outcome recording for delivery attempts.
//!
//! [`Delivery`] turns gateway results into notification state: successes
//! become delivered, permanent errors become failed with the protocol code,
//! and retryable errors are rescheduled unless the notification's hard
//! deadline has already passed.

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use pushwire_core::{Clock, Notification, NotificationStore};
use tracing::{debug, info, warn};

use crate::{
    error::{DeliveryError, Result},
    retry::{offset, BackoffPolicy, RetryDecision},
};

/// Records delivery outcomes through a [`NotificationStore`].
#[derive(Clone)]
pub struct Delivery {
    store: Arc<dyn NotificationStore>,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery").field("backoff", &self.backoff).finish_non_exhaustive()
    }
}

impl Delivery {
    /// Creates a recorder with the default unbounded backoff.
    pub fn new(store: Arc<dyn NotificationStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock, backoff: BackoffPolicy::default() }
    }

    /// Replaces the backoff policy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Reschedules a notification, or fails it if its deadline has passed.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Store` if the notification is already terminal
    /// or the write fails.
    pub async fn mark_retryable(
        &self,
        notification: &mut Notification,
        deliver_after: DateTime<Utc>,
    ) -> Result<()> {
        let now = self.clock.now();
        if let Some(deadline) = expired_deadline(notification, now) {
            info!(
                notification_id = %notification.id,
                fail_after = %deadline,
                "deadline passed, failing instead of retrying"
            );
            self.store.mark_failed(notification, None, deadline_description(deadline), now).await?;
            return Ok(());
        }

        self.store.mark_retryable(notification, deliver_after).await?;
        debug!(
            notification_id = %notification.id,
            retries = notification.retries,
            deliver_after = %deliver_after,
            "notification rescheduled"
        );
        Ok(())
    }

    /// Reschedules a notification `2^(retries + 1)` seconds from now.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Store` if the notification is already terminal
    /// or the write fails.
    pub async fn mark_retryable_exponential(&self, notification: &mut Notification) -> Result<()> {
        let now = self.clock.now();
        if expired_deadline(notification, now).is_some() {
            return self.mark_retryable(notification, now).await;
        }
        match self.backoff.decide(notification.retries, now) {
            RetryDecision::Retry { deliver_after } => {
                self.mark_retryable(notification, deliver_after).await
            },
            RetryDecision::GiveUp => {
                let description = exhausted_description(notification.retries);
                warn!(notification_id = %notification.id, retries = notification.retries, "retry budget spent");
                self.store.mark_failed(notification, None, description, now).await?;
                Ok(())
            },
        }
    }

    /// Marks a notification delivered now.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Store` if the notification is already terminal
    /// or the write fails.
    pub async fn mark_delivered(&self, notification: &mut Notification) -> Result<()> {
        self.store.mark_delivered(notification, self.clock.now()).await?;
        Ok(())
    }

    /// Marks every pending member of a batch delivered with one write.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Store` if the write fails.
    pub async fn mark_batch_delivered(&self, notifications: &mut [Notification]) -> Result<()> {
        self.store.mark_batch_delivered(notifications, self.clock.now()).await?;
        debug!(batch_size = notifications.len(), "batch delivered");
        Ok(())
    }

    /// Fails a notification with the error's code and text.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Store` if the notification is already terminal
    /// or the write fails.
    pub async fn mark_failed(
        &self,
        notification: &mut Notification,
        error: &DeliveryError,
    ) -> Result<()> {
        self.store
            .mark_failed(notification, error.code(), error.to_string(), self.clock.now())
            .await?;
        info!(notification_id = %notification.id, code = ?error.code(), error = %error, "notification failed");
        Ok(())
    }

    /// Fails every pending member of a batch with one write.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Store` if the write fails.
    pub async fn mark_batch_failed(
        &self,
        notifications: &mut [Notification],
        error: &DeliveryError,
    ) -> Result<()> {
        self.store
            .mark_batch_failed(notifications, error.code(), error.to_string(), self.clock.now())
            .await?;
        info!(batch_size = notifications.len(), code = ?error.code(), error = %error, "batch failed");
        Ok(())
    }

    /// Reschedules a batch, failing members whose deadline has passed.
    ///
    /// Members are reordered so that each outcome is written with a single
    /// bulk call.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Store` if any write fails.
    pub async fn mark_batch_retryable(
        &self,
        notifications: &mut [Notification],
        deliver_after: DateTime<Utc>,
    ) -> Result<()> {
        let now = self.clock.now();
        notifications.sort_by_key(|n| expired_deadline(n, now));

        for group in notifications.chunk_by_mut(|a, b| {
            expired_deadline(a, now) == expired_deadline(b, now)
        }) {
            match expired_deadline(&group[0], now) {
                None => {
                    self.store.mark_batch_retryable(group, deliver_after).await?;
                    debug!(batch_size = group.len(), deliver_after = %deliver_after, "batch rescheduled");
                },
                Some(deadline) => {
                    info!(batch_size = group.len(), fail_after = %deadline, "deadline passed, failing batch members");
                    self.store
                        .mark_batch_failed(group, None, deadline_description(deadline), now)
                        .await?;
                },
            }
        }
        Ok(())
    }

    /// Reschedules a batch `delay` from now, as asked by the gateway.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Store` if any write fails.
    pub async fn mark_batch_retryable_in(
        &self,
        notifications: &mut [Notification],
        delay: Duration,
    ) -> Result<()> {
        let deliver_after = offset(self.clock.now(), delay);
        self.mark_batch_retryable(notifications, deliver_after).await
    }

    /// Reschedules a batch with per-notification exponential backoff.
    ///
    /// Members sharing a retry count share a `deliver_after`, so the number
    /// of writes is the number of distinct retry counts in the batch.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Store` if any write fails.
    pub async fn mark_batch_retryable_exponential(
        &self,
        notifications: &mut [Notification],
    ) -> Result<()> {
        let now = self.clock.now();
        notifications.sort_by_key(|n| n.retries);

        for group in notifications.chunk_by_mut(|a, b| a.retries == b.retries) {
            let retries = group[0].retries;
            match self.backoff.decide(retries, now) {
                RetryDecision::Retry { deliver_after } => {
                    self.mark_batch_retryable(group, deliver_after).await?;
                },
                RetryDecision::GiveUp => {
                    group.sort_by_key(|n| expired_deadline(n, now));
                    for outcome in group.chunk_by_mut(|a, b| {
                        expired_deadline(a, now) == expired_deadline(b, now)
                    }) {
                        let description = match expired_deadline(&outcome[0], now) {
                            Some(deadline) => deadline_description(deadline),
                            None => exhausted_description(retries),
                        };
                        warn!(batch_size = outcome.len(), retries, "retry budget spent for batch members");
                        self.store.mark_batch_failed(outcome, None, description, now).await?;
                    }
                },
            }
        }
        Ok(())
    }
}

fn expired_deadline(notification: &Notification, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    notification.fail_after.filter(|_| notification.deadline_passed(now))
}

/// Failure description recorded when a retry would overrun `fail_after`.
pub fn deadline_description(deadline: DateTime<Utc>) -> String {
    format!("Notification failed to be delivered before {}.", deadline.format("%Y-%m-%d %H:%M:%S"))
}

fn exhausted_description(retries: i32) -> String {
    format!("Notification failed to be delivered after {retries} retries.")
}

#[cfg(test)]
mod tests {
    use pushwire_core::{storage::memory::PersistCall, App, MemoryStore, NewNotification, Protocol, TestClock};
    use serde_json::json;

    use super::*;

    async fn setup() -> (Delivery, MemoryStore, TestClock, App) {
        let clock = TestClock::at(DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        let store = MemoryStore::new(Arc::new(clock.clone()));
        let app = App::new("ios", Protocol::Apns, json!({}), clock.now());
        store.add_app(app.clone()).await;
        let delivery = Delivery::new(Arc::new(store.clone()), Arc::new(clock.clone()));
        (delivery, store, clock, app)
    }

    async fn create(store: &MemoryStore, app: &App, fail_after: Option<DateTime<Utc>>) -> Notification {
        let attrs = NewNotification {
            device_token: Some("d".repeat(64)),
            fail_after,
            ..Default::default()
        };
        store.create_notification(attrs, json!({}), Vec::new(), None, app).await.unwrap()
    }

    #[test]
    fn deadline_description_names_the_deadline() {
        let deadline = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(
            deadline_description(deadline),
            "Notification failed to be delivered before 2023-11-14 22:13:20."
        );
    }

    #[tokio::test]
    async fn exponential_retry_doubles_per_attempt() {
        let (delivery, store, clock, app) = setup().await;
        let mut n = create(&store, &app, None).await;

        delivery.mark_retryable_exponential(&mut n).await.unwrap();
        assert_eq!(n.retries, 1);
        assert_eq!(n.deliver_after, Some(clock.now() + chrono::Duration::seconds(2)));

        delivery.mark_retryable_exponential(&mut n).await.unwrap();
        assert_eq!(n.retries, 2);
        assert_eq!(n.deliver_after, Some(clock.now() + chrono::Duration::seconds(4)));
    }

    #[tokio::test]
    async fn expired_deadline_fails_without_code() {
        let (delivery, store, clock, app) = setup().await;
        let deadline = clock.now() - chrono::Duration::seconds(1);
        let mut n = create(&store, &app, Some(deadline)).await;

        delivery.mark_retryable_exponential(&mut n).await.unwrap();

        let stored = store.get(n.id).await.unwrap();
        assert!(stored.failed);
        assert_eq!(stored.retries, 0);
        assert_eq!(stored.error_code, None);
        assert_eq!(stored.error_description, Some(deadline_description(deadline)));
    }

    #[tokio::test]
    async fn batch_exponential_groups_by_retry_count() {
        let (delivery, store, clock, app) = setup().await;
        let mut batch = Vec::new();
        for retries in [0, 2, 0, 2, 1] {
            let mut n = create(&store, &app, None).await;
            n.retries = retries;
            store.update_notification(&n).await.unwrap();
            batch.push(n);
        }

        delivery.mark_batch_retryable_exponential(&mut batch).await.unwrap();

        assert_eq!(
            store.persist_calls().await,
            vec![PersistCall::Retryable(2), PersistCall::Retryable(1), PersistCall::Retryable(2)]
        );
        for n in &batch {
            let expected = clock.now() + chrono::Duration::seconds(2i64.pow(u32::try_from(n.retries).unwrap()));
            assert_eq!(n.deliver_after, Some(expected));
        }
    }

    #[tokio::test]
    async fn batch_retryable_splits_expired_members() {
        let (delivery, store, clock, app) = setup().await;
        let deadline = clock.now() - chrono::Duration::seconds(5);
        let mut batch = vec![
            create(&store, &app, Some(deadline)).await,
            create(&store, &app, None).await,
            create(&store, &app, Some(clock.now() + chrono::Duration::hours(1))).await,
        ];

        clock.advance(Duration::from_secs(1));
        delivery
            .mark_batch_retryable(&mut batch, clock.now() + chrono::Duration::seconds(2))
            .await
            .unwrap();

        assert_eq!(
            store.persist_calls().await,
            vec![PersistCall::Retryable(2), PersistCall::Failed(1)]
        );
        assert_eq!(batch.iter().filter(|n| n.failed).count(), 1);
        assert_eq!(batch.iter().filter(|n| n.retries == 1).count(), 2);
    }

    #[tokio::test]
    async fn retry_budget_turns_into_failure() {
        let (delivery, store, _clock, app) = setup().await;
        let delivery = delivery.with_backoff(BackoffPolicy { max_retries: Some(1), ..Default::default() });
        let mut n = create(&store, &app, None).await;

        delivery.mark_retryable_exponential(&mut n).await.unwrap();
        assert_eq!(n.retries, 1);
        delivery.mark_retryable_exponential(&mut n).await.unwrap();

        assert!(n.failed);
        assert_eq!(n.error_code, None);
    }

    #[tokio::test]
    async fn passed_deadline_wins_over_spent_retry_budget() {
        let (delivery, store, clock, app) = setup().await;
        let delivery = delivery.with_backoff(BackoffPolicy { max_retries: Some(3), ..Default::default() });
        let deadline = clock.now() - chrono::Duration::seconds(1);
        let mut n = create(&store, &app, Some(deadline)).await;
        n.retries = 3;
        store.update_notification(&n).await.unwrap();

        delivery.mark_retryable_exponential(&mut n).await.unwrap();

        let stored = store.get(n.id).await.unwrap();
        assert!(stored.failed);
        assert_eq!(stored.error_description, Some(deadline_description(deadline)));
    }

    #[tokio::test]
    async fn batch_with_spent_budget_keeps_deadline_description() {
        let (delivery, store, clock, app) = setup().await;
        let delivery = delivery.with_backoff(BackoffPolicy { max_retries: Some(2), ..Default::default() });
        let deadline = clock.now() - chrono::Duration::seconds(1);
        let mut batch = vec![create(&store, &app, Some(deadline)).await, create(&store, &app, None).await];
        for n in &mut batch {
            n.retries = 2;
            store.update_notification(n).await.unwrap();
        }

        delivery.mark_batch_retryable_exponential(&mut batch).await.unwrap();

        assert_eq!(store.persist_calls().await, vec![PersistCall::Failed(1), PersistCall::Failed(1)]);
        let expired = store.get(batch.iter().find(|n| n.fail_after.is_some()).unwrap().id).await.unwrap();
        assert_eq!(expired.error_description, Some(deadline_description(deadline)));
        let spent = store.get(batch.iter().find(|n| n.fail_after.is_none()).unwrap().id).await.unwrap();
        assert_eq!(spent.error_description.as_deref(), Some("Notification failed to be delivered after 2 retries."));
    }

    #[tokio::test]
    async fn delivered_records_delivery_time() {
        let (delivery, store, clock, app) = setup().await;
        let mut n = create(&store, &app, None).await;

        delivery.mark_delivered(&mut n).await.unwrap();

        assert!(n.delivered);
        let stored = store.get(n.id).await.unwrap();
        assert!(stored.delivered && !stored.failed);
        assert_eq!(stored.delivered_at, Some(clock.now()));
        assert!(matches!(
            delivery.mark_delivered(&mut n).await,
            Err(DeliveryError::Store(_))
        ));
    }

    #[tokio::test]
    async fn failed_records_protocol_code() {
        let (delivery, store, _clock, app) = setup().await;
        let mut n = create(&store, &app, None).await;

        delivery.mark_failed(&mut n, &DeliveryError::protocol(8, "Invalid token")).await.unwrap();

        let stored = store.get(n.id).await.unwrap();
        assert_eq!(stored.error_code, Some(8));
        assert_eq!(stored.error_description.as_deref(), Some("Invalid token"));
    }
}
