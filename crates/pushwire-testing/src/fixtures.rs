//! Builders for test notifications.

use anyhow::Result;
use chrono::{DateTime, Utc};
use pushwire_core::{App, NewNotification, Notification, NotificationStore};
use serde_json::{json, Value};

use crate::TestEnv;

/// Builder for pending notifications with sensible defaults.
#[derive(Debug, Clone)]
pub struct NotificationBuilder {
    attrs: NewNotification,
    data: Value,
    registration_ids: Vec<String>,
    deliver_after: Option<DateTime<Utc>>,
    retries: i32,
}

impl NotificationBuilder {
    /// Starts from a token-addressed notification with an alert.
    pub fn new() -> Self {
        Self {
            attrs: NewNotification {
                device_token: Some("0".repeat(64)),
                alert: Some("test alert".to_string()),
                ..Default::default()
            },
            data: json!({"source": "test"}),
            registration_ids: Vec::new(),
            deliver_after: None,
            retries: 0,
        }
    }

    /// Sets the hard delivery deadline.
    #[must_use]
    pub fn fail_after(mut self, deadline: DateTime<Utc>) -> Self {
        self.attrs.fail_after = Some(deadline);
        self
    }

    /// Defers the first attempt.
    #[must_use]
    pub fn deliver_after(mut self, time: DateTime<Utc>) -> Self {
        self.deliver_after = Some(time);
        self
    }

    /// Starts the notification with previous failures already counted.
    #[must_use]
    pub fn retries(mut self, retries: i32) -> Self {
        self.retries = retries;
        self
    }

    /// Addresses the notification by registration ids instead of a token.
    #[must_use]
    pub fn registration_ids(mut self, ids: &[&str]) -> Self {
        self.attrs.device_token = None;
        self.registration_ids = ids.iter().map(ToString::to_string).collect();
        self
    }

    /// Creates the notification in the environment's store.
    ///
    /// # Errors
    ///
    /// Returns error if the store rejects the notification.
    pub async fn create(self, env: &TestEnv, app: &App) -> Result<Notification> {
        let mut notification = env
            .store
            .create_notification(self.attrs, self.data, self.registration_ids, self.deliver_after, app)
            .await?;

        if self.retries > 0 {
            notification.retries = self.retries;
            env.store.update_notification(&notification).await?;
        }
        Ok(notification)
    }
}

impl Default for NotificationBuilder {
    fn default() -> Self {
        Self::new()
    }
}
