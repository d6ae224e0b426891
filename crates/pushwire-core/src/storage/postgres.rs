//! PostgreSQL notification store.
//!
//! Every operation runs through the store's [`ReconnectPolicy`], so a
//! dropped connection suspends the caller until the database answers a
//! probe again instead of failing the delivery cycle.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};
use tracing::debug;
use uuid::Uuid;

use super::{BoxFuture, NotificationStore, ReconnectPolicy};
use crate::{
    error::{CoreError, Result},
    models::{App, AppId, NewNotification, Notification, NotificationId},
    time::Clock,
};

const NOTIFICATION_COLUMNS: &str = "id, app_id, device_token, registration_ids, alert, \
     collapse_key, priority, data, delivered, delivered_at, failed, failed_at, error_code, \
     error_description, retries, deliver_after, fail_after, created_at, updated_at";

const APP_COLUMNS: &str =
    "id, name, protocol, environment, connections, credentials, created_at, updated_at";

/// Creates the tables and indexes the store relies on if they are missing.
///
/// # Errors
///
/// Returns error if any DDL statement fails.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS apps (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            protocol TEXT NOT NULL,
            environment TEXT,
            connections INTEGER NOT NULL DEFAULT 1 CHECK (connections > 0),
            credentials JSONB NOT NULL DEFAULT '{}'::jsonb,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS notifications (
            id UUID PRIMARY KEY,
            app_id UUID NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
            device_token TEXT,
            registration_ids JSONB NOT NULL DEFAULT '[]'::jsonb,
            alert TEXT,
            collapse_key TEXT,
            priority INTEGER,
            data JSONB NOT NULL DEFAULT '{}'::jsonb,
            delivered BOOLEAN NOT NULL DEFAULT FALSE,
            delivered_at TIMESTAMPTZ,
            failed BOOLEAN NOT NULL DEFAULT FALSE,
            failed_at TIMESTAMPTZ,
            error_code INTEGER,
            error_description TEXT,
            retries INTEGER NOT NULL DEFAULT 0,
            deliver_after TIMESTAMPTZ,
            fail_after TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            CHECK (NOT (delivered AND failed))
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_notifications_pending
            ON notifications (created_at, id)
            WHERE delivered = FALSE AND failed = FALSE
        ",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// PostgreSQL-backed implementation of [`NotificationStore`].
#[derive(Clone)]
pub struct PgStore {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
    reconnect: ReconnectPolicy,
}

impl PgStore {
    /// Creates a store over `pool` with the default reconnect policy.
    pub fn new(pool: Arc<PgPool>, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock, reconnect: ReconnectPolicy::default() }
    }

    /// Replaces the reconnect policy.
    #[must_use]
    pub fn with_reconnect_policy(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Checks that the database answers a trivial query.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Connection` while the database is unreachable.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&*self.pool).await?;
        Ok(())
    }

    /// Inserts a new app.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` if the name is taken.
    pub async fn create_app(&self, app: &App) -> Result<()> {
        self.reconnect.run("create_app", || self.insert_app(app), || self.ping()).await
    }

    async fn insert_app(&self, app: &App) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO apps (
                id, name, protocol, environment, connections, credentials,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(app.id)
        .bind(&app.name)
        .bind(app.protocol.to_string())
        .bind(&app.environment)
        .bind(app.connections)
        .bind(&app.credentials)
        .bind(app.created_at)
        .bind(app.updated_at)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_deliverable(&self, limit: Option<i64>) -> Result<Vec<Notification>> {
        let sql = format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications \
             WHERE delivered = FALSE AND failed = FALSE \
               AND (deliver_after IS NULL OR deliver_after < $1) \
             ORDER BY created_at ASC, id ASC \
             LIMIT $2"
        );

        let notifications = sqlx::query_as::<_, Notification>(&sql)
            .bind(self.clock.now())
            .bind(limit)
            .fetch_all(&*self.pool)
            .await?;
        Ok(notifications)
    }

    async fn update_delivered(&self, ids: &[Uuid], time: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE notifications
            SET delivered = TRUE, delivered_at = $2, updated_at = $3
            WHERE id = ANY($1) AND delivered = FALSE AND failed = FALSE
            ",
        )
        .bind(ids)
        .bind(time)
        .bind(self.clock.now())
        .execute(&*self.pool)
        .await?;

        debug!(requested = ids.len(), updated = result.rows_affected(), "persisted delivered");
        Ok(())
    }

    async fn update_retryable(&self, ids: &[Uuid], deliver_after: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE notifications
            SET retries = retries + 1, deliver_after = $2, updated_at = $3
            WHERE id = ANY($1) AND delivered = FALSE AND failed = FALSE
            ",
        )
        .bind(ids)
        .bind(deliver_after)
        .bind(self.clock.now())
        .execute(&*self.pool)
        .await?;

        debug!(requested = ids.len(), updated = result.rows_affected(), "persisted retryable");
        Ok(())
    }

    async fn update_failed(
        &self,
        ids: &[Uuid],
        code: Option<i32>,
        description: &str,
        time: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE notifications
            SET failed = TRUE, failed_at = $2, error_code = $3, error_description = $4,
                delivered = FALSE, delivered_at = NULL, updated_at = $5
            WHERE id = ANY($1) AND delivered = FALSE AND failed = FALSE
            ",
        )
        .bind(ids)
        .bind(time)
        .bind(code)
        .bind(description)
        .bind(self.clock.now())
        .execute(&*self.pool)
        .await?;

        debug!(requested = ids.len(), updated = result.rows_affected(), "persisted failed");
        Ok(())
    }

    async fn insert_notification(&self, notification: &Notification) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO notifications (
                id, app_id, device_token, registration_ids, alert, collapse_key,
                priority, data, delivered, failed, retries, deliver_after,
                fail_after, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, FALSE, FALSE, 0, $9, $10, $11, $12)
            ON CONFLICT (id) DO NOTHING
            ",
        )
        .bind(notification.id)
        .bind(notification.app_id)
        .bind(&notification.device_token)
        .bind(&notification.registration_ids)
        .bind(&notification.alert)
        .bind(&notification.collapse_key)
        .bind(notification.priority)
        .bind(&notification.data)
        .bind(notification.deliver_after)
        .bind(notification.fail_after)
        .bind(notification.created_at)
        .bind(notification.updated_at)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    async fn find_app(&self, id: AppId) -> Result<App> {
        let sql = format!("SELECT {APP_COLUMNS} FROM apps WHERE id = $1");
        sqlx::query_as::<_, App>(&sql)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("app {id} not found")))
    }

    async fn find_apps(&self) -> Result<Vec<App>> {
        let sql = format!("SELECT {APP_COLUMNS} FROM apps ORDER BY name ASC");
        let apps = sqlx::query_as::<_, App>(&sql).fetch_all(&*self.pool).await?;
        Ok(apps)
    }

    async fn save_app(&self, app: &App) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE apps
            SET name = $2, protocol = $3, environment = $4, connections = $5,
                credentials = $6, updated_at = $7
            WHERE id = $1
            ",
        )
        .bind(app.id)
        .bind(&app.name)
        .bind(app.protocol.to_string())
        .bind(&app.environment)
        .bind(app.connections)
        .bind(&app.credentials)
        .bind(self.clock.now())
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("app {} not found", app.id)));
        }
        Ok(())
    }

    async fn save_notification(&self, n: &Notification) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE notifications
            SET device_token = $2, registration_ids = $3, alert = $4, collapse_key = $5,
                priority = $6, data = $7, delivered = $8, delivered_at = $9, failed = $10,
                failed_at = $11, error_code = $12, error_description = $13, retries = $14,
                deliver_after = $15, fail_after = $16, updated_at = $17
            WHERE id = $1 AND delivered = FALSE AND failed = FALSE
            ",
        )
        .bind(n.id)
        .bind(&n.device_token)
        .bind(&n.registration_ids)
        .bind(&n.alert)
        .bind(&n.collapse_key)
        .bind(n.priority)
        .bind(&n.data)
        .bind(n.delivered)
        .bind(n.delivered_at)
        .bind(n.failed)
        .bind(n.failed_at)
        .bind(n.error_code)
        .bind(&n.error_description)
        .bind(n.retries)
        .bind(n.deliver_after)
        .bind(n.fail_after)
        .bind(self.clock.now())
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let terminal: Option<bool> =
                sqlx::query_scalar("SELECT delivered OR failed FROM notifications WHERE id = $1")
                    .bind(n.id)
                    .fetch_optional(&*self.pool)
                    .await?;
            return match terminal {
                Some(true) => Err(CoreError::TerminalState { id: n.id }),
                _ => Err(CoreError::NotFound(format!("notification {} not found", n.id))),
            };
        }
        Ok(())
    }
}

fn raw_ids(ids: &[NotificationId]) -> Vec<Uuid> {
    ids.iter().map(|id| id.0).collect()
}

impl NotificationStore for PgStore {
    fn deliverable_notifications(
        &self,
        limit: Option<usize>,
    ) -> BoxFuture<'_, Result<Vec<Notification>>> {
        Box::pin(async move {
            let limit = limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX));
            self.reconnect
                .run("deliverable_notifications", || self.fetch_deliverable(limit), || self.ping())
                .await
        })
    }

    fn persist_delivered<'a>(
        &'a self,
        ids: &'a [NotificationId],
        time: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let ids = raw_ids(ids);
            self.reconnect
                .run("persist_delivered", || self.update_delivered(&ids, time), || self.ping())
                .await
        })
    }

    fn persist_retryable<'a>(
        &'a self,
        ids: &'a [NotificationId],
        deliver_after: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let ids = raw_ids(ids);
            self.reconnect
                .run(
                    "persist_retryable",
                    || self.update_retryable(&ids, deliver_after),
                    || self.ping(),
                )
                .await
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
            let ids = raw_ids(ids);
            self.reconnect
                .run(
                    "persist_failed",
                    || self.update_failed(&ids, code, description, time),
                    || self.ping(),
                )
                .await
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
            self.reconnect
                .run(
                    "create_notification",
                    || self.insert_notification(&notification),
                    || self.ping(),
                )
                .await?;
            Ok(notification)
        })
    }

    fn app(&self, id: AppId) -> BoxFuture<'_, Result<App>> {
        Box::pin(async move {
            self.reconnect.run("app", || self.find_app(id), || self.ping()).await
        })
    }

    fn all_apps(&self) -> BoxFuture<'_, Result<Vec<App>>> {
        Box::pin(async move {
            self.reconnect.run("all_apps", || self.find_apps(), || self.ping()).await
        })
    }

    fn update_app<'a>(&'a self, app: &'a App) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.reconnect.run("update_app", || self.save_app(app), || self.ping()).await
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
            self.reconnect
                .run("update_notification", || self.save_notification(notification), || self.ping())
                .await
        })
    }

    fn release_connection(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            // Connections are checked out per query and already back in the pool.
            debug!(
                idle = self.pool.num_idle(),
                size = self.pool.size(),
                "released feeder database connection"
            );
        })
    }
}
