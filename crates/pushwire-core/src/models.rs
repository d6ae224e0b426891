//! Core domain models and strongly-typed identifiers.
//!
//! Defines notifications, destination apps, and newtype ID wrappers. The
//! notification lifecycle transitions live here as pure in-memory state
//! changes; persisting them is the store's job.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

use crate::error::{CoreError, Result};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed notification identifier.
///
/// Stable for the lifetime of the notification; bulk status updates are
/// keyed by sets of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NotificationId(pub Uuid);

impl NotificationId {
    /// Creates a new random notification ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NotificationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for NotificationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for NotificationId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for NotificationId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for NotificationId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed app identifier.
///
/// Each app is one delivery destination with its own credentials, protocol,
/// queue and worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppId(pub Uuid);

impl AppId {
    /// Creates a new random app ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AppId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for AppId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for AppId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for AppId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for AppId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Push protocol spoken by an app's gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Apple push over a persistent TLS socket.
    Apns,
    /// Google cloud messaging over HTTP.
    Gcm,
    /// Amazon device messaging over HTTP.
    Adm,
    /// Generic JSON relay over HTTP.
    Webhook,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apns => write!(f, "apns"),
            Self::Gcm => write!(f, "gcm"),
            Self::Adm => write!(f, "adm"),
            Self::Webhook => write!(f, "webhook"),
        }
    }
}

impl FromStr for Protocol {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "apns" => Ok(Self::Apns),
            "gcm" => Ok(Self::Gcm),
            "adm" => Ok(Self::Adm),
            "webhook" => Ok(Self::Webhook),
            _ => Err(CoreError::InvalidInput(format!("unknown protocol: {s}"))),
        }
    }
}

impl sqlx::Type<PgDb> for Protocol {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for Protocol {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse().map_err(|e: CoreError| e.to_string().into())
    }
}

/// A delivery destination.
///
/// Credentials are opaque to the engine and only interpreted by the gateway
/// built for the app's protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct App {
    /// Unique identifier for this app.
    pub id: AppId,

    /// Human-readable name, unique across apps.
    pub name: String,

    /// Protocol used to reach the gateway.
    pub protocol: Protocol,

    /// Gateway environment (e.g. "production", "sandbox").
    pub environment: Option<String>,

    /// Number of concurrent gateway connections, one worker each.
    pub connections: i32,

    /// Protocol-specific credentials and endpoint settings.
    pub credentials: Json<serde_json::Value>,

    /// When this app was created.
    pub created_at: DateTime<Utc>,

    /// When this app was last updated.
    pub updated_at: DateTime<Utc>,
}

impl App {
    /// Creates a new app with a single connection.
    pub fn new(
        name: impl Into<String>,
        protocol: Protocol,
        credentials: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AppId::new(),
            name: name.into(),
            protocol,
            environment: None,
            connections: 1,
            credentials: Json(credentials),
            created_at: now,
            updated_at: now,
        }
    }

    /// Number of workers to run for this app. Never less than one.
    pub fn worker_count(&self) -> usize {
        usize::try_from(self.connections).unwrap_or(0).max(1)
    }
}

/// Attributes supplied by ingestion when creating a notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewNotification {
    /// Device token for token-addressed protocols.
    pub device_token: Option<String>,

    /// Alert text shown to the user.
    pub alert: Option<String>,

    /// Collapse key for protocols that coalesce pending messages.
    pub collapse_key: Option<String>,

    /// Protocol priority hint.
    pub priority: Option<i32>,

    /// Hard deadline after which the notification must not be retried.
    pub fail_after: Option<DateTime<Utc>>,
}

/// A single push message with its own delivery lifecycle.
///
/// `delivered` and `failed` are mutually exclusive. Once either is set the
/// notification is terminal and every transition method returns
/// [`CoreError::TerminalState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    /// Unique identifier for this notification.
    pub id: NotificationId,

    /// App this notification is delivered through.
    pub app_id: AppId,

    /// Device token for token-addressed protocols.
    pub device_token: Option<String>,

    /// Registration ids for multicast protocols.
    pub registration_ids: Json<Vec<String>>,

    /// Alert text shown to the user.
    pub alert: Option<String>,

    /// Collapse key for protocols that coalesce pending messages.
    pub collapse_key: Option<String>,

    /// Protocol priority hint.
    pub priority: Option<i32>,

    /// Custom payload data.
    pub data: Json<serde_json::Value>,

    /// Whether the gateway accepted the notification.
    pub delivered: bool,

    /// When the notification was delivered.
    pub delivered_at: Option<DateTime<Utc>>,

    /// Whether the notification permanently failed.
    pub failed: bool,

    /// When the notification failed.
    pub failed_at: Option<DateTime<Utc>>,

    /// Protocol error code reported by the gateway, if any.
    pub error_code: Option<i32>,

    /// Human-readable failure description.
    pub error_description: Option<String>,

    /// Number of retryable failures so far.
    pub retries: i32,

    /// Not eligible for delivery before this time.
    pub deliver_after: Option<DateTime<Utc>>,

    /// Retries after this time become permanent failures.
    pub fail_after: Option<DateTime<Utc>>,

    /// When the notification was created.
    pub created_at: DateTime<Utc>,

    /// When the notification was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Notification {
    /// Builds a pending notification for `app`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` when the notification has neither a
    /// device token nor any registration id.
    pub fn new(
        app: &App,
        attrs: NewNotification,
        data: serde_json::Value,
        registration_ids: Vec<String>,
        deliver_after: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let has_token = attrs.device_token.as_deref().is_some_and(|t| !t.is_empty());
        if !has_token && registration_ids.is_empty() {
            return Err(CoreError::InvalidInput(
                "notification needs a device token or at least one registration id".to_string(),
            ));
        }

        Ok(Self {
            id: NotificationId::new(),
            app_id: app.id,
            device_token: attrs.device_token,
            registration_ids: Json(registration_ids),
            alert: attrs.alert,
            collapse_key: attrs.collapse_key,
            priority: attrs.priority,
            data: Json(data),
            delivered: false,
            delivered_at: None,
            failed: false,
            failed_at: None,
            error_code: None,
            error_description: None,
            retries: 0,
            deliver_after,
            fail_after: attrs.fail_after,
            created_at: now,
            updated_at: now,
        })
    }

    /// Returns whether the notification has been delivered or failed.
    pub const fn is_terminal(&self) -> bool {
        self.delivered || self.failed
    }

    /// Returns whether the notification may be attempted at `now`.
    pub fn is_deliverable(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal() && self.deliver_after.map_or(true, |after| after < now)
    }

    /// Returns whether the hard deadline has already passed at `now`.
    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        self.fail_after.is_some_and(|deadline| deadline < now)
    }

    /// Marks the notification delivered at `time`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::TerminalState` if already delivered or failed.
    pub fn mark_delivered(&mut self, time: DateTime<Utc>) -> Result<()> {
        self.ensure_pending()?;
        self.delivered = true;
        self.delivered_at = Some(time);
        Ok(())
    }

    /// Counts a retryable failure and defers the next attempt.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::TerminalState` if already delivered or failed.
    pub fn mark_retryable(&mut self, deliver_after: DateTime<Utc>) -> Result<()> {
        self.ensure_pending()?;
        self.retries = self.retries.saturating_add(1);
        self.deliver_after = Some(deliver_after);
        Ok(())
    }

    /// Marks the notification permanently failed at `time`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::TerminalState` if already delivered or failed.
    pub fn mark_failed(
        &mut self,
        code: Option<i32>,
        description: impl Into<String>,
        time: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_pending()?;
        self.delivered = false;
        self.delivered_at = None;
        self.failed = true;
        self.failed_at = Some(time);
        self.error_code = code;
        self.error_description = Some(description.into());
        Ok(())
    }

    fn ensure_pending(&self) -> Result<()> {
        if self.is_terminal() {
            return Err(CoreError::TerminalState { id: self.id });
        }
        Ok(())
    }
}
