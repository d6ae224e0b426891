//! JSON relay gateway over HTTP.
//!
//! Posts each batch to the app's configured endpoint and maps the response
//! onto [`DeliveryError`] for retry decisions. App credentials carry the
//! endpoint and an optional bearer token:
//!
//! ```json
//! { "endpoint": "https://relay.example.com/push", "auth_token": "secret" }
//! ```

use std::time::{Duration, Instant};

use bytes::Bytes;
use pushwire_core::{App, Notification, NotificationId};
use reqwest::{header::HeaderMap, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    error::{DeliveryError, Result},
    gateway::{BoxFuture, Gateway},
};

/// Seconds to wait when a 429 carries no usable Retry-After header.
const DEFAULT_RETRY_AFTER: u64 = 60;

/// Largest response body kept for error descriptions.
const MAX_ERROR_BODY: usize = 1024;

/// HTTP client settings shared by every webhook gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpGatewayConfig {
    /// Timeout for a single batch request.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for HttpGatewayConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(30), user_agent: "pushwire/1.0".to_string() }
    }
}

#[derive(Debug, Deserialize)]
struct Credentials {
    endpoint: String,
    #[serde(default)]
    auth_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct OutboundBatch<'a> {
    app: &'a str,
    notifications: Vec<OutboundNotification<'a>>,
}

#[derive(Debug, Serialize)]
struct OutboundNotification<'a> {
    id: NotificationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_token: Option<&'a str>,
    #[serde(skip_serializing_if = "no_ids")]
    registration_ids: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    alert: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    collapse_key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<i32>,
    data: &'a serde_json::Value,
}

fn no_ids(ids: &&[String]) -> bool {
    ids.is_empty()
}

impl<'a> From<&'a Notification> for OutboundNotification<'a> {
    fn from(n: &'a Notification) -> Self {
        Self {
            id: n.id,
            device_token: n.device_token.as_deref(),
            registration_ids: &n.registration_ids.0,
            alert: n.alert.as_deref(),
            collapse_key: n.collapse_key.as_deref(),
            priority: n.priority,
            data: &n.data.0,
        }
    }
}

/// Error body a relay may return to report a protocol-level rejection.
#[derive(Debug, Deserialize)]
struct RelayError {
    code: i32,
    message: String,
    #[serde(default)]
    retryable: bool,
}

/// Gateway that relays batches as JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    endpoint: String,
    auth_token: Option<String>,
    timeout: Duration,
}

impl HttpGateway {
    /// Builds a gateway from an app's credentials.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the credentials lack an
    /// endpoint or the HTTP client cannot be built.
    pub fn from_app(app: &App, config: &HttpGatewayConfig) -> Result<Self> {
        let credentials: Credentials = serde_json::from_value(app.credentials.0.clone())
            .map_err(|e| {
                DeliveryError::configuration(format!("invalid credentials for app {}: {e}", app.name))
            })?;
        Self::new(credentials.endpoint, credentials.auth_token, config)
    }

    /// Creates a gateway posting to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// configured with the provided settings.
    pub fn new(
        endpoint: impl Into<String>,
        auth_token: Option<String>,
        config: &HttpGatewayConfig,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, endpoint: endpoint.into(), auth_token, timeout: config.timeout })
    }

    async fn post(&self, app: &App, batch: &[Notification]) -> Result<()> {
        let start = Instant::now();
        let payload = OutboundBatch {
            app: &app.name,
            notifications: batch.iter().map(OutboundNotification::from).collect(),
        };
        let body = serde_json::to_vec(&payload)
            .map(Bytes::from)
            .map_err(|e| DeliveryError::internal(format!("failed to encode batch: {e}")))?;

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .body(body);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            warn!(duration_ms = start.elapsed().as_millis(), error = %e, "gateway request failed");
            if e.is_timeout() {
                DeliveryError::timeout(self.timeout.as_secs())
            } else {
                DeliveryError::connection(e.to_string())
            }
        })?;

        debug!(
            status = response.status().as_u16(),
            duration_ms = start.elapsed().as_millis(),
            "received gateway response"
        );
        classify(response).await
    }
}

impl Gateway for HttpGateway {
    fn send<'a>(&'a self, app: &'a App, batch: &'a [Notification]) -> BoxFuture<'a, Result<()>> {
        let span = info_span!(
            "gateway_send",
            app_id = %app.id,
            batch_size = batch.len(),
            endpoint = %self.endpoint
        );
        Box::pin(self.post(app, batch).instrument(span))
    }
}

async fn classify(response: Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = retry_after_seconds(response.headers()).unwrap_or(DEFAULT_RETRY_AFTER);
        return Err(DeliveryError::rate_limited(retry_after));
    }

    let body = read_body(response).await;
    if status.is_client_error() {
        if let Ok(relay) = serde_json::from_str::<RelayError>(&body) {
            return Err(DeliveryError::Protocol {
                code: relay.code,
                message: relay.message,
                retryable: relay.retryable,
            });
        }
    }
    Err(DeliveryError::rejected(status.as_u16(), body))
}

async fn read_body(response: Response) -> String {
    match response.bytes().await {
        Ok(bytes) if bytes.len() > MAX_ERROR_BODY => {
            format!("{}... (truncated)", String::from_utf8_lossy(&bytes[..MAX_ERROR_BODY]))
        },
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => format!("[failed to read response body: {e}]"),
    }
}

/// Parses a Retry-After header in either delta-seconds or HTTP-date form.
fn retry_after_seconds(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(seconds);
    }

    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let wait = date.with_timezone(&chrono::Utc).signed_duration_since(chrono::Utc::now());
    Some(wait.to_std().map(|d| d.as_secs()).unwrap_or(0))
}
