//! Error types for push delivery operations.
//!
//! Gateway outcomes never escape the delivery layer: every variant is either
//! retryable or permanent, and permanent failures carry an optional protocol
//! code that ends up in the notification's `error_code`.

use std::time::Duration;

use pushwire_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors raised while dispatching or recording deliveries.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// The gateway rejected the message with a protocol error code.
    #[error("{message}")]
    Protocol {
        /// Protocol-specific error code (e.g. APNs status 8).
        code: i32,
        /// Gateway-supplied description.
        message: String,
        /// Whether the gateway considers the condition temporary.
        retryable: bool,
    },

    /// Connection to the gateway failed or was dropped.
    #[error("gateway connection failed: {message}")]
    Connection {
        /// Error message describing the failure.
        message: String,
    },

    /// Gateway did not answer in time.
    #[error("gateway timeout after {timeout_seconds}s")]
    Timeout {
        /// Seconds before the request timed out.
        timeout_seconds: u64,
    },

    /// Gateway refused the request with an HTTP-like status.
    #[error("gateway rejected request: status {status}{}", body_suffix(.body))]
    Rejected {
        /// Response status code.
        status: u16,
        /// Response body content.
        body: String,
    },

    /// Gateway asked the sender to slow down.
    #[error("rate limited: retry after {retry_after_seconds}s")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_seconds: u64,
    },

    /// Recording an outcome failed in storage.
    #[error("store error: {0}")]
    Store(#[from] CoreError),

    /// Invalid app or gateway configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error message.
        message: String,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Index of the worker within its app runner.
        worker_id: usize,
        /// Panic payload rendered as text.
        error: String,
    },

    /// Workers did not drain within the shutdown timeout.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that was exceeded.
        timeout: Duration,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    Internal {
        /// Internal error message.
        message: String,
    },
}

impl DeliveryError {
    /// Creates a permanent protocol error.
    pub fn protocol(code: i32, message: impl Into<String>) -> Self {
        Self::Protocol { code, message: message.into(), retryable: false }
    }

    /// Creates a protocol error the gateway marked as temporary.
    pub fn protocol_retryable(code: i32, message: impl Into<String>) -> Self {
        Self::Protocol { code, message: message.into(), retryable: true }
    }

    /// Creates a connection error from a message.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a rejection from a response status and body.
    pub fn rejected(status: u16, body: impl Into<String>) -> Self {
        Self::Rejected { status, body: body.into() }
    }

    /// Creates a rate limit error with retry guidance.
    pub fn rate_limited(retry_after_seconds: u64) -> Self {
        Self::RateLimited { retry_after_seconds }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Protocol error code to record on the notification, if the error
    /// carries one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Protocol { code, .. } => Some(*code),
            Self::Rejected { status, .. } if *status >= 500 => None,
            Self::Rejected { status, .. } => Some(i32::from(*status)),
            _ => None,
        }
    }

    /// Whether the notification should be retried rather than failed.
    ///
    /// Connection loss, timeouts, 5xx rejections and rate limits are
    /// temporary. Protocol errors are retryable only when the gateway says
    /// so; everything else is permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } | Self::RateLimited { .. } => true,
            Self::Rejected { status, .. } => *status >= 500,
            Self::Protocol { retryable, .. } => *retryable,
            Self::Store(_)
            | Self::Configuration { .. }
            | Self::WorkerPanic { .. }
            | Self::ShutdownTimeout { .. }
            | Self::Internal { .. } => false,
        }
    }

    /// Gateway-suggested delay before the next attempt, overriding
    /// exponential backoff.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_seconds } => {
                Some(Duration::from_secs(*retry_after_seconds))
            },
            _ => None,
        }
    }
}

fn body_suffix(body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        String::new()
    } else {
        format!(": {body}")
    }
}
