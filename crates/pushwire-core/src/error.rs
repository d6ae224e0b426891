//! Error types for storage and domain operations.
//!
//! Separates transient connectivity failures, which the store recovers from
//! by reconnecting, from validation and constraint failures, which always
//! propagate to the caller.

use thiserror::Error;

use crate::models::NotificationId;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for storage and lifecycle operations.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Connection to the database was lost or could not be acquired.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Notification already delivered or failed.
    #[error("Notification {id} is already in a terminal state")]
    TerminalState {
        /// The notification that rejected the transition
        id: NotificationId,
    },
}

impl CoreError {
    /// Returns whether the failure is a connectivity loss that is worth
    /// retrying after reconnecting.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// SQLSTATE classes raised when the server drops or refuses the session:
/// class 08 (connection exception) and 57P01..57P03 (admin/crash shutdown,
/// cannot connect now).
fn is_connection_state(code: &str) -> bool {
    code.starts_with("08") || matches!(code, "57P01" | "57P02" | "57P03")
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Connection(err.to_string()),
            sqlx::Error::Database(db_err)
                if db_err.code().is_some_and(|code| is_connection_state(&code)) =>
            {
                Self::Connection(db_err.to_string())
            },
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_errors_are_transient() {
        assert!(CoreError::Connection("reset by peer".into()).is_transient());
        assert!(!CoreError::Database("syntax error".into()).is_transient());
        assert!(!CoreError::ConstraintViolation("duplicate id".into()).is_transient());
        assert!(!CoreError::InvalidInput("missing token".into()).is_transient());
        assert!(!CoreError::TerminalState { id: NotificationId::new() }.is_transient());
    }

    #[test]
    fn pool_failures_map_to_connection_errors() {
        assert!(CoreError::from(sqlx::Error::PoolTimedOut).is_transient());
        assert!(CoreError::from(sqlx::Error::PoolClosed).is_transient());

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(CoreError::from(sqlx::Error::Io(io)).is_transient());
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        assert!(matches!(CoreError::from(sqlx::Error::RowNotFound), CoreError::NotFound(_)));
    }

    #[test]
    fn connection_sqlstates_recognised() {
        assert!(is_connection_state("08006"));
        assert!(is_connection_state("57P01"));
        assert!(!is_connection_state("23505"));
        assert!(!is_connection_state("57014"));
    }
}
