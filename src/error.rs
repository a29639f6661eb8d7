//! Error types for the tenant pool server.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Errors are `Clone` so a single failed pool creation can be handed to every
//! caller that was waiting on it.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Failed to close pool for tenant '{tenant_id}': {message}")]
    Close { tenant_id: String, message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a close error for an idle pool that could not be shut down.
    pub fn close(tenant_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Close {
            tenant_id: tenant_id.into(),
            message: message.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::PoolTimedOut => DbError::connection(
                "Timed out acquiring a connection from the pool",
                "Check database server load or raise the acquire timeout",
            ),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Request the tenant pool again")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_close_error_names_tenant() {
        let err = DbError::close("demoa", "socket already gone");
        let msg = err.to_string();
        assert!(msg.contains("demoa"));
        assert!(msg.contains("socket already gone"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::connection("refused", "Check the server is up");
        assert_eq!(err.suggestion(), Some("Check the server is up"));
        assert_eq!(DbError::invalid_input("bad").suggestion(), None);
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::connection("err", "sugg").is_retryable());
        assert!(!DbError::close("t", "err").is_retryable());
        assert!(!DbError::invalid_input("bad").is_retryable());
    }

    #[test]
    fn test_sqlx_pool_closed_maps_to_connection() {
        let err: DbError = sqlx::Error::PoolClosed.into();
        assert!(matches!(err, DbError::Connection { .. }));
    }

    #[test]
    fn test_clone_keeps_payload() {
        let err = DbError::connection("refused", "retry");
        assert_eq!(err.clone(), err);
    }
}
