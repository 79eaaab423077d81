//! Error types for the timeout decorator.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! `PoolError` is what callers of the decorated pool see. `DriverError` is what the
//! wrapped pool and its connections report. `ReclaimFailure` covers the best-effort
//! cleanup path and is only ever logged, never returned to a caller.

use crate::models::Query;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the decorated pool and its connections.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Timeout: acquiring a connection exceeded {timeout_ms}ms")]
    TimeoutAcquire { timeout_ms: u64 },

    #[error("Timeout: query `{sql}` with arguments {arguments} exceeded {timeout_ms}ms")]
    TimeoutQuery {
        sql: String,
        /// JSON rendering of the bound parameters
        arguments: String,
        timeout_ms: u64,
    },

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("Invalid configuration: {message}")]
    Config { message: String },
}

impl PoolError {
    /// Create an acquire timeout error.
    pub fn timeout_acquire(timeout: Duration) -> Self {
        Self::TimeoutAcquire {
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Create a query timeout error describing the abandoned query.
    pub fn timeout_query(query: &Query, timeout: Duration) -> Self {
        Self::TimeoutQuery {
            sql: query.sql.clone(),
            arguments: query.arguments_json(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Check if this error was synthesized by a deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimeoutAcquire { .. } | Self::TimeoutQuery { .. })
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TimeoutAcquire { .. } | Self::TimeoutQuery { .. } => true,
            Self::Driver(e) => e.is_retryable(),
            Self::Config { .. } => false,
        }
    }

    /// Convert into a driver error, rendering synthesized errors as text.
    pub fn into_driver(self) -> DriverError {
        match self {
            Self::Driver(e) => e,
            other => DriverError::other(other.to_string()),
        }
    }

    /// Get the driver error behind this error, if any.
    pub fn as_driver(&self) -> Option<&DriverError> {
        match self {
            Self::Driver(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors reported by the wrapped pool, its connections and the database driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Client and server lost synchronization, usually after a stalled request.
    #[error("Protocol sequence timeout: {message}")]
    ProtocolSequenceTimeout { message: String },

    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "1317" for ER_QUERY_INTERRUPTED
        code: Option<String>,
    },

    #[error("Pool error: {message}")]
    Pool { message: String },

    #[error("Driver error: {message}")]
    Other { message: String },
}

impl DriverError {
    /// Create a protocol sequence timeout error.
    pub fn protocol_sequence_timeout(message: impl Into<String>) -> Self {
        Self::ProtocolSequenceTimeout {
            message: message.into(),
        }
    }

    /// Create a connection lost error.
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::ConnectionLost {
            message: message.into(),
        }
    }

    /// Create a database error with optional server error code.
    pub fn database(message: impl Into<String>, code: Option<String>) -> Self {
        Self::Database {
            message: message.into(),
            code,
        }
    }

    /// Create a pool error.
    pub fn pool(message: impl Into<String>) -> Self {
        Self::Pool {
            message: message.into(),
        }
    }

    /// Create an unclassified driver error.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Check if the driver reports a stalled in-flight request.
    pub fn is_protocol_sequence_timeout(&self) -> bool {
        matches!(self, Self::ProtocolSequenceTimeout { .. })
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProtocolSequenceTimeout { .. } | Self::ConnectionLost { .. } | Self::Pool { .. }
        )
    }
}

/// Convert sqlx errors to DriverError.
impl From<sqlx::Error> for DriverError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DriverError::database(db_err.message(), code)
            }
            sqlx::Error::Io(io_err) if io_err.kind() == std::io::ErrorKind::TimedOut => {
                DriverError::protocol_sequence_timeout(format!("I/O timed out: {}", io_err))
            }
            sqlx::Error::Io(io_err) => {
                DriverError::connection_lost(format!("I/O error: {}", io_err))
            }
            sqlx::Error::Protocol(msg) => {
                DriverError::protocol_sequence_timeout(format!("Protocol error: {}", msg))
            }
            sqlx::Error::Tls(tls_err) => DriverError::connection_lost(format!("TLS error: {}", tls_err)),
            sqlx::Error::PoolTimedOut => DriverError::pool("Timed out waiting for a pooled connection"),
            sqlx::Error::PoolClosed => DriverError::pool("Connection pool is closed"),
            sqlx::Error::WorkerCrashed => DriverError::connection_lost("Database worker crashed"),
            sqlx::Error::Configuration(msg) => {
                DriverError::other(format!("Configuration error: {}", msg))
            }
            _ => DriverError::other(format!("Unknown database error: {}", err)),
        }
    }
}

/// Failure of a best-effort cleanup step (kill, release).
///
/// Never returned to callers of the decorated pool; logged and dropped.
#[derive(Error, Debug)]
pub enum ReclaimFailure {
    #[error("KILL {thread_id} failed: {source}")]
    Kill {
        thread_id: u64,
        #[source]
        source: DriverError,
    },

    #[error("KILL {thread_id} did not complete within {timeout_ms}ms")]
    KillTimedOut { thread_id: u64, timeout_ms: u64 },

    #[error("Release failed: {source}")]
    Release {
        #[source]
        source: DriverError,
    },
}

/// Result type alias for decorated pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Result type alias for native pool and driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QueryParam;

    #[test]
    fn test_timeout_query_mentions_query_and_arguments() {
        let query = Query::new("SELECT * FROM users WHERE id = ?").bind(QueryParam::Int(7));
        let err = PoolError::timeout_query(&query, Duration::from_secs(1));
        let msg = err.to_string();
        assert!(msg.contains("SELECT * FROM users WHERE id = ?"));
        assert!(msg.contains("[7]"));
        assert!(msg.contains("1000ms"));
    }

    #[test]
    fn test_timeout_acquire_display() {
        let err = PoolError::timeout_acquire(Duration::from_millis(500));
        assert_eq!(
            err.to_string(),
            "Timeout: acquiring a connection exceeded 500ms"
        );
    }

    #[test]
    fn test_error_is_timeout() {
        assert!(PoolError::timeout_acquire(Duration::from_secs(1)).is_timeout());
        assert!(!PoolError::from(DriverError::other("boom")).is_timeout());
        assert!(!PoolError::config("bad").is_timeout());
    }

    #[test]
    fn test_error_retryable() {
        assert!(PoolError::timeout_acquire(Duration::from_secs(1)).is_retryable());
        assert!(PoolError::from(DriverError::connection_lost("eof")).is_retryable());
        assert!(!PoolError::from(DriverError::database("syntax", None)).is_retryable());
        assert!(!PoolError::config("bad").is_retryable());
    }

    #[test]
    fn test_driver_error_passes_through_unchanged() {
        let original = DriverError::protocol_sequence_timeout("stalled");
        let err = PoolError::from(original.clone());
        assert_eq!(err.as_driver(), Some(&original));
        assert_eq!(err.to_string(), original.to_string());
    }

    #[test]
    fn test_protocol_sequence_timeout_detection() {
        assert!(DriverError::protocol_sequence_timeout("x").is_protocol_sequence_timeout());
        assert!(!DriverError::connection_lost("x").is_protocol_sequence_timeout());
    }

    #[test]
    fn test_sqlx_io_timeout_maps_to_protocol_sequence_timeout() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out");
        let err = DriverError::from(sqlx::Error::Io(io));
        assert!(err.is_protocol_sequence_timeout());
    }

    #[test]
    fn test_sqlx_pool_closed_maps_to_pool_error() {
        let err = DriverError::from(sqlx::Error::PoolClosed);
        assert!(matches!(err, DriverError::Pool { .. }));
    }

    #[test]
    fn test_reclaim_failure_display() {
        let err = ReclaimFailure::Kill {
            thread_id: 42,
            source: DriverError::database("Unknown thread id: 42", Some("1094".to_string())),
        };
        assert!(err.to_string().starts_with("KILL 42 failed"));
    }
}
