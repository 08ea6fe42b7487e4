//! Error types and retry classification
//!
//! Two layers:
//! - [`ClientError`]: what a broker or store adapter reports. Every value carries a
//!   [`ClientErrorKind`] decided at the adapter boundary, so the retry wrapper never
//!   has to inspect message text.
//! - [`RelayError`]: what callers of the relay see. Business outcomes (`OperationFailed`),
//!   deadlines (`Timeout`) and infrastructure failures are kept apart.

use std::time::Duration;
use thiserror::Error;

/// Category of error for determining retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connection-class failure, retried with a fixed delay
    Transient,
    /// Everything else, surfaces on the first attempt
    Permanent,
}

impl ErrorCategory {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
        }
    }
}

/// Structured failure class reported by a client adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClientErrorKind {
    /// Refused, dropped or broken connection, including raw I/O errors
    #[error("connection error")]
    Connection,
    /// The server did not answer in time
    #[error("timeout")]
    Timeout,
    /// The circuit breaker is refusing calls
    #[error("circuit open")]
    CircuitOpen,
    /// The server answered with an error (wrong type, script error, ...)
    #[error("rejected")]
    Rejected,
    /// A value could not be encoded or decoded
    #[error("serialization error")]
    Serialization,
}

impl ClientErrorKind {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ClientErrorKind::Connection | ClientErrorKind::Timeout => ErrorCategory::Transient,
            ClientErrorKind::CircuitOpen
            | ClientErrorKind::Rejected
            | ClientErrorKind::Serialization => ErrorCategory::Permanent,
        }
    }
}

/// Error reported by a broker or store client.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ClientError {
    kind: ClientErrorKind,
    message: String,
}

impl ClientError {
    pub fn new(kind: ClientErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Connection, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Timeout, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Rejected, message)
    }

    pub fn circuit_open(name: &str) -> Self {
        Self::new(ClientErrorKind::CircuitOpen, format!("{} is failing fast", name))
    }

    pub fn kind(&self) -> ClientErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }
}

impl From<redis::RedisError> for ClientError {
    fn from(err: redis::RedisError) -> Self {
        let kind = if err.is_timeout() {
            ClientErrorKind::Timeout
        } else if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error()
        {
            ClientErrorKind::Connection
        } else {
            ClientErrorKind::Rejected
        };

        ClientError::new(kind, err.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::new(ClientErrorKind::Serialization, err.to_string())
    }
}

/// Errors surfaced to callers of the relay.
///
/// Lock contention is reported as [`crate::LockOutcome::Busy`], not here.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The broker stayed unreachable for every retry
    #[error("failed to publish '{operation}': {source}")]
    PublishFailed {
        operation: String,
        #[source]
        source: ClientError,
    },

    /// No terminal result appeared before the deadline
    #[error("no result for request {correlation_id} within {waited:?}")]
    Timeout {
        correlation_id: String,
        waited: Duration,
    },

    /// The worker reported a failure; the text is the worker's own
    #[error("request {correlation_id} failed: {message}")]
    OperationFailed {
        correlation_id: String,
        message: String,
    },

    /// A dependency never became reachable during startup
    #[error("{dependency} unreachable after {attempts} attempts: {message}")]
    HealthCheckFailed {
        dependency: String,
        attempts: u32,
        message: String,
    },

    /// Store or broker failure outside the publish path
    #[error("{operation} failed: {source}")]
    Infrastructure {
        operation: String,
        #[source]
        source: ClientError,
    },

    /// The operation name has no route
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    /// Payload or record could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl RelayError {
    pub fn infrastructure(operation: impl Into<String>, source: ClientError) -> Self {
        RelayError::Infrastructure {
            operation: operation.into(),
            source,
        }
    }

    /// Short stable label, used for metrics and the HTTP error body
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::PublishFailed { .. } => "publish_failed",
            RelayError::Timeout { .. } => "timeout",
            RelayError::OperationFailed { .. } => "operation_failed",
            RelayError::HealthCheckFailed { .. } => "health_check_failed",
            RelayError::Infrastructure { .. } => "infrastructure",
            RelayError::UnknownOperation(_) => "unknown_operation",
            RelayError::Serialization(_) => "serialization",
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::RedisError;

    #[test]
    fn test_kind_categories() {
        assert!(ClientErrorKind::Connection.category().is_retryable());
        assert!(ClientErrorKind::Timeout.category().is_retryable());
        assert!(!ClientErrorKind::Rejected.category().is_retryable());
        assert!(!ClientErrorKind::CircuitOpen.category().is_retryable());
        assert!(!ClientErrorKind::Serialization.category().is_retryable());
    }

    #[test]
    fn test_io_error_is_connection_class() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = ClientError::from(RedisError::from(io));
        assert_eq!(err.kind(), ClientErrorKind::Connection);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_broken_pipe_is_connection_class() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert!(ClientError::from(RedisError::from(io)).is_retryable());
    }

    #[test]
    fn test_rejected_is_not_retried() {
        let err = ClientError::rejected("WRONGTYPE");
        assert_eq!(err.category(), ErrorCategory::Permanent);
        assert!(err.to_string().starts_with("rejected"));
    }

    #[test]
    fn test_serde_error_maps_to_serialization() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(ClientError::from(json_err).kind(), ClientErrorKind::Serialization);
        assert_eq!(RelayError::from(serde_json::from_str::<u8>("x").unwrap_err()).code(), "serialization");
    }

    #[test]
    fn test_relay_error_display() {
        let err = RelayError::Timeout {
            correlation_id: "abc".into(),
            waited: Duration::from_millis(1000),
        };
        assert_eq!(err.code(), "timeout");
        assert!(err.to_string().contains("abc"));

        let err = RelayError::PublishFailed {
            operation: "get-all-people".into(),
            source: ClientError::connection("refused"),
        };
        assert!(err.to_string().contains("get-all-people"));
        assert!(err.to_string().contains("refused"));
    }
}
