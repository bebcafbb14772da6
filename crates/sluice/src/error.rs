//! Error types for the streaming engine
//!
//! Includes error classification so the supervisor can map failures to
//! exit codes and the heartbeat can report metric-safe error codes.

use thiserror::Error;

/// Errors produced by the intake engine and its collaborators.
#[derive(Error, Debug)]
pub enum SluiceError {
    /// The upstream connection was lost or closed underneath us.
    ///
    /// This is one of the two abstract upstream conditions; adapters map
    /// their client library's concrete errors onto it.
    #[error("upstream connection lost")]
    ConnectionLost,

    /// The durable subscription failed (create, update, or consume).
    #[error("subscription error: {0}")]
    Subscription(String),

    /// An event payload could not be decoded. Permanent: the upstream
    /// will redeliver the same bytes until data or code changes.
    #[error("decode error: {0}")]
    Decode(String),

    /// The driver rejected an event or failed to commit a batch.
    #[error("driver error: {0}")]
    Driver(String),

    /// Sentinel returned by a driver that has already been stopped.
    /// The consumer naks pending messages without surfacing an error.
    #[error("driver stopped")]
    DriverStopped,

    /// A positive acknowledgement could not be delivered upstream.
    #[error("ack error: {0}")]
    Ack(String),

    /// A negative acknowledgement could not be delivered upstream.
    #[error("nak error: {0}")]
    Nak(String),

    /// Schema registry request failed terminally.
    #[error("registry error: {0}")]
    Registry(String),

    /// Transient failure that may succeed on retry (connection reset,
    /// request timeout, 408/429/5xx responses).
    #[error("transient error: {0}")]
    Transient(String),

    /// The registry has no schema for the requested table/version.
    #[error("no schema found for {table} version {model_version}")]
    SchemaNotFound {
        table: String,
        model_version: String,
    },

    /// Schema validator failed to load or evaluate a rule document.
    #[error("validation error: {0}")]
    Validation(String),

    /// Local tracker store failure.
    #[error("tracker error: {0}")]
    Tracker(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl SluiceError {
    pub fn subscription(msg: impl Into<String>) -> Self {
        Self::Subscription(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn driver(msg: impl Into<String>) -> Self {
        Self::Driver(msg.into())
    }

    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }

    pub fn tracker(msg: impl Into<String>) -> Self {
        Self::Tracker(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// True when the supervisor should exit with the disconnected code so
    /// the outer wrapper relaunches the process.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost)
    }

    /// True for transient failures that may succeed on retry.
    ///
    /// The engine itself retries nothing; this classification is used by
    /// the registry client's backoff loop.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::ConnectionLost => true,
            Self::Transient(_) => true,
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }
            _ => false,
        }
    }

    /// Metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectionLost => "connection_lost",
            Self::Subscription(_) => "subscription_error",
            Self::Decode(_) => "decode_error",
            Self::Driver(_) => "driver_error",
            Self::DriverStopped => "driver_stopped",
            Self::Ack(_) => "ack_error",
            Self::Nak(_) => "nak_error",
            Self::Registry(_) => "registry_error",
            Self::Transient(_) => "transient_error",
            Self::SchemaNotFound { .. } => "schema_not_found",
            Self::Validation(_) => "validation_error",
            Self::Tracker(_) => "tracker_error",
            Self::Config(_) => "config_error",
            Self::Json(_) => "json_error",
            Self::Io(_) => "io_error",
            Self::Other(_) => "unknown",
        }
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, SluiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SluiceError::decode("unexpected end of input");
        assert!(err.to_string().contains("decode error"));
        assert!(err.to_string().contains("unexpected end of input"));
    }

    #[test]
    fn test_connection_lost_classification() {
        assert!(SluiceError::ConnectionLost.is_connection_lost());
        assert!(!SluiceError::decode("x").is_connection_lost());
        assert!(!SluiceError::DriverStopped.is_connection_lost());
    }

    #[test]
    fn test_is_retriable() {
        assert!(SluiceError::ConnectionLost.is_retriable());
        assert!(SluiceError::Transient("request timed out".into()).is_retriable());
        assert!(!SluiceError::registry("404 not found").is_retriable());
        assert!(!SluiceError::decode("bad json").is_retriable());
        assert!(!SluiceError::config("missing url").is_retriable());
        assert!(!SluiceError::DriverStopped.is_retriable());
    }

    #[test]
    fn test_error_code() {
        assert_eq!(SluiceError::ConnectionLost.error_code(), "connection_lost");
        assert_eq!(SluiceError::DriverStopped.error_code(), "driver_stopped");
        assert_eq!(
            SluiceError::SchemaNotFound {
                table: "orders".into(),
                model_version: "v1".into()
            }
            .error_code(),
            "schema_not_found"
        );
    }
}
