//! Queue error types
//!
//! Errors fall into two groups:
//! - **Recoverable**: transport hiccups, handler failures, change-log poll failures.
//!   The engine logs them, counts them and keeps going.
//! - **Fatal**: the consecutive error threshold was exceeded. The run aborts and the
//!   error is returned to the process owner.

use thiserror::Error;

/// Queue processing errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Change-log database error
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Transport failure not covered by a backend-specific variant
    #[error("Transport error: {0}")]
    Transport(String),

    /// Item processing failed
    #[error("Processing error: {0}")]
    Processing(String),

    /// The processor panicked while handling a batch
    #[error("Processor panicked: {0}")]
    Panicked(String),

    /// Too many consecutive failures; the run was aborted
    #[error("Error threshold exceeded: {consecutive_errors} consecutive errors (threshold {threshold})")]
    ErrorThresholdExceeded {
        consecutive_errors: u32,
        threshold: u32,
    },

    /// `run` was called while another run of the same worker was active
    #[error("Worker is already running")]
    AlreadyRunning,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl QueueError {
    /// Create a processing error, the usual way for handlers to report failure.
    pub fn processing(message: impl Into<String>) -> Self {
        QueueError::Processing(message.into())
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        QueueError::Transport(message.into())
    }

    /// Whether this error ends a run instead of being counted and retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            QueueError::ErrorThresholdExceeded { .. } | QueueError::AlreadyRunning
        )
    }

    /// Build a `Panicked` error from a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        QueueError::Panicked(message)
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

impl From<core_config::ConfigError> for QueueError {
    fn from(err: core_config::ConfigError) -> Self {
        QueueError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_threshold_and_reentry_are_fatal() {
        assert!(QueueError::ErrorThresholdExceeded {
            consecutive_errors: 11,
            threshold: 10
        }
        .is_fatal());
        assert!(QueueError::AlreadyRunning.is_fatal());

        assert!(!QueueError::processing("boom").is_fatal());
        assert!(!QueueError::transport("connection reset").is_fatal());
        assert!(!QueueError::Serialization("bad json".into()).is_fatal());
    }

    #[test]
    fn test_threshold_message() {
        let err = QueueError::ErrorThresholdExceeded {
            consecutive_errors: 12,
            threshold: 10,
        };
        assert_eq!(
            err.to_string(),
            "Error threshold exceeded: 12 consecutive errors (threshold 10)"
        );
    }

    #[test]
    fn test_from_panic_payloads() {
        let err = QueueError::from_panic(Box::new("static message"));
        assert!(matches!(err, QueueError::Panicked(ref m) if m == "static message"));

        let err = QueueError::from_panic(Box::new(String::from("owned message")));
        assert!(matches!(err, QueueError::Panicked(ref m) if m == "owned message"));

        let err = QueueError::from_panic(Box::new(42u8));
        assert!(matches!(err, QueueError::Panicked(_)));
    }

    #[test]
    fn test_serde_error_conversion() {
        let err: QueueError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, QueueError::Serialization(_)));
    }
}
