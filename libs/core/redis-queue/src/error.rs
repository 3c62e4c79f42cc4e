//! Queue error types and error categorization
//!
//! Errors are categorized to decide whether an operation is worth retrying:
//! - **Transient**: connection drops, timeouts, busy servers
//! - **Permanent**: logic errors (missing group, bad id, wrong key type)

use thiserror::Error;

/// Category of error for determining retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure - safe to retry with backoff
    Transient,
    /// Logic or data error - retrying will not help
    Permanent,
}

impl ErrorCategory {
    /// Base delay in milliseconds for exponential backoff
    pub fn base_delay_ms(&self) -> u64 {
        match self {
            ErrorCategory::Transient => 1000,
            ErrorCategory::Permanent => 0,
        }
    }

    /// Maximum delay in milliseconds for exponential backoff
    pub fn max_delay_ms(&self) -> u64 {
        match self {
            ErrorCategory::Transient => 30_000,
            ErrorCategory::Permanent => 0,
        }
    }

    /// Exponential backoff delay for the given number of consecutive failures
    pub fn backoff_delay_ms(&self, failures: u32) -> u64 {
        if *self == ErrorCategory::Permanent {
            return 0;
        }

        let base = self.base_delay_ms();
        let max = self.max_delay_ms();
        let delay = base.saturating_mul(2u64.saturating_pow(failures));
        delay.min(max)
    }
}

/// Queue and store errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Consumer group (or its stream) does not exist
    #[error("No such consumer group '{group}' for stream '{stream}'")]
    NoGroup { stream: String, group: String },

    /// Consumer group already exists
    #[error("Consumer group '{0}' already exists")]
    BusyGroup(String),

    /// Malformed or out-of-order stream id
    #[error("Invalid stream id: {0}")]
    InvalidId(String),

    /// Key holds a value of another type
    #[error("Operation against key '{0}' holding the wrong kind of value")]
    WrongType(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Rejected argument (empty group, empty consumer, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Any other store failure
    #[error("Store error: {0}")]
    Store(String),
}

/// Result alias used by the store layer
pub type QueueResult<T> = Result<T, QueueError>;

impl QueueError {
    /// Create an invalid-argument error
    pub fn invalid(message: impl Into<String>) -> Self {
        QueueError::InvalidArgument(message.into())
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            QueueError::Redis(e) => {
                if e.is_io_error() || e.is_timeout() || e.is_connection_dropped() {
                    ErrorCategory::Transient
                } else if e.to_string().contains("BUSY") || e.to_string().contains("LOADING") {
                    ErrorCategory::Transient
                } else {
                    ErrorCategory::Permanent
                }
            }
            QueueError::Store(_) => ErrorCategory::Transient,
            QueueError::NoGroup { .. }
            | QueueError::BusyGroup(_)
            | QueueError::InvalidId(_)
            | QueueError::WrongType(_)
            | QueueError::Serialization(_)
            | QueueError::InvalidArgument(_) => ErrorCategory::Permanent,
        }
    }

    /// Whether the failure is worth retrying
    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Whether the consumer group is missing
    pub fn is_nogroup(&self) -> bool {
        match self {
            QueueError::NoGroup { .. } => true,
            QueueError::Redis(e) => e.to_string().contains("NOGROUP"),
            _ => false,
        }
    }

    /// Whether the consumer group already exists
    pub fn is_busygroup(&self) -> bool {
        match self {
            QueueError::BusyGroup(_) => true,
            QueueError::Redis(e) => e.to_string().contains("BUSYGROUP"),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        // Transient: 1s, 2s, 4s, 8s, 16s, 30s (max)
        assert_eq!(ErrorCategory::Transient.backoff_delay_ms(0), 1000);
        assert_eq!(ErrorCategory::Transient.backoff_delay_ms(1), 2000);
        assert_eq!(ErrorCategory::Transient.backoff_delay_ms(2), 4000);
        assert_eq!(ErrorCategory::Transient.backoff_delay_ms(5), 30_000);
        assert_eq!(ErrorCategory::Transient.backoff_delay_ms(64), 30_000);

        assert_eq!(ErrorCategory::Permanent.backoff_delay_ms(0), 0);
    }

    #[test]
    fn test_categories() {
        let nogroup = QueueError::NoGroup {
            stream: "s".to_string(),
            group: "g".to_string(),
        };
        assert!(nogroup.is_nogroup());
        assert!(!nogroup.is_transient());

        assert!(QueueError::BusyGroup("g".to_string()).is_busygroup());
        assert!(QueueError::Store("connection reset".to_string()).is_transient());
        assert!(!QueueError::invalid("empty group").is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = QueueError::NoGroup {
            stream: "orders".to_string(),
            group: "billing".to_string(),
        };
        assert!(err.to_string().contains("billing"));
        assert!(err.to_string().contains("orders"));
    }
}
