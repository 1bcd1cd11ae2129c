//! Error types for the Cumulus job core.

use thiserror::Error;

/// A specialized Result type for job system operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the broker, scheduler and trigger store.
#[derive(Debug, Error)]
pub enum Error {
    /// A submission referenced a worker type with no registered pool.
    #[error("unknown worker type: {0}")]
    UnknownWorkerType(String),

    /// A bounded queue at capacity rejected a submission. The caller must
    /// retry or drop; the job was not enqueued.
    #[error("queue full for worker type: {0}")]
    QueueFull(String),

    /// Operation on an unknown trigger or job id.
    #[error("not found: {0}")]
    NotFound(String),

    /// A broker or scheduler handle was used before `start`. This is a
    /// programming error at bootstrap, not a runtime condition.
    #[error("job system used before start")]
    NotInitialized,

    /// `start` was called on a component that is already running.
    #[error("job system already started")]
    AlreadyStarted,

    /// A trigger failed validation (bad cron expression, zero interval,
    /// timestamp in the past, malformed event filter).
    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),

    /// The durable trigger store failed an operation.
    #[error("trigger store: {0}")]
    Store(String),

    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error indicates a missing entity rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = Error::UnknownWorkerType("thumbnails".to_string());
        assert_eq!(err.to_string(), "unknown worker type: thumbnails");

        let err = Error::QueueFull("mails".to_string());
        assert_eq!(err.to_string(), "queue full for worker type: mails");
    }

    #[test]
    fn test_is_not_found() {
        assert!(Error::NotFound("trigger-1".to_string()).is_not_found());
        assert!(!Error::NotInitialized.is_not_found());
    }
}
