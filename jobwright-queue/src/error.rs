//! Error types for queue operations and job execution.

use jobwright_ratelimit::LimitError;
use std::time::Duration;
use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-specific errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Store unavailable or an I/O failure behind it
    #[error("Storage error: {0}")]
    Storage(String),

    /// Redis error
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Job not found in the state the operation requires
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// A job with this id is already stored
    #[error("Duplicate job id: {0}")]
    DuplicateJob(String),

    /// Batch not found
    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    /// Batch cannot accept the requested change
    #[error("Invalid batch operation: {0}")]
    InvalidBatch(String),

    /// Worker pool not running
    #[error("Worker pool not running")]
    WorkerNotRunning,

    /// Worker pool already running
    #[error("Worker pool already running")]
    WorkerAlreadyRunning,

    /// Scheduler not running
    #[error("Scheduler not running")]
    SchedulerNotRunning,

    /// Scheduler already running
    #[error("Scheduler already running")]
    SchedulerAlreadyRunning,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Limiter error
    #[error("Limiter error: {0}")]
    Limit(#[from] LimitError),

    /// Metrics registration or export error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// I/O error (durable snapshot)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueueError {
    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Check if the operation may succeed when retried later
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Storage(_) | Self::Io(_) => true,
            #[cfg(feature = "redis")]
            Self::Redis(_) => true,
            _ => false,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a configuration source
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Configuration parsed but is not usable
    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Error class recorded when a job exceeds its execution timeout.
pub const TIMEOUT_CLASS: &str = "Timeout";

/// Error class recorded when a job panics.
pub const PANIC_CLASS: &str = "Panic";

/// Error class recorded when a job is refused by limiters too many times in a row.
pub const OVER_LIMIT_CLASS: &str = "OverLimit";

/// Error class for jobs whose type has no registered handler.
pub const NO_HANDLER_CLASS: &str = "NoHandler";

/// Failure returned by a job handler.
///
/// The variant decides what happens to the job: `Failed` is retried per the
/// job type's policy, `Permanent` goes straight to the dead set, `OverLimit`
/// is rescheduled without consuming a retry.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// Transient failure
    #[error("{class}: {message}")]
    Failed {
        /// Error class, used to pick a backoff
        class: String,
        /// Error message
        message: String,
        /// Captured backtrace, if any
        backtrace: Option<String>,
    },

    /// Failure that retrying cannot fix
    #[error("{class}: {message} (permanent)")]
    Permanent {
        /// Error class
        class: String,
        /// Error message
        message: String,
    },

    /// A limiter refused admission
    #[error("Limiter '{limiter}' over limit")]
    OverLimit {
        /// Name of the limiter
        limiter: String,
    },
}

impl JobError {
    /// Transient failure with a class and message
    pub fn failed(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            class: class.into(),
            message: message.into(),
            backtrace: None,
        }
    }

    /// Permanent failure with a class and message
    pub fn permanent(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            class: class.into(),
            message: message.into(),
        }
    }

    /// Execution exceeded the job timeout
    pub fn timeout(after: Duration) -> Self {
        Self::failed(TIMEOUT_CLASS, format!("job exceeded timeout of {:?}", after))
    }

    /// Execution panicked
    pub fn panic(message: impl Into<String>) -> Self {
        Self::failed(PANIC_CLASS, message)
    }

    /// Attach a backtrace to a transient failure
    pub fn with_backtrace(mut self, trace: impl Into<String>) -> Self {
        if let Self::Failed { backtrace, .. } = &mut self {
            *backtrace = Some(trace.into());
        }
        self
    }

    /// Error class
    pub fn class(&self) -> &str {
        match self {
            Self::Failed { class, .. } | Self::Permanent { class, .. } => class,
            Self::OverLimit { .. } => OVER_LIMIT_CLASS,
        }
    }

    /// Error message
    pub fn message(&self) -> String {
        match self {
            Self::Failed { message, .. } | Self::Permanent { message, .. } => message.clone(),
            Self::OverLimit { limiter } => format!("limiter '{}' over limit", limiter),
        }
    }

    /// Backtrace, if captured
    pub fn backtrace(&self) -> Option<&str> {
        match self {
            Self::Failed { backtrace, .. } => backtrace.as_deref(),
            _ => None,
        }
    }

    /// Check if this is a limiter signal
    pub fn is_over_limit(&self) -> bool {
        matches!(self, Self::OverLimit { .. })
    }

    /// Check if this failure should never be retried
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }
}

impl From<LimitError> for JobError {
    fn from(err: LimitError) -> Self {
        match err {
            LimitError::OverLimit { limiter, .. } => Self::OverLimit { limiter },
            other => Self::failed("LimitError", other.to_string()),
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::permanent("Deserialization", err.to_string())
    }
}

impl From<QueueError> for JobError {
    fn from(err: QueueError) -> Self {
        Self::failed("QueueError", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_over_limit_only_from_limiter() {
        let err: JobError = LimitError::over_limit("erp", Duration::from_secs(5)).into();
        assert!(err.is_over_limit());
        assert_eq!(err.class(), OVER_LIMIT_CLASS);

        // An application error with a similar name is an ordinary failure
        let lookalike = JobError::failed("OverLimit", "quota hit upstream");
        assert!(!lookalike.is_over_limit());
    }

    #[test]
    fn test_other_limit_errors_are_transient() {
        let err: JobError = LimitError::store("connection reset").into();
        assert!(matches!(err, JobError::Failed { .. }));
        assert_eq!(err.class(), "LimitError");
    }

    #[test]
    fn test_malformed_payload_is_permanent() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: JobError = parse.into();
        assert!(err.is_permanent());
        assert_eq!(err.class(), "Deserialization");
    }

    #[test]
    fn test_timeout_and_panic_classes() {
        let timeout = JobError::timeout(Duration::from_secs(2));
        assert_eq!(timeout.class(), TIMEOUT_CLASS);
        assert!(!timeout.is_permanent());

        let panic = JobError::panic("index out of bounds").with_backtrace("frame 0");
        assert_eq!(panic.class(), PANIC_CLASS);
        assert_eq!(panic.backtrace(), Some("frame 0"));
    }

    #[test]
    fn test_retriable_queue_errors() {
        assert!(QueueError::storage("down").is_retriable());
        assert!(!QueueError::JobNotFound("x".into()).is_retriable());
        assert!(
            !QueueError::Config(ConfigError::ValidationError("bad".into())).is_retriable()
        );
    }
}
