//! Error types for limiters

use std::time::Duration;
use thiserror::Error;

/// Result type for limiter operations
pub type LimitResult<T> = Result<T, LimitError>;

/// Limiter errors
#[derive(Debug, Error)]
pub enum LimitError {
    /// Capacity was not acquired before the wait timeout elapsed.
    ///
    /// This is a control-flow signal, not an application failure: job code
    /// that lets it propagate gets rescheduled instead of counted as failed.
    #[error("Limiter '{limiter}' over limit (waited {waited:?})")]
    OverLimit {
        /// Name of the limiter that refused admission
        limiter: String,
        /// How long the caller waited before giving up
        waited: Duration,
    },

    /// A limiter with this name already exists with different parameters
    #[error("Limiter '{name}' already registered as {existing}, requested {requested}")]
    Conflict {
        /// Limiter name
        name: String,
        /// Description of the registered limiter
        existing: String,
        /// Description of the conflicting request
        requested: String,
    },

    /// Invalid limiter definition
    #[error("Invalid limiter configuration: {0}")]
    InvalidConfig(String),

    /// Store error (Redis, memory, etc.)
    #[error("Limiter store error: {0}")]
    Store(String),

    /// Redis connection error
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl LimitError {
    /// Create an over-limit error
    pub fn over_limit(limiter: impl Into<String>, waited: Duration) -> Self {
        Self::OverLimit {
            limiter: limiter.into(),
            waited,
        }
    }

    /// Create a new store error
    pub fn store<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Check if this error is an over-limit signal
    pub fn is_over_limit(&self) -> bool {
        matches!(self, Self::OverLimit { .. })
    }

    /// Name of the limiter that refused admission, if this is an over-limit signal
    pub fn limiter_name(&self) -> Option<&str> {
        match self {
            Self::OverLimit { limiter, .. } => Some(limiter),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_over_limit_error() {
        let error = LimitError::over_limit("stripe", Duration::from_secs(5));

        assert!(error.is_over_limit());
        assert_eq!(error.limiter_name(), Some("stripe"));
        assert!(error.to_string().contains("stripe"));
    }

    #[test]
    fn test_store_error() {
        let error = LimitError::store("connection failed");
        assert!(!error.is_over_limit());
        assert_eq!(error.limiter_name(), None);
        assert_eq!(
            error.to_string(),
            "Limiter store error: connection failed"
        );
    }

    #[test]
    fn test_conflict_display() {
        let error = LimitError::Conflict {
            name: "erp".to_string(),
            existing: "concurrent(5)".to_string(),
            requested: "concurrent(10)".to_string(),
        };
        let msg = error.to_string();
        assert!(msg.contains("erp"));
        assert!(msg.contains("concurrent(5)"));
        assert!(msg.contains("concurrent(10)"));
    }
}
