//! Limiter kinds and definitions
//!
//! - **Concurrent**: at most N holders at the same time, each hold expiring
//!   after `lock_timeout`
//! - **Bucket**: N admissions per fixed period, replenished at the period boundary
//! - **Window**: N admissions over a rolling period

use crate::error::{LimitError, LimitResult};
use std::fmt;
use std::time::Duration;

/// Default time a caller waits for capacity before giving up
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time a concurrent hold may live before it is forcibly reclaimed
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Limiter kind and its counter parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimiterKind {
    /// At most `capacity` concurrent holders.
    ///
    /// A hold that outlives `lock_timeout` is released by force, which can
    /// admit more than `capacity` callers if the guarded section is slower
    /// than the timeout.
    Concurrent {
        /// Maximum simultaneous holders
        capacity: u64,
        /// Lifetime of a single hold
        lock_timeout: Duration,
    },

    /// Fixed quota per fixed period aligned to the Unix epoch
    Bucket {
        /// Admissions per period
        capacity: u64,
        /// Period length
        period: Duration,
    },

    /// Sliding log of admissions over a rolling period
    Window {
        /// Admissions per rolling period
        capacity: u64,
        /// Rolling period length
        period: Duration,
    },
}

impl LimiterKind {
    /// Maximum admissions for this kind
    pub fn capacity(&self) -> u64 {
        match self {
            LimiterKind::Concurrent { capacity, .. } => *capacity,
            LimiterKind::Bucket { capacity, .. } => *capacity,
            LimiterKind::Window { capacity, .. } => *capacity,
        }
    }

    /// Short kind label used in store keys and metrics
    pub fn label(&self) -> &'static str {
        match self {
            LimiterKind::Concurrent { .. } => "concurrent",
            LimiterKind::Bucket { .. } => "bucket",
            LimiterKind::Window { .. } => "window",
        }
    }

    /// Validate parameters
    pub fn validate(&self) -> LimitResult<()> {
        if self.capacity() == 0 {
            return Err(LimitError::config("capacity must be greater than 0"));
        }
        match self {
            LimiterKind::Concurrent { lock_timeout, .. } if lock_timeout.is_zero() => {
                Err(LimitError::config("lock_timeout must be non-zero"))
            }
            LimiterKind::Bucket { period, .. } | LimiterKind::Window { period, .. }
                if period.is_zero() =>
            {
                Err(LimitError::config("period must be non-zero"))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for LimiterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterKind::Concurrent {
                capacity,
                lock_timeout,
            } => write!(f, "concurrent({}, lock_timeout={:?})", capacity, lock_timeout),
            LimiterKind::Bucket { capacity, period } => {
                write!(f, "bucket({} per {:?})", capacity, period)
            }
            LimiterKind::Window { capacity, period } => {
                write!(f, "window({} per {:?})", capacity, period)
            }
        }
    }
}

/// A named limiter definition, as registered at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterDef {
    /// Unique limiter name
    pub name: String,
    /// Kind and counter parameters
    pub kind: LimiterKind,
    /// How long `within_limit` waits for capacity
    pub wait_timeout: Duration,
}

impl LimiterDef {
    /// Concurrent limiter definition with default timeouts
    pub fn concurrent(name: impl Into<String>, capacity: u64) -> Self {
        Self {
            name: name.into(),
            kind: LimiterKind::Concurrent {
                capacity,
                lock_timeout: DEFAULT_LOCK_TIMEOUT,
            },
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    /// Bucket limiter definition
    pub fn bucket(name: impl Into<String>, capacity: u64, period: Duration) -> Self {
        Self {
            name: name.into(),
            kind: LimiterKind::Bucket { capacity, period },
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    /// Window limiter definition
    pub fn window(name: impl Into<String>, capacity: u64, period: Duration) -> Self {
        Self {
            name: name.into(),
            kind: LimiterKind::Window { capacity, period },
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    /// Set the wait timeout
    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    /// Set the lock timeout (concurrent limiters only)
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        if let LimiterKind::Concurrent { lock_timeout, .. } = &mut self.kind {
            *lock_timeout = timeout;
        }
        self
    }

    /// Validate name and parameters
    pub fn validate(&self) -> LimitResult<()> {
        if self.name.trim().is_empty() {
            return Err(LimitError::config("limiter name must not be empty"));
        }
        self.kind.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_capacity() {
        assert_eq!(LimiterDef::concurrent("a", 5).kind.capacity(), 5);
        assert_eq!(
            LimiterDef::bucket("b", 10, Duration::from_secs(1)).kind.capacity(),
            10
        );
        assert_eq!(
            LimiterDef::window("c", 20, Duration::from_secs(60)).kind.capacity(),
            20
        );
    }

    #[test]
    fn test_lock_timeout_only_applies_to_concurrent() {
        let def = LimiterDef::concurrent("a", 1).with_lock_timeout(Duration::from_secs(90));
        assert_eq!(
            def.kind,
            LimiterKind::Concurrent {
                capacity: 1,
                lock_timeout: Duration::from_secs(90)
            }
        );

        let bucket = LimiterDef::bucket("b", 1, Duration::from_secs(1))
            .with_lock_timeout(Duration::from_secs(90));
        assert!(matches!(bucket.kind, LimiterKind::Bucket { .. }));
    }

    #[test]
    fn test_validation() {
        assert!(LimiterDef::concurrent("ok", 1).validate().is_ok());
        assert!(LimiterDef::concurrent("", 1).validate().is_err());
        assert!(LimiterDef::concurrent("zero", 0).validate().is_err());
        assert!(
            LimiterDef::window("w", 1, Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            LimiterDef::concurrent("c", 1)
                .with_lock_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_display() {
        let kind = LimiterKind::Bucket {
            capacity: 5,
            period: Duration::from_secs(1),
        };
        assert!(kind.to_string().contains("bucket(5"));
        assert_eq!(kind.label(), "bucket");
    }
}
