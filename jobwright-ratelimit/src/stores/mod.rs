//! Limiter counter storage
//!
//! - **Memory**: DashMap-backed counters shared by every limiter handle in the process
//! - **Redis**: counters shared by every process talking to the same Redis

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis::RedisStore;

use crate::error::LimitResult;
use crate::kind::LimiterKind;
use async_trait::async_trait;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Outcome of a single admission attempt
#[derive(Debug, Clone, Default)]
pub struct Admission {
    /// Whether the caller was admitted
    pub allowed: bool,
    /// Capacity left after this attempt
    pub remaining: u64,
    /// Hint for when capacity may free up
    pub retry_after: Option<Duration>,
    /// Hold token (concurrent limiters only)
    pub token: Option<String>,
    /// Expired holds that were reclaimed during this attempt
    pub reclaimed: u64,
}

impl Admission {
    /// An admitted attempt
    pub fn allowed(remaining: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            ..Default::default()
        }
    }

    /// A refused attempt
    pub fn denied(retry_after: Option<Duration>) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            retry_after,
            ..Default::default()
        }
    }
}

/// Trait for limiter counter backends.
///
/// Every method must be atomic with respect to other callers using the same
/// limiter name; the store is the single source of truth for counts.
#[async_trait]
pub trait LimiterStore: Send + Sync {
    /// Take a concurrent hold, reclaiming expired holds first
    async fn acquire_slot(
        &self,
        name: &str,
        capacity: u64,
        lock_timeout: Duration,
    ) -> LimitResult<Admission>;

    /// Release a concurrent hold. Returns false if the hold had already expired.
    async fn release_slot(&self, name: &str, token: &str) -> LimitResult<bool>;

    /// Take one admission from the current fixed period
    async fn bucket_take(&self, name: &str, capacity: u64, period: Duration)
    -> LimitResult<Admission>;

    /// Take one admission from the rolling window
    async fn window_take(&self, name: &str, capacity: u64, period: Duration)
    -> LimitResult<Admission>;

    /// Capacity currently in use
    async fn in_use(&self, name: &str, kind: &LimiterKind) -> LimitResult<u64>;

    /// Drop all counter state for a limiter
    async fn reset(&self, name: &str) -> LimitResult<()>;

    /// Get store type name for debugging
    fn store_type(&self) -> &'static str;
}

/// Milliseconds since the Unix epoch
pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Index of the fixed period containing `now_ms`, and time left until the next boundary
pub(crate) fn bucket_position(now_ms: u64, period: Duration) -> (u64, Duration) {
    let period_ms = (period.as_millis() as u64).max(1);
    let index = now_ms / period_ms;
    let next_boundary = (index + 1) * period_ms;
    (index, Duration::from_millis(next_boundary - now_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_position() {
        let (index, left) = bucket_position(2_500, Duration::from_secs(1));
        assert_eq!(index, 2);
        assert_eq!(left, Duration::from_millis(500));

        let (index, left) = bucket_position(3_000, Duration::from_secs(1));
        assert_eq!(index, 3);
        assert_eq!(left, Duration::from_secs(1));
    }

    #[test]
    fn test_admission_constructors() {
        let a = Admission::allowed(3);
        assert!(a.allowed);
        assert_eq!(a.remaining, 3);

        let d = Admission::denied(Some(Duration::from_millis(10)));
        assert!(!d.allowed);
        assert_eq!(d.retry_after, Some(Duration::from_millis(10)));
    }
}
