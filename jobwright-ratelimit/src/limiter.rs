//! Limiter handles and permits

use crate::error::{LimitError, LimitResult};
use crate::kind::LimiterKind;
use crate::stores::{Admission, LimiterStore};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Longest pause between two admission attempts while waiting
const MAX_POLL: Duration = Duration::from_millis(50);

/// Shortest pause between two admission attempts
const MIN_POLL: Duration = Duration::from_millis(1);

/// Counter state shared by every handle with the same name
pub(crate) struct LimiterShared {
    pub(crate) name: String,
    pub(crate) kind: LimiterKind,
    store: Arc<dyn LimiterStore>,
    released: Notify,
    admitted: AtomicU64,
    rejected: AtomicU64,
    reclaimed: AtomicU64,
}

impl LimiterShared {
    pub(crate) fn new(name: String, kind: LimiterKind, store: Arc<dyn LimiterStore>) -> Self {
        Self {
            name,
            kind,
            store,
            released: Notify::new(),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
        }
    }

    async fn take(&self) -> LimitResult<Admission> {
        match &self.kind {
            LimiterKind::Concurrent {
                capacity,
                lock_timeout,
            } => {
                self.store
                    .acquire_slot(&self.name, *capacity, *lock_timeout)
                    .await
            }
            LimiterKind::Bucket { capacity, period } => {
                self.store.bucket_take(&self.name, *capacity, *period).await
            }
            LimiterKind::Window { capacity, period } => {
                self.store.window_take(&self.name, *capacity, *period).await
            }
        }
    }

    async fn release(&self, token: &str) -> LimitResult<()> {
        let released = self.store.release_slot(&self.name, token).await?;
        if !released {
            debug!(limiter = %self.name, "Hold already reclaimed before release");
        }
        self.released.notify_waiters();
        Ok(())
    }
}

/// Snapshot of a limiter's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usage {
    /// Capacity currently taken
    pub in_use: u64,
    /// Maximum capacity
    pub capacity: u64,
}

impl Usage {
    /// Fraction of capacity in use, between 0.0 and 1.0
    pub fn saturation(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        (self.in_use as f64 / self.capacity as f64).min(1.0)
    }
}

/// Admission statistics for one limiter name in this process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    /// Callers admitted
    pub admitted: u64,
    /// Callers that gave up with an over-limit error
    pub rejected: u64,
    /// Expired concurrent holds released by force
    pub reclaimed: u64,
}

/// Handle to a named limiter.
///
/// Cloning a handle or looking the same name up again from the registry
/// yields a handle over the same counters. Only `wait_timeout` is per handle.
#[derive(Clone)]
pub struct Limiter {
    shared: Arc<LimiterShared>,
    wait_timeout: Duration,
}

impl Limiter {
    pub(crate) fn new(shared: Arc<LimiterShared>, wait_timeout: Duration) -> Self {
        Self {
            shared,
            wait_timeout,
        }
    }

    /// Limiter name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Limiter kind and parameters
    pub fn kind(&self) -> &LimiterKind {
        &self.shared.kind
    }

    /// How long `acquire` waits for capacity
    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// A handle over the same counters with a different wait timeout
    pub fn with_wait_timeout(&self, wait_timeout: Duration) -> Self {
        Self {
            shared: self.shared.clone(),
            wait_timeout,
        }
    }

    /// Check whether two handles share counter state
    pub fn same_state(&self, other: &Limiter) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Wait up to `wait_timeout` for capacity.
    ///
    /// A zero wait timeout makes a single attempt.
    pub async fn acquire(&self) -> LimitResult<Permit> {
        let shared = &self.shared;
        let started = Instant::now();
        let deadline = started + self.wait_timeout;

        loop {
            let admission = shared.take().await?;

            if admission.reclaimed > 0 {
                shared
                    .reclaimed
                    .fetch_add(admission.reclaimed, Ordering::Relaxed);
                warn!(
                    limiter = %shared.name,
                    reclaimed = admission.reclaimed,
                    "Released expired holds past lock_timeout"
                );
            }

            if admission.allowed {
                shared.admitted.fetch_add(1, Ordering::Relaxed);
                trace!(limiter = %shared.name, remaining = admission.remaining, "Admitted");
                return Ok(Permit {
                    shared: shared.clone(),
                    token: admission.token,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                shared.rejected.fetch_add(1, Ordering::Relaxed);
                let waited = now - started;
                debug!(limiter = %shared.name, waited = ?waited, "Over limit");
                return Err(LimitError::over_limit(shared.name.clone(), waited));
            }

            let pause = admission
                .retry_after
                .unwrap_or(MAX_POLL)
                .clamp(MIN_POLL, MAX_POLL)
                .min(deadline - now);

            tokio::select! {
                _ = shared.released.notified() => {}
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Run `f` once capacity is acquired, releasing it afterwards.
    ///
    /// Returns `LimitError::OverLimit` (converted into `E`) if capacity is not
    /// acquired within `wait_timeout`. Job code should let that error
    /// propagate so the job is rescheduled. A failed release is logged and
    /// leaves `f`'s result as is; the hold lapses at `lock_timeout`.
    pub async fn within_limit<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LimitError>,
    {
        let permit = self.acquire().await?;
        let result = f().await;
        if let Err(e) = permit.release().await {
            warn!(limiter = %self.shared.name, error = %e, "Failed to release permit");
        }
        result
    }

    /// Current usage snapshot
    pub async fn usage(&self) -> LimitResult<Usage> {
        let in_use = self
            .shared
            .store
            .in_use(&self.shared.name, &self.shared.kind)
            .await?;
        Ok(Usage {
            in_use,
            capacity: self.shared.kind.capacity(),
        })
    }

    /// Drop all counter state for this limiter
    pub async fn reset(&self) -> LimitResult<()> {
        self.shared.store.reset(&self.shared.name).await?;
        self.shared.released.notify_waiters();
        Ok(())
    }

    /// Admission statistics recorded by this process
    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            admitted: self.shared.admitted.load(Ordering::Relaxed),
            rejected: self.shared.rejected.load(Ordering::Relaxed),
            reclaimed: self.shared.reclaimed.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("name", &self.shared.name)
            .field("kind", &self.shared.kind)
            .field("wait_timeout", &self.wait_timeout)
            .field("store", &self.shared.store.store_type())
            .finish()
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("limiter", &self.shared.name)
            .field("token", &self.token)
            .finish()
    }
}

/// Capacity taken from a limiter.
///
/// Concurrent holds are returned by `release`. Dropping an unreleased
/// permit releases in the background when a Tokio runtime is available;
/// otherwise the hold lapses at `lock_timeout`.
pub struct Permit {
    shared: Arc<LimiterShared>,
    token: Option<String>,
}

impl Permit {
    /// Name of the limiter this permit came from
    pub fn limiter(&self) -> &str {
        &self.shared.name
    }

    /// Return the capacity
    pub async fn release(mut self) -> LimitResult<()> {
        match self.token.take() {
            Some(token) => self.shared.release(&token).await,
            None => Ok(()),
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            let shared = self.shared.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = shared.release(&token).await {
                            warn!(limiter = %shared.name, error = %e, "Failed to release dropped permit");
                        }
                    });
                }
                Err(_) => {
                    warn!(limiter = %shared.name, "Permit dropped outside a runtime; hold lapses at lock_timeout");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryStore;
    use async_trait::async_trait;

    /// Memory store that cannot release holds
    struct StuckStore(MemoryStore);

    #[async_trait]
    impl LimiterStore for StuckStore {
        async fn acquire_slot(
            &self,
            name: &str,
            capacity: u64,
            lock_timeout: Duration,
        ) -> LimitResult<Admission> {
            self.0.acquire_slot(name, capacity, lock_timeout).await
        }

        async fn release_slot(&self, _name: &str, _token: &str) -> LimitResult<bool> {
            Err(LimitError::Store("connection reset".to_string()))
        }

        async fn bucket_take(
            &self,
            name: &str,
            capacity: u64,
            period: Duration,
        ) -> LimitResult<Admission> {
            self.0.bucket_take(name, capacity, period).await
        }

        async fn window_take(
            &self,
            name: &str,
            capacity: u64,
            period: Duration,
        ) -> LimitResult<Admission> {
            self.0.window_take(name, capacity, period).await
        }

        async fn in_use(&self, name: &str, kind: &LimiterKind) -> LimitResult<u64> {
            self.0.in_use(name, kind).await
        }

        async fn reset(&self, name: &str) -> LimitResult<()> {
            self.0.reset(name).await
        }

        fn store_type(&self) -> &'static str {
            "stuck"
        }
    }

    fn concurrent(capacity: u64, wait: Duration) -> Limiter {
        let shared = LimiterShared::new(
            "test".to_string(),
            LimiterKind::Concurrent {
                capacity,
                lock_timeout: Duration::from_secs(30),
            },
            Arc::new(MemoryStore::new()),
        );
        Limiter::new(Arc::new(shared), wait)
    }

    #[tokio::test]
    async fn test_fail_fast_with_zero_wait() {
        let limiter = concurrent(1, Duration::ZERO);

        let permit = limiter.acquire().await.unwrap();
        let err = limiter.acquire().await.unwrap_err();
        assert!(err.is_over_limit());
        assert_eq!(err.limiter_name(), Some("test"));

        permit.release().await.unwrap();
        assert!(limiter.acquire().await.is_ok());

        let stats = limiter.stats();
        assert_eq!(stats.admitted, 2);
        assert_eq!(stats.rejected, 1);
    }

    #[tokio::test]
    async fn test_waiter_woken_by_release() {
        let limiter = concurrent(1, Duration::from_secs(2));
        let permit = limiter.acquire().await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await.map(|p| p.limiter().to_string()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        permit.release().await.unwrap();

        let name = waiter.await.unwrap().unwrap();
        assert_eq!(name, "test");
    }

    #[tokio::test]
    async fn test_within_limit_releases_on_error() {
        let limiter = concurrent(1, Duration::ZERO);

        let result: Result<(), LimitError> = limiter
            .within_limit(|| async { Err(LimitError::store("boom")) })
            .await;
        assert!(result.is_err());

        let usage = limiter.usage().await.unwrap();
        assert_eq!(usage.in_use, 0);
        assert_eq!(usage.capacity, 1);
    }

    #[tokio::test]
    async fn test_dropped_permit_is_released() {
        let limiter = concurrent(1, Duration::from_millis(500));
        {
            let _permit = limiter.acquire().await.unwrap();
        }
        assert!(limiter.acquire().await.is_ok());
    }

    #[test]
    fn test_saturation() {
        let usage = Usage {
            in_use: 3,
            capacity: 4,
        };
        assert!((usage.saturation() - 0.75).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_release_failure_keeps_closure_result() {
        let shared = LimiterShared::new(
            "erp".to_string(),
            LimiterKind::Concurrent {
                capacity: 2,
                lock_timeout: Duration::from_secs(30),
            },
            Arc::new(StuckStore(MemoryStore::new())),
        );
        let limiter = Limiter::new(Arc::new(shared), Duration::ZERO);

        let value = limiter
            .within_limit(|| async { Ok::<_, LimitError>(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);

        let failed: Result<(), LimitError> = limiter
            .within_limit(|| async { Err(LimitError::InvalidConfig("bad row".to_string())) })
            .await;
        assert!(matches!(failed, Err(LimitError::InvalidConfig(_))));

        // Both holds are still counted until they lapse
        assert_eq!(limiter.usage().await.unwrap().in_use, 2);
    }
}
