//! In-memory limiter store
//!
//! Uses DashMap entry locks so each check-and-update is atomic. Every handle
//! created from the same registry shares one store, which makes limiter
//! identity a matter of name rather than object.

use crate::error::LimitResult;
use crate::kind::LimiterKind;
use crate::stores::{Admission, LimiterStore, bucket_position, epoch_millis};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use uuid::Uuid;

/// Concurrent hold state: token -> expiry
#[derive(Debug, Default)]
struct SlotState {
    holders: HashMap<String, Instant>,
}

impl SlotState {
    /// Drop expired holds, returning how many were reclaimed
    fn reclaim(&mut self, now: Instant) -> u64 {
        let before = self.holders.len();
        self.holders.retain(|_, expires| *expires > now);
        (before - self.holders.len()) as u64
    }
}

/// Fixed period state
#[derive(Debug, Clone)]
struct BucketState {
    index: u64,
    count: u64,
}

/// In-memory limiter store
pub struct MemoryStore {
    slots: DashMap<String, SlotState>,
    buckets: DashMap<String, BucketState>,
    windows: DashMap<String, VecDeque<Instant>>,
}

impl MemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        debug!("Creating new in-memory limiter store");
        Self {
            slots: DashMap::new(),
            buckets: DashMap::new(),
            windows: DashMap::new(),
        }
    }

    /// Get the number of tracked limiters (for monitoring)
    pub fn key_count(&self) -> usize {
        self.slots.len() + self.buckets.len() + self.windows.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LimiterStore for MemoryStore {
    async fn acquire_slot(
        &self,
        name: &str,
        capacity: u64,
        lock_timeout: Duration,
    ) -> LimitResult<Admission> {
        let now = Instant::now();
        let mut entry = self.slots.entry(name.to_string()).or_default();
        let reclaimed = entry.reclaim(now);

        let held = entry.holders.len() as u64;
        if held < capacity {
            let token = Uuid::new_v4().to_string();
            entry.holders.insert(token.clone(), now + lock_timeout);
            trace!(limiter = %name, held = held + 1, "Concurrent: admitted");
            Ok(Admission {
                allowed: true,
                remaining: capacity - held - 1,
                retry_after: None,
                token: Some(token),
                reclaimed,
            })
        } else {
            let earliest = entry
                .holders
                .values()
                .min()
                .map(|expires| expires.saturating_duration_since(now));
            trace!(limiter = %name, held = held, "Concurrent: denied");
            Ok(Admission {
                reclaimed,
                ..Admission::denied(earliest)
            })
        }
    }

    async fn release_slot(&self, name: &str, token: &str) -> LimitResult<bool> {
        let released = match self.slots.get_mut(name) {
            Some(mut entry) => entry.holders.remove(token).is_some(),
            None => false,
        };
        trace!(limiter = %name, released = released, "Concurrent: release");
        Ok(released)
    }

    async fn bucket_take(
        &self,
        name: &str,
        capacity: u64,
        period: Duration,
    ) -> LimitResult<Admission> {
        let (index, until_boundary) = bucket_position(epoch_millis(), period);

        let mut entry = self
            .buckets
            .entry(name.to_string())
            .or_insert(BucketState { index, count: 0 });

        if entry.index != index {
            entry.index = index;
            entry.count = 0;
        }

        if entry.count < capacity {
            entry.count += 1;
            trace!(limiter = %name, count = entry.count, "Bucket: admitted");
            Ok(Admission::allowed(capacity - entry.count))
        } else {
            trace!(limiter = %name, "Bucket: denied");
            Ok(Admission::denied(Some(until_boundary)))
        }
    }

    async fn window_take(
        &self,
        name: &str,
        capacity: u64,
        period: Duration,
    ) -> LimitResult<Admission> {
        let now = Instant::now();
        let mut entry = self.windows.entry(name.to_string()).or_default();

        while let Some(front) = entry.front() {
            if now.duration_since(*front) >= period {
                entry.pop_front();
            } else {
                break;
            }
        }

        let count = entry.len() as u64;
        if count < capacity {
            entry.push_back(now);
            trace!(limiter = %name, count = count + 1, "Window: admitted");
            Ok(Admission::allowed(capacity - count - 1))
        } else {
            let retry_after = entry
                .front()
                .map(|oldest| period.saturating_sub(now.duration_since(*oldest)));
            trace!(limiter = %name, "Window: denied");
            Ok(Admission::denied(retry_after))
        }
    }

    async fn in_use(&self, name: &str, kind: &LimiterKind) -> LimitResult<u64> {
        let used = match kind {
            LimiterKind::Concurrent { .. } => self
                .slots
                .get_mut(name)
                .map(|mut entry| {
                    entry.reclaim(Instant::now());
                    entry.holders.len() as u64
                })
                .unwrap_or(0),
            LimiterKind::Bucket { period, .. } => {
                let (index, _) = bucket_position(epoch_millis(), *period);
                self.buckets
                    .get(name)
                    .filter(|state| state.index == index)
                    .map(|state| state.count)
                    .unwrap_or(0)
            }
            LimiterKind::Window { period, .. } => {
                let now = Instant::now();
                self.windows
                    .get(name)
                    .map(|log| {
                        log.iter()
                            .filter(|at| now.duration_since(**at) < *period)
                            .count() as u64
                    })
                    .unwrap_or(0)
            }
        };
        Ok(used)
    }

    async fn reset(&self, name: &str) -> LimitResult<()> {
        debug!(limiter = %name, "Resetting limiter state");
        self.slots.remove(name);
        self.buckets.remove(name);
        self.windows.remove(name);
        Ok(())
    }

    fn store_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_capacity() {
        let store = MemoryStore::new();
        let timeout = Duration::from_secs(30);

        let a = store.acquire_slot("db", 2, timeout).await.unwrap();
        let b = store.acquire_slot("db", 2, timeout).await.unwrap();
        let c = store.acquire_slot("db", 2, timeout).await.unwrap();

        assert!(a.allowed);
        assert!(b.allowed);
        assert!(!c.allowed);
        assert_eq!(b.remaining, 0);

        let token = a.token.unwrap();
        assert!(store.release_slot("db", &token).await.unwrap());
        assert!(!store.release_slot("db", &token).await.unwrap());

        let d = store.acquire_slot("db", 2, timeout).await.unwrap();
        assert!(d.allowed);
    }

    #[tokio::test]
    async fn test_concurrent_lock_timeout_reclaims() {
        let store = MemoryStore::new();
        let timeout = Duration::from_millis(20);

        let a = store.acquire_slot("slow", 1, timeout).await.unwrap();
        assert!(a.allowed);
        assert!(!store.acquire_slot("slow", 1, timeout).await.unwrap().allowed);

        tokio::time::sleep(Duration::from_millis(40)).await;

        let b = store.acquire_slot("slow", 1, timeout).await.unwrap();
        assert!(b.allowed);
        assert_eq!(b.reclaimed, 1);

        // The forcibly released hold can no longer be released by its owner
        assert!(!store.release_slot("slow", &a.token.unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_bucket_quota() {
        let store = MemoryStore::new();
        let period = Duration::from_secs(3600);

        for i in (0..3).rev() {
            let result = store.bucket_take("api", 3, period).await.unwrap();
            assert!(result.allowed);
            assert_eq!(result.remaining, i);
        }

        let denied = store.bucket_take("api", 3, period).await.unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after.unwrap() <= period);
        assert_eq!(
            store
                .in_use("api", &LimiterKind::Bucket { capacity: 3, period })
                .await
                .unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn test_window_expiry() {
        let store = MemoryStore::new();
        let period = Duration::from_millis(50);

        assert!(store.window_take("w", 2, period).await.unwrap().allowed);
        assert!(store.window_take("w", 2, period).await.unwrap().allowed);
        assert!(!store.window_take("w", 2, period).await.unwrap().allowed);

        tokio::time::sleep(Duration::from_millis(70)).await;

        let result = store.window_take("w", 2, period).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 1);
    }

    #[tokio::test]
    async fn test_reset() {
        let store = MemoryStore::new();
        let period = Duration::from_secs(60);

        store.window_take("r", 1, period).await.unwrap();
        assert!(!store.window_take("r", 1, period).await.unwrap().allowed);

        store.reset("r").await.unwrap();
        assert!(store.window_take("r", 1, period).await.unwrap().allowed);
        assert_eq!(store.store_type(), "memory");
    }
}
