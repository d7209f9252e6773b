//! Named limiter registry
//!
//! Lookup-or-create by name. A name maps to one counter state; asking for an
//! existing name with different parameters is a configuration conflict.

use crate::error::{LimitError, LimitResult};
use crate::kind::LimiterDef;
use crate::limiter::{Limiter, LimiterShared};
use crate::stores::{LimiterStore, MemoryStore};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use once_cell::sync::Lazy;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

static GLOBAL: Lazy<LimiterRegistry> = Lazy::new(LimiterRegistry::memory);

/// Registry of named limiters over one store
#[derive(Clone)]
pub struct LimiterRegistry {
    store: Arc<dyn LimiterStore>,
    // Shared state plus the wait timeout it was first registered with
    limiters: Arc<DashMap<String, (Arc<LimiterShared>, Duration)>>,
}

impl LimiterRegistry {
    /// Create a registry over a store
    pub fn new(store: Arc<dyn LimiterStore>) -> Self {
        info!(store = store.store_type(), "Creating limiter registry");
        Self {
            store,
            limiters: Arc::new(DashMap::new()),
        }
    }

    /// Create a registry over a fresh in-memory store
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Process-wide default registry
    pub fn global() -> &'static LimiterRegistry {
        &GLOBAL
    }

    /// Store backing this registry
    pub fn store(&self) -> &Arc<dyn LimiterStore> {
        &self.store
    }

    /// Look up or create a limiter from a definition
    pub fn register(&self, def: LimiterDef) -> LimitResult<Limiter> {
        def.validate()?;

        let shared = match self.limiters.entry(def.name.clone()) {
            Entry::Occupied(existing) => {
                let (shared, _) = existing.get();
                if shared.kind != def.kind {
                    return Err(LimitError::Conflict {
                        name: def.name,
                        existing: shared.kind.to_string(),
                        requested: def.kind.to_string(),
                    });
                }
                shared.clone()
            }
            Entry::Vacant(slot) => {
                debug!(limiter = %def.name, kind = %def.kind, "Registering limiter");
                let shared = Arc::new(LimiterShared::new(
                    def.name.clone(),
                    def.kind.clone(),
                    self.store.clone(),
                ));
                slot.insert((shared.clone(), def.wait_timeout));
                shared
            }
        };

        Ok(Limiter::new(shared, def.wait_timeout))
    }

    /// Concurrent limiter with default wait and lock timeouts
    pub fn concurrent(&self, name: impl Into<String>, capacity: u64) -> LimitResult<Limiter> {
        self.register(LimiterDef::concurrent(name, capacity))
    }

    /// Concurrent limiter with explicit timeouts
    pub fn concurrent_with(
        &self,
        name: impl Into<String>,
        capacity: u64,
        wait_timeout: Duration,
        lock_timeout: Duration,
    ) -> LimitResult<Limiter> {
        self.register(
            LimiterDef::concurrent(name, capacity)
                .with_wait_timeout(wait_timeout)
                .with_lock_timeout(lock_timeout),
        )
    }

    /// Bucket limiter: `capacity` admissions per fixed `period`
    pub fn bucket(
        &self,
        name: impl Into<String>,
        capacity: u64,
        period: Duration,
    ) -> LimitResult<Limiter> {
        self.register(LimiterDef::bucket(name, capacity, period))
    }

    /// Window limiter: `capacity` admissions per rolling `period`
    pub fn window(
        &self,
        name: impl Into<String>,
        capacity: u64,
        period: Duration,
    ) -> LimitResult<Limiter> {
        self.register(LimiterDef::window(name, capacity, period))
    }

    /// Get a registered limiter by name, with the wait timeout it was
    /// first registered with
    pub fn get(&self, name: &str) -> Option<Limiter> {
        self.limiters.get(name).map(|entry| {
            let (shared, wait_timeout) = entry.value();
            Limiter::new(shared.clone(), *wait_timeout)
        })
    }

    /// All registered limiters, sorted by name
    pub fn limiters(&self) -> Vec<Limiter> {
        let mut all: Vec<Limiter> = self
            .limiters
            .iter()
            .map(|entry| {
                let (shared, wait_timeout) = entry.value();
                Limiter::new(shared.clone(), *wait_timeout)
            })
            .collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Number of registered limiters
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    /// Check if no limiter is registered
    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

impl Default for LimiterRegistry {
    fn default() -> Self {
        Self::memory()
    }
}

impl std::fmt::Debug for LimiterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterRegistry")
            .field("store", &self.store.store_type())
            .field("limiters", &self.limiters.len())
            .finish()
    }
}
