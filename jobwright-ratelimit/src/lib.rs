//! # Jobwright Limiters
//!
//! Named limiters that bound how often or how widely a piece of job code runs
//! across a worker pool.
//!
//! ## Features
//!
//! - **Concurrent**: at most N holders at once, with forced release of holds
//!   older than `lock_timeout`
//! - **Bucket**: N admissions per fixed period
//! - **Window**: N admissions per rolling period
//! - **Identity by name**: every handle with the same name shares one counter
//! - **Storage Backends**: In-memory (DashMap) and Redis for multi-process pools
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use jobwright_ratelimit::{LimitError, LimiterRegistry};
//!
//! # async fn example() -> Result<(), LimitError> {
//! let erp = LimiterRegistry::global().concurrent("erp", 5)?;
//!
//! let total = erp
//!     .within_limit(|| async {
//!         // call the external system
//!         Ok::<_, LimitError>(42)
//!     })
//!     .await?;
//! # let _ = total;
//! # Ok(())
//! # }
//! ```
//!
//! When capacity is not acquired within the wait timeout, `within_limit`
//! returns [`LimitError::OverLimit`]. Inside a job handler, let it propagate:
//! the job is rescheduled without consuming a retry.
//!
//! ## Distributed Limits
//!
//! With the `redis` feature enabled, build the registry over a [`RedisStore`]
//! so every worker process shares the same counters:
//!
//! ```rust,ignore
//! use jobwright_ratelimit::{LimiterRegistry, RedisStore};
//! use std::sync::Arc;
//!
//! let store = RedisStore::new("redis://localhost:6379").await?;
//! let registry = LimiterRegistry::new(Arc::new(store));
//! ```

pub mod error;
pub mod kind;
pub mod limiter;
pub mod registry;
pub mod stores;

pub use error::{LimitError, LimitResult};
pub use kind::{DEFAULT_LOCK_TIMEOUT, DEFAULT_WAIT_TIMEOUT, LimiterDef, LimiterKind};
pub use limiter::{Limiter, LimiterStats, Permit, Usage};
pub use registry::LimiterRegistry;
pub use stores::{Admission, LimiterStore, MemoryStore};

#[cfg(feature = "redis")]
pub use stores::RedisStore;

/// Prelude for common imports
pub mod prelude {
    pub use crate::error::{LimitError, LimitResult};
    pub use crate::kind::{LimiterDef, LimiterKind};
    pub use crate::limiter::{Limiter, Permit, Usage};
    pub use crate::registry::LimiterRegistry;
    pub use crate::stores::{LimiterStore, MemoryStore};

    #[cfg(feature = "redis")]
    pub use crate::stores::RedisStore;
}
