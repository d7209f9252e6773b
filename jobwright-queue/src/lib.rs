//! Durable background job processing for Jobwright.
//!
//! Provides a job queue system with:
//! - 📦 Durable storage (in-memory snapshot file or Redis)
//! - 🔄 Automatic retries with pluggable backoff
//! - ⏰ Delayed and scheduled jobs
//! - 🚦 Rate limited handlers that reschedule instead of failing
//! - 🧺 Batches with success, failure and complete callbacks
//! - 💀 Dead set with requeue and purge
//! - 👷 Worker pools over weighted queues
//!
//! ## Quick Start - Job Creation
//!
//! ```
//! use jobwright_queue::{Job, JobState};
//! use serde_json::json;
//!
//! let job = Job::new("emails", "send_welcome", json!({"to": "user@example.com"}));
//!
//! assert_eq!(job.queue, "emails");
//! assert_eq!(job.job_type, "send_welcome");
//! assert_eq!(job.state, JobState::Ready);
//! assert_eq!(job.retry_count, 0);
//! ```
//!
//! ## Delayed Jobs
//!
//! ```
//! use jobwright_queue::Job;
//! use serde_json::json;
//! use std::time::Duration;
//!
//! let reminder = Job::new("emails", "reminder", json!({}))
//!     .schedule_after(Duration::from_secs(3600));
//!
//! assert!(!reminder.is_due(chrono::Utc::now()));
//! ```
//!
//! ## Retry Policies
//!
//! ```
//! use jobwright_queue::{FixedBackoff, JobError, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(3)
//!     .with_backoff(FixedBackoff(Duration::from_secs(10)))
//!     .on_class("Throttled", FixedBackoff(Duration::from_secs(60)));
//!
//! let plain = JobError::failed("Io", "connection reset");
//! let throttled = JobError::failed("Throttled", "slow down");
//! assert_eq!(policy.delay(0, &plain), Duration::from_secs(10));
//! assert_eq!(policy.delay(0, &throttled), Duration::from_secs(60));
//! ```
//!
//! ## Complete Example
//!
//! ```no_run
//! use jobwright_queue::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), QueueError> {
//!     let mut engine = Engine::from_config(EngineConfig::from_env()?).await?;
//!
//!     engine.register("send_email", |job, ctx| async move {
//!         println!("attempt {} for {}", ctx.attempt, job.payload);
//!         Ok(Completion::Done)
//!     });
//!
//!     engine.start().await?;
//!     engine
//!         .enqueue(
//!             "default",
//!             "send_email",
//!             serde_json::json!({"to": "user@example.com"}),
//!             EnqueueOptions::new(),
//!         )
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     engine.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod client;
pub mod config;
pub mod dead;
pub mod engine;
pub mod error;
pub mod handler;
pub mod job;
pub mod metrics;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use batch::{
    BatchCallback, BatchCoordinator, BatchEvent, BatchId, BatchRecord, BatchState, BatchStatus,
    MemberOutcome,
};
pub use client::{Client, EnqueueOptions};
pub use config::{EngineConfig, LimiterConfig, LimiterKindConfig, StoreConfig};
pub use dead::{DeadFilter, DeadSet};
pub use engine::Engine;
pub use error::{
    ConfigError, JobError, NO_HANDLER_CLASS, OVER_LIMIT_CLASS, PANIC_CLASS, QueueError,
    QueueResult, TIMEOUT_CLASS,
};
pub use handler::{Completion, HandlerRegistry, JobContext, JobHandler};
pub use job::{DEFAULT_MAX_RETRIES, ErrorRecord, Job, JobData, JobId, JobState};
pub use metrics::QueueMetrics;
pub use retry::{
    Backoff, ExponentialBackoff, FixedBackoff, FnBackoff, LinearBackoff, Outcome,
    PolynomialBackoff, RetryConfig, RetryManager, RetryPolicy, backoff_fn,
};
pub use scheduler::{Scheduler, SweepReport};
pub use store::{JobStore, MemoryStore, ScheduledEntry};
pub use worker::{QueueSelection, QueueWeight, WorkerConfig, WorkerPool};

#[cfg(feature = "redis")]
pub use store::RedisStore;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::batch::{BatchCoordinator, BatchEvent, BatchId, BatchStatus};
    pub use crate::client::{Client, EnqueueOptions};
    pub use crate::config::EngineConfig;
    pub use crate::dead::{DeadFilter, DeadSet};
    pub use crate::engine::Engine;
    pub use crate::error::{JobError, QueueError, QueueResult};
    pub use crate::handler::{Completion, JobContext};
    pub use crate::job::{Job, JobData, JobId, JobState};
    pub use crate::retry::{Backoff, RetryPolicy, backoff_fn};
    pub use crate::store::{JobStore, MemoryStore};
    pub use crate::worker::{QueueSelection, QueueWeight, WorkerConfig};
}
