//! Durable job storage.
//!
//! A job lives in exactly one of four places: a ready queue, the scheduled
//! set, the claimed set or the dead set. Every method moves a job between
//! them in one atomic step.
//!
//! - **Memory**: one lock over all state, optionally snapshotted to a JSON file
//! - **Redis**: JSON records, lists and sorted sets moved by Lua scripts

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis::RedisStore;

use crate::batch::{BatchId, BatchRecord, BatchStatus, MemberOutcome};
use crate::dead::DeadFilter;
use crate::error::QueueResult;
use crate::job::{Job, JobId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Entry in the scheduled set.
///
/// Ordered by due time, then by insertion sequence so equal due times keep
/// the order in which they were scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScheduledEntry {
    /// When the job becomes due
    pub due_at: DateTime<Utc>,
    /// Insertion sequence
    pub seq: u64,
    /// Scheduled job
    pub job_id: JobId,
}

/// Trait for job storage backends.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Store a new job: into its ready queue if due, else into the scheduled set.
    async fn enqueue(&self, job: Job) -> QueueResult<JobId>;

    /// Store several jobs, all or none.
    async fn enqueue_all(&self, jobs: Vec<Job>) -> QueueResult<Vec<JobId>>;

    /// Claim the head of a ready queue until `lease_until`.
    async fn dequeue(&self, queue: &str, lease_until: DateTime<Utc>) -> QueueResult<Option<Job>>;

    /// Acknowledge a claimed job as done and delete it.
    ///
    /// Fails with `JobNotFound` if the job is not claimed.
    async fn remove(&self, id: JobId) -> QueueResult<()>;

    /// Save a claimed job's record and move it to the scheduled set.
    async fn schedule(&self, job: Job, due_at: DateTime<Utc>) -> QueueResult<()>;

    /// Save a claimed job's record and move it to the dead set.
    async fn move_to_dead(&self, job: Job, died_at: DateTime<Utc>) -> QueueResult<()>;

    /// Move a dead job back to its ready queue with a fresh retry budget.
    ///
    /// A member of a pending batch has its dead outcome reverted in the same
    /// atomic step.
    async fn requeue_dead(&self, id: JobId) -> QueueResult<Job>;

    /// Delete a dead job. Returns false if it was not dead.
    async fn delete_dead(&self, id: JobId) -> QueueResult<bool>;

    /// Dead jobs matching a filter, most recent death first.
    async fn list_dead(&self, filter: &DeadFilter) -> QueueResult<Vec<Job>>;

    /// A dead job by id.
    async fn get_dead(&self, id: JobId) -> QueueResult<Option<Job>>;

    /// Delete every dead job matching a filter.
    async fn purge_dead(&self, filter: &DeadFilter) -> QueueResult<usize>;

    /// Delete the oldest dead jobs beyond `max_jobs`.
    async fn trim_dead(&self, max_jobs: usize) -> QueueResult<usize>;

    /// Move every scheduled job due at `now` to its ready queue, in due order.
    async fn promote_due(&self, now: DateTime<Utc>) -> QueueResult<Vec<JobId>>;

    /// Extend a live claim. Returns false if the job is no longer claimed.
    async fn heartbeat(&self, id: JobId, lease_until: DateTime<Utc>) -> QueueResult<bool>;

    /// Return claims whose lease expired at `now` to their ready queues.
    async fn reclaim_stale(&self, now: DateTime<Utc>) -> QueueResult<Vec<JobId>>;

    /// A job by id, wherever it lives.
    async fn get_job(&self, id: JobId) -> QueueResult<Option<Job>>;

    /// Ready jobs in a queue.
    async fn queue_depth(&self, queue: &str) -> QueueResult<usize>;

    /// Every queue that has held a job, sorted.
    async fn queue_names(&self) -> QueueResult<Vec<String>>;

    /// Jobs in the scheduled set.
    async fn scheduled_count(&self) -> QueueResult<usize>;

    /// Jobs in the dead set.
    async fn dead_count(&self) -> QueueResult<usize>;

    /// Store a new batch.
    async fn create_batch(&self, batch: BatchRecord) -> QueueResult<()>;

    /// A batch by id.
    async fn get_batch(&self, id: BatchId) -> QueueResult<Option<BatchRecord>>;

    /// Register jobs as batch members and enqueue them, all or none.
    async fn enqueue_batch_members(&self, batch_id: BatchId, jobs: Vec<Job>)
    -> QueueResult<Vec<JobId>>;

    /// Record a member's terminal outcome.
    ///
    /// Returns the final status to exactly one caller: the one whose outcome
    /// resolves the last member. Recording the same member twice is a no-op.
    async fn record_batch_outcome(
        &self,
        batch_id: BatchId,
        job_id: JobId,
        outcome: MemberOutcome,
    ) -> QueueResult<Option<BatchStatus>>;

    /// Get store type name for debugging
    fn store_type(&self) -> &'static str;
}
