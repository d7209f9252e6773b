//! Dead set inspection and recovery.

use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobId};
use crate::store::JobStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Selects dead jobs. Empty criteria match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadFilter {
    /// Queue name
    pub queue: Option<String>,
    /// Job type
    pub job_type: Option<String>,
    /// Class of the final error
    pub error_class: Option<String>,
    /// Died strictly before
    pub died_before: Option<DateTime<Utc>>,
    /// Died at or after
    pub died_after: Option<DateTime<Utc>>,
    /// Maximum number of jobs returned by listings
    pub limit: Option<usize>,
}

impl DeadFilter {
    /// Match everything
    pub fn all() -> Self {
        Self::default()
    }

    /// Only jobs from this queue
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Only jobs of this type
    pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    /// Only jobs whose final error has this class
    pub fn error_class(mut self, class: impl Into<String>) -> Self {
        self.error_class = Some(class.into());
        self
    }

    /// Only jobs that died before this time
    pub fn died_before(mut self, at: DateTime<Utc>) -> Self {
        self.died_before = Some(at);
        self
    }

    /// Only jobs that died at or after this time
    pub fn died_after(mut self, at: DateTime<Utc>) -> Self {
        self.died_after = Some(at);
        self
    }

    /// Cap listing size
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check a dead job against the criteria (ignores `limit`)
    pub fn matches(&self, job: &Job) -> bool {
        if self.queue.as_ref().is_some_and(|q| *q != job.queue) {
            return false;
        }
        if self.job_type.as_ref().is_some_and(|t| *t != job.job_type) {
            return false;
        }
        if let Some(class) = &self.error_class
            && job.error_class() != Some(class.as_str())
        {
            return false;
        }
        match job.died_at {
            Some(died) => {
                if self.died_before.is_some_and(|before| died >= before) {
                    return false;
                }
                if self.died_after.is_some_and(|after| died < after) {
                    return false;
                }
            }
            None if self.died_before.is_some() || self.died_after.is_some() => return false,
            None => {}
        }
        true
    }
}

/// Operator view of the dead set.
#[derive(Clone)]
pub struct DeadSet {
    store: Arc<dyn JobStore>,
    work: Arc<Notify>,
}

impl DeadSet {
    /// Create a dead set view. `work` is signalled when jobs are requeued.
    pub fn new(store: Arc<dyn JobStore>, work: Arc<Notify>) -> Self {
        Self { store, work }
    }

    /// Dead jobs matching a filter, most recent death first.
    pub async fn list(&self, filter: &DeadFilter) -> QueueResult<Vec<Job>> {
        self.store.list_dead(filter).await
    }

    /// A dead job by id.
    pub async fn get(&self, id: JobId) -> QueueResult<Option<Job>> {
        self.store.get_dead(id).await
    }

    /// Number of dead jobs.
    pub async fn size(&self) -> QueueResult<usize> {
        self.store.dead_count().await
    }

    /// Move a dead job back to its ready queue with a fresh retry budget.
    pub async fn requeue(&self, id: JobId) -> QueueResult<Job> {
        let job = self.store.requeue_dead(id).await?;
        info!(job_id = %id, queue = %job.queue, "Dead job requeued");
        self.work.notify_waiters();
        Ok(job)
    }

    /// Requeue every dead job matching a filter. Returns the requeued ids.
    pub async fn requeue_all(&self, filter: &DeadFilter) -> QueueResult<Vec<JobId>> {
        let candidates = self.store.list_dead(filter).await?;
        let mut requeued = Vec::with_capacity(candidates.len());

        for job in candidates {
            match self.store.requeue_dead(job.id).await {
                Ok(_) => requeued.push(job.id),
                // Deleted or requeued concurrently
                Err(QueueError::JobNotFound(_)) => {
                    warn!(job_id = %job.id, "Dead job vanished before requeue");
                }
                Err(e) => return Err(e),
            }
        }

        if !requeued.is_empty() {
            info!(count = requeued.len(), "Dead jobs requeued");
            self.work.notify_waiters();
        }
        Ok(requeued)
    }

    /// Delete a dead job. Returns false if it was not dead.
    pub async fn delete(&self, id: JobId) -> QueueResult<bool> {
        self.store.delete_dead(id).await
    }

    /// Delete every dead job matching a filter.
    pub async fn purge(&self, filter: &DeadFilter) -> QueueResult<usize> {
        let purged = self.store.purge_dead(filter).await?;
        info!(count = purged, "Dead jobs purged");
        Ok(purged)
    }
}
