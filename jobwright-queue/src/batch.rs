//! Batches: groups of jobs with callbacks fired once every member resolves.
//!
//! ```no_run
//! use jobwright_queue::{BatchCoordinator, BatchEvent, Job, MemoryStore};
//! use std::sync::Arc;
//! use tokio::sync::Notify;
//!
//! # async fn example() -> jobwright_queue::QueueResult<()> {
//! let store = Arc::new(MemoryStore::new());
//! let batches = BatchCoordinator::new(store, Arc::new(Notify::new()));
//!
//! let batch = batches.begin_batch("nightly import").await?;
//! batches.on_event(batch, BatchEvent::Success, |id, status| async move {
//!     println!("batch {} finished: {} jobs", id, status.total);
//! });
//!
//! let jobs = (0..10)
//!     .map(|n| Job::new("import", "import_row", serde_json::json!({ "row": n })))
//!     .collect();
//! batches.add_jobs(batch, jobs).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobId};
use crate::store::JobStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Batch unique identifier.
pub type BatchId = Uuid;

/// Batch lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    /// Members still unresolved
    #[default]
    Pending,
    /// Every member completed
    Complete,
    /// Every member resolved and at least one died
    Failed,
}

/// Terminal outcome of a batch member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberOutcome {
    /// Job succeeded
    Completed,
    /// Job ended in the dead set
    Dead,
}

/// Callback trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchEvent {
    /// All members completed, none died
    Success,
    /// All members resolved, at least one died
    Failure,
    /// All members resolved
    Complete,
}

/// Stored batch accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    /// Batch id
    pub id: BatchId,
    /// Free-form description
    pub description: String,
    /// When the batch was created
    pub created_at: DateTime<Utc>,
    /// Member job ids
    pub members: HashSet<JobId>,
    /// Outcomes of resolved members
    pub resolved: HashMap<JobId, MemberOutcome>,
    /// Lifecycle state
    pub state: BatchState,
    /// When the last member resolved
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchRecord {
    /// A new empty pending batch.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            created_at: Utc::now(),
            members: HashSet::new(),
            resolved: HashMap::new(),
            state: BatchState::Pending,
            finished_at: None,
        }
    }

    /// Check that members may still be added.
    pub fn ensure_open(&self) -> QueueResult<()> {
        if self.state != BatchState::Pending {
            return Err(QueueError::InvalidBatch(format!(
                "batch {} is already finalized",
                self.id
            )));
        }
        Ok(())
    }

    /// Record a member outcome. Returns the final status once, when the last
    /// member resolves.
    pub fn record(
        &mut self,
        job_id: JobId,
        outcome: MemberOutcome,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<BatchStatus>> {
        if !self.members.contains(&job_id) {
            return Err(QueueError::InvalidBatch(format!(
                "job {} is not a member of batch {}",
                job_id, self.id
            )));
        }
        if self.state != BatchState::Pending || self.resolved.contains_key(&job_id) {
            return Ok(None);
        }

        self.resolved.insert(job_id, outcome);
        if self.resolved.len() < self.members.len() {
            return Ok(None);
        }

        self.state = if self.dead() > 0 {
            BatchState::Failed
        } else {
            BatchState::Complete
        };
        self.finished_at = Some(now);
        Ok(Some(self.status()))
    }

    /// Forget a dead member's outcome while the batch is pending.
    pub fn revert(&mut self, job_id: JobId) -> bool {
        if self.state != BatchState::Pending {
            return false;
        }
        if self.resolved.get(&job_id) == Some(&MemberOutcome::Dead) {
            self.resolved.remove(&job_id);
            return true;
        }
        false
    }

    fn dead(&self) -> usize {
        self.resolved
            .values()
            .filter(|o| **o == MemberOutcome::Dead)
            .count()
    }

    /// Snapshot of the batch counters.
    pub fn status(&self) -> BatchStatus {
        let dead = self.dead();
        let completed = self.resolved.len() - dead;
        BatchStatus {
            batch_id: self.id,
            description: self.description.clone(),
            total: self.members.len(),
            pending: self.members.len() - self.resolved.len(),
            completed,
            dead,
            state: self.state,
        }
    }
}

/// Snapshot of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStatus {
    /// Batch id
    pub batch_id: BatchId,
    /// Description
    pub description: String,
    /// Member count
    pub total: usize,
    /// Members not yet resolved
    pub pending: usize,
    /// Members completed
    pub completed: usize,
    /// Members dead
    pub dead: usize,
    /// Lifecycle state
    pub state: BatchState,
}

/// Batch callback.
pub type BatchCallback = Arc<dyn Fn(BatchId, BatchStatus) -> BoxFuture<'static, ()> + Send + Sync>;

/// Creates batches, registers members and fires callbacks.
#[derive(Clone)]
pub struct BatchCoordinator {
    store: Arc<dyn JobStore>,
    callbacks: Arc<DashMap<BatchId, Vec<(BatchEvent, BatchCallback)>>>,
    work: Arc<Notify>,
}

impl BatchCoordinator {
    /// Create a coordinator over a store. `work` is signalled when members are enqueued.
    pub fn new(store: Arc<dyn JobStore>, work: Arc<Notify>) -> Self {
        Self {
            store,
            callbacks: Arc::new(DashMap::new()),
            work,
        }
    }

    /// Start a new empty batch.
    pub async fn begin_batch(&self, description: impl Into<String>) -> QueueResult<BatchId> {
        let record = BatchRecord::new(description);
        let id = record.id;
        self.store.create_batch(record).await?;
        info!(batch_id = %id, "Batch created");
        Ok(id)
    }

    /// Register and enqueue members, all or none.
    pub async fn add_jobs(&self, batch_id: BatchId, jobs: Vec<Job>) -> QueueResult<Vec<JobId>> {
        if jobs.is_empty() {
            return Err(QueueError::InvalidBatch(
                "cannot add an empty set of jobs".to_string(),
            ));
        }

        let count = jobs.len();
        let ids = self.store.enqueue_batch_members(batch_id, jobs).await?;
        debug!(batch_id = %batch_id, count = count, "Batch members enqueued");
        self.work.notify_waiters();
        Ok(ids)
    }

    /// Register a callback for a batch event.
    pub fn on_event<F, Fut>(&self, batch_id: BatchId, event: BatchEvent, callback: F)
    where
        F: Fn(BatchId, BatchStatus) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: BatchCallback = Arc::new(
            move |id: BatchId, status: BatchStatus| -> BoxFuture<'static, ()> {
                Box::pin(callback(id, status))
            },
        );
        self.callbacks
            .entry(batch_id)
            .or_default()
            .push((event, callback));
    }

    /// Current batch snapshot.
    pub async fn status(&self, batch_id: BatchId) -> QueueResult<BatchStatus> {
        self.store
            .get_batch(batch_id)
            .await?
            .map(|b| b.status())
            .ok_or_else(|| QueueError::BatchNotFound(batch_id.to_string()))
    }

    /// Record a member outcome, firing callbacks if it resolves the batch.
    pub async fn record(
        &self,
        batch_id: BatchId,
        job_id: JobId,
        outcome: MemberOutcome,
    ) -> QueueResult<Option<BatchStatus>> {
        let status = self
            .store
            .record_batch_outcome(batch_id, job_id, outcome)
            .await?;

        if let Some(status) = &status {
            info!(
                batch_id = %batch_id,
                completed = status.completed,
                dead = status.dead,
                "Batch resolved"
            );
            self.fire(status.clone()).await;
        }
        Ok(status)
    }

    async fn fire(&self, status: BatchStatus) {
        let Some((_, callbacks)) = self.callbacks.remove(&status.batch_id) else {
            debug!(batch_id = %status.batch_id, "No callbacks registered in this process");
            return;
        };

        let outcome_event = if status.dead > 0 {
            BatchEvent::Failure
        } else {
            BatchEvent::Success
        };

        for wanted in [BatchEvent::Complete, outcome_event] {
            for (event, callback) in callbacks.iter().filter(|(e, _)| *e == wanted) {
                debug!(batch_id = %status.batch_id, event = ?event, "Firing batch callback");
                callback(status.batch_id, status.clone()).await;
            }
        }

        if status.dead > 0 {
            warn!(batch_id = %status.batch_id, dead = status.dead, "Batch finished with dead members");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_with(n: usize) -> (BatchRecord, Vec<JobId>) {
        let mut batch = BatchRecord::new("test");
        let ids: Vec<JobId> = (0..n).map(|_| Uuid::new_v4()).collect();
        batch.members.extend(ids.iter().copied());
        (batch, ids)
    }

    #[test]
    fn test_resolves_once_on_last_member() {
        let (mut batch, ids) = batch_with(3);
        let now = Utc::now();

        assert!(batch.record(ids[0], MemberOutcome::Completed, now).unwrap().is_none());
        assert!(batch.record(ids[1], MemberOutcome::Completed, now).unwrap().is_none());

        let status = batch
            .record(ids[2], MemberOutcome::Completed, now)
            .unwrap()
            .unwrap();
        assert_eq!(status.state, BatchState::Complete);
        assert_eq!(status.completed, 3);
        assert_eq!(status.pending, 0);

        // Late duplicates never resolve again
        assert!(batch.record(ids[2], MemberOutcome::Completed, now).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_outcome_is_ignored() {
        let (mut batch, ids) = batch_with(2);
        let now = Utc::now();

        batch.record(ids[0], MemberOutcome::Completed, now).unwrap();
        assert!(batch.record(ids[0], MemberOutcome::Completed, now).unwrap().is_none());
        assert_eq!(batch.status().pending, 1);
    }

    #[test]
    fn test_dead_member_fails_batch() {
        let (mut batch, ids) = batch_with(2);
        let now = Utc::now();

        batch.record(ids[0], MemberOutcome::Dead, now).unwrap();
        let status = batch
            .record(ids[1], MemberOutcome::Completed, now)
            .unwrap()
            .unwrap();
        assert_eq!(status.state, BatchState::Failed);
        assert_eq!(status.dead, 1);
    }

    #[test]
    fn test_revert_dead_member_while_pending() {
        let (mut batch, ids) = batch_with(2);
        let now = Utc::now();

        batch.record(ids[0], MemberOutcome::Dead, now).unwrap();
        assert!(batch.revert(ids[0]));
        assert!(!batch.revert(ids[0]));

        batch.record(ids[0], MemberOutcome::Completed, now).unwrap();
        let status = batch
            .record(ids[1], MemberOutcome::Completed, now)
            .unwrap()
            .unwrap();
        assert_eq!(status.state, BatchState::Complete);
    }

    #[test]
    fn test_non_member_rejected() {
        let (mut batch, _) = batch_with(1);
        let result = batch.record(Uuid::new_v4(), MemberOutcome::Completed, Utc::now());
        assert!(matches!(result, Err(QueueError::InvalidBatch(_))));
    }

    #[test]
    fn test_finalized_batch_is_closed() {
        let (mut batch, ids) = batch_with(1);
        assert!(batch.ensure_open().is_ok());
        batch.record(ids[0], MemberOutcome::Completed, Utc::now()).unwrap();
        assert!(batch.ensure_open().is_err());
    }
}
