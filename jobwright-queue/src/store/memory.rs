//! In-memory job store.
//!
//! All state sits behind one lock, so every operation is a single atomic
//! section. Opened with a path, the store loads a JSON snapshot at startup
//! and rewrites it (temp file + rename) after every mutation, before the
//! operation returns.

use crate::batch::{BatchId, BatchRecord, BatchStatus, MemberOutcome};
use crate::dead::DeadFilter;
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobId, JobState};
use crate::store::{JobStore, ScheduledEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct State {
    jobs: HashMap<JobId, Job>,
    queues: BTreeMap<String, VecDeque<JobId>>,
    scheduled: BTreeSet<ScheduledEntry>,
    claims: HashMap<JobId, DateTime<Utc>>,
    /// Dead job ids, oldest death first
    dead: VecDeque<JobId>,
    batches: HashMap<BatchId, BatchRecord>,
    seq: u64,
}

impl State {
    fn insert(&mut self, mut job: Job, now: DateTime<Utc>) {
        match job.scheduled_at {
            Some(at) if at > now => {
                self.push_scheduled(job, at);
            }
            _ => {
                job.scheduled_at = None;
                self.push_ready(job, now);
            }
        }
    }

    fn push_ready(&mut self, mut job: Job, now: DateTime<Utc>) {
        let id = job.id;
        job.state = JobState::Ready;
        job.scheduled_at = None;
        job.lease_until = None;
        job.enqueued_at = Some(now);
        self.queues
            .entry(job.queue.clone())
            .or_default()
            .push_back(id);
        self.jobs.insert(id, job);
    }

    fn push_scheduled(&mut self, mut job: Job, due_at: DateTime<Utc>) {
        self.seq += 1;
        let entry = ScheduledEntry {
            due_at,
            seq: self.seq,
            job_id: job.id,
        };
        job.state = JobState::Scheduled;
        job.scheduled_at = Some(due_at);
        job.lease_until = None;
        self.queues.entry(job.queue.clone()).or_default();
        self.scheduled.insert(entry);
        self.jobs.insert(job.id, job);
    }

    fn ensure_new(&self, jobs: &[Job]) -> QueueResult<()> {
        let mut seen = HashSet::with_capacity(jobs.len());
        for job in jobs {
            if self.jobs.contains_key(&job.id) || !seen.insert(job.id) {
                return Err(QueueError::DuplicateJob(job.id.to_string()));
            }
        }
        Ok(())
    }

    fn release_claim(&mut self, id: JobId) -> QueueResult<()> {
        self.claims
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| QueueError::JobNotFound(format!("{} is not claimed", id)))
    }

    fn take_dead(&mut self, id: JobId) -> Option<Job> {
        let pos = self.dead.iter().position(|d| *d == id)?;
        self.dead.remove(pos);
        self.jobs.remove(&id)
    }

    fn dead_jobs<'a>(&'a self, filter: &'a DeadFilter) -> impl Iterator<Item = &'a Job> + 'a {
        self.dead
            .iter()
            .rev()
            .filter_map(move |id| self.jobs.get(id))
            .filter(move |job| filter.matches(job))
    }
}

/// In-memory job store, optionally snapshotted to disk.
pub struct MemoryStore {
    state: Mutex<State>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    /// Create a volatile store.
    pub fn new() -> Self {
        debug!("Creating in-memory job store");
        Self {
            state: Mutex::new(State::default()),
            path: None,
        }
    }

    /// Open a durable store at `path`, loading the existing snapshot if any.
    pub async fn open(path: impl AsRef<Path>) -> QueueResult<Self> {
        let path = path.as_ref().to_path_buf();

        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<State>(&bytes)
                .map_err(|e| QueueError::Deserialization(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => State::default(),
            Err(e) => return Err(e.into()),
        };

        info!(
            path = %path.display(),
            jobs = state.jobs.len(),
            "Opened durable job store"
        );

        Ok(Self {
            state: Mutex::new(state),
            path: Some(path),
        })
    }

    /// Check whether mutations are persisted.
    pub fn is_durable(&self) -> bool {
        self.path.is_some()
    }

    /// Apply a mutation under the lock.
    ///
    /// A durable store mutates a copy and swaps it in only once the snapshot
    /// is on disk, so a failed write leaves the live state untouched.
    async fn mutate<T>(&self, f: impl FnOnce(&mut State) -> QueueResult<T>) -> QueueResult<T> {
        let mut state = self.state.lock().await;
        let Some(path) = &self.path else {
            return f(&mut state);
        };

        let mut next = state.clone();
        let result = f(&mut next)?;
        persist(path, &next).await?;
        *state = next;
        Ok(result)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn persist(path: &Path, state: &State) -> QueueResult<()> {
    let bytes =
        serde_json::to_vec(state).map_err(|e| QueueError::Serialization(e.to_string()))?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    trace!(path = %path.display(), "Snapshot written");
    Ok(())
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue(&self, job: Job) -> QueueResult<JobId> {
        let id = job.id;
        self.mutate(|state| {
            state.ensure_new(std::slice::from_ref(&job))?;
            state.insert(job, Utc::now());
            Ok(())
        })
        .await?;
        Ok(id)
    }

    async fn enqueue_all(&self, jobs: Vec<Job>) -> QueueResult<Vec<JobId>> {
        let ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
        self.mutate(|state| {
            state.ensure_new(&jobs)?;
            let now = Utc::now();
            for job in jobs {
                state.insert(job, now);
            }
            Ok(())
        })
        .await?;
        Ok(ids)
    }

    async fn dequeue(&self, queue: &str, lease_until: DateTime<Utc>) -> QueueResult<Option<Job>> {
        {
            let state = self.state.lock().await;
            if state.queues.get(queue).is_none_or(|q| q.is_empty()) {
                return Ok(None);
            }
        }

        self.mutate(|state| {
            loop {
                let Some(id) = state.queues.get_mut(queue).and_then(|q| q.pop_front()) else {
                    return Ok(None);
                };
                // Ids of deleted jobs are skipped
                let Some(job) = state.jobs.get_mut(&id) else {
                    continue;
                };
                if job.state != JobState::Ready {
                    continue;
                }
                job.state = JobState::Claimed;
                job.lease_until = Some(lease_until);
                let claimed = job.clone();
                state.claims.insert(id, lease_until);
                return Ok(Some(claimed));
            }
        })
        .await
    }

    async fn remove(&self, id: JobId) -> QueueResult<()> {
        self.mutate(|state| {
            state.release_claim(id)?;
            state.jobs.remove(&id);
            Ok(())
        })
        .await
    }

    async fn schedule(&self, job: Job, due_at: DateTime<Utc>) -> QueueResult<()> {
        self.mutate(|state| {
            state.release_claim(job.id)?;
            state.push_scheduled(job, due_at);
            Ok(())
        })
        .await
    }

    async fn move_to_dead(&self, mut job: Job, died_at: DateTime<Utc>) -> QueueResult<()> {
        self.mutate(|state| {
            state.release_claim(job.id)?;
            job.state = JobState::Dead;
            job.died_at = Some(died_at);
            job.lease_until = None;
            job.scheduled_at = None;
            state.dead.push_back(job.id);
            state.jobs.insert(job.id, job);
            Ok(())
        })
        .await
    }

    async fn requeue_dead(&self, id: JobId) -> QueueResult<Job> {
        self.mutate(|state| {
            let mut job = state
                .take_dead(id)
                .ok_or_else(|| QueueError::JobNotFound(format!("{} is not dead", id)))?;

            if let Some(batch) = job.batch_id.and_then(|b| state.batches.get_mut(&b))
                && batch.revert(id)
            {
                debug!(job_id = %id, batch_id = %batch.id, "Batch outcome reverted");
            }

            job.retry_count = 0;
            job.over_limit_count = 0;
            job.died_at = None;
            state.push_ready(job, Utc::now());
            state
                .jobs
                .get(&id)
                .cloned()
                .ok_or_else(|| QueueError::JobNotFound(id.to_string()))
        })
        .await
    }

    async fn delete_dead(&self, id: JobId) -> QueueResult<bool> {
        self.mutate(|state| Ok(state.take_dead(id).is_some())).await
    }

    async fn list_dead(&self, filter: &DeadFilter) -> QueueResult<Vec<Job>> {
        let state = self.state.lock().await;
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(state.dead_jobs(filter).take(limit).cloned().collect())
    }

    async fn get_dead(&self, id: JobId) -> QueueResult<Option<Job>> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .get(&id)
            .filter(|job| job.state == JobState::Dead)
            .cloned())
    }

    async fn purge_dead(&self, filter: &DeadFilter) -> QueueResult<usize> {
        self.mutate(|state| {
            let doomed: Vec<JobId> = state.dead_jobs(filter).map(|j| j.id).collect();
            for id in &doomed {
                state.take_dead(*id);
            }
            Ok(doomed.len())
        })
        .await
    }

    async fn trim_dead(&self, max_jobs: usize) -> QueueResult<usize> {
        self.mutate(|state| {
            let excess = state.dead.len().saturating_sub(max_jobs);
            let trimmed: Vec<JobId> = state.dead.drain(..excess).collect();
            for id in trimmed {
                state.jobs.remove(&id);
            }
            Ok(excess)
        })
        .await
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> QueueResult<Vec<JobId>> {
        // Read-only fast path keeps the snapshot untouched on idle sweeps
        {
            let state = self.state.lock().await;
            if state.scheduled.first().is_none_or(|e| e.due_at > now) {
                return Ok(Vec::new());
            }
        }

        self.mutate(|state| {
            let mut promoted = Vec::new();
            while let Some(entry) = state.scheduled.first().copied() {
                if entry.due_at > now {
                    break;
                }
                state.scheduled.pop_first();
                if let Some(job) = state.jobs.remove(&entry.job_id) {
                    state.push_ready(job, now);
                    promoted.push(entry.job_id);
                }
            }
            Ok(promoted)
        })
        .await
    }

    async fn heartbeat(&self, id: JobId, lease_until: DateTime<Utc>) -> QueueResult<bool> {
        self.mutate(|state| match state.claims.get_mut(&id) {
            Some(lease) => {
                *lease = lease_until;
                if let Some(job) = state.jobs.get_mut(&id) {
                    job.lease_until = Some(lease_until);
                }
                Ok(true)
            }
            None => Ok(false),
        })
        .await
    }

    async fn reclaim_stale(&self, now: DateTime<Utc>) -> QueueResult<Vec<JobId>> {
        {
            let state = self.state.lock().await;
            if state.claims.values().all(|lease| *lease > now) {
                return Ok(Vec::new());
            }
        }

        self.mutate(|state| {
            let mut stale: Vec<(DateTime<Utc>, JobId)> = state
                .claims
                .iter()
                .filter(|(_, lease)| **lease <= now)
                .map(|(id, lease)| (*lease, *id))
                .collect();
            stale.sort();

            let mut reclaimed = Vec::with_capacity(stale.len());
            for (_, id) in stale {
                state.claims.remove(&id);
                if let Some(job) = state.jobs.remove(&id) {
                    warn!(job_id = %id, queue = %job.queue, "Reclaiming job with expired lease");
                    state.push_ready(job, now);
                    reclaimed.push(id);
                }
            }
            Ok(reclaimed)
        })
        .await
    }

    async fn get_job(&self, id: JobId) -> QueueResult<Option<Job>> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&id).cloned())
    }

    async fn queue_depth(&self, queue: &str) -> QueueResult<usize> {
        let state = self.state.lock().await;
        Ok(state
            .queues
            .get(queue)
            .map(|q| {
                q.iter()
                    .filter(|id| {
                        state
                            .jobs
                            .get(id)
                            .is_some_and(|j| j.state == JobState::Ready)
                    })
                    .count()
            })
            .unwrap_or(0))
    }

    async fn queue_names(&self) -> QueueResult<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state.queues.keys().cloned().collect())
    }

    async fn scheduled_count(&self) -> QueueResult<usize> {
        Ok(self.state.lock().await.scheduled.len())
    }

    async fn dead_count(&self) -> QueueResult<usize> {
        Ok(self.state.lock().await.dead.len())
    }

    async fn create_batch(&self, batch: BatchRecord) -> QueueResult<()> {
        self.mutate(|state| {
            state.batches.insert(batch.id, batch);
            Ok(())
        })
        .await
    }

    async fn get_batch(&self, id: BatchId) -> QueueResult<Option<BatchRecord>> {
        Ok(self.state.lock().await.batches.get(&id).cloned())
    }

    async fn enqueue_batch_members(
        &self,
        batch_id: BatchId,
        jobs: Vec<Job>,
    ) -> QueueResult<Vec<JobId>> {
        self.mutate(|state| {
            state.ensure_new(&jobs)?;
            let batch = state
                .batches
                .get_mut(&batch_id)
                .ok_or_else(|| QueueError::BatchNotFound(batch_id.to_string()))?;
            batch.ensure_open()?;

            let ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
            batch.members.extend(ids.iter().copied());

            let now = Utc::now();
            for job in jobs {
                state.insert(job.in_batch(batch_id), now);
            }
            Ok(ids)
        })
        .await
    }

    async fn record_batch_outcome(
        &self,
        batch_id: BatchId,
        job_id: JobId,
        outcome: MemberOutcome,
    ) -> QueueResult<Option<BatchStatus>> {
        self.mutate(|state| {
            state
                .batches
                .get_mut(&batch_id)
                .ok_or_else(|| QueueError::BatchNotFound(batch_id.to_string()))?
                .record(job_id, outcome, Utc::now())
        })
        .await
    }

    fn store_type(&self) -> &'static str {
        if self.is_durable() { "file" } else { "memory" }
    }
}
