//! Enqueue API.

use crate::batch::BatchId;
use crate::error::{QueueError, QueueResult};
use crate::handler::HandlerRegistry;
use crate::job::{Job, JobData, JobId};
use crate::metrics::QueueMetrics;
use crate::store::JobStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Options for a single enqueue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Run after this delay
    pub delay: Option<Duration>,
    /// Run at this time (wins over `delay`)
    pub run_at: Option<DateTime<Utc>>,
    /// Override the job type's retry budget
    pub max_retries: Option<u32>,
    /// Add the job to an open batch
    pub batch_id: Option<BatchId>,
}

impl EnqueueOptions {
    /// Run immediately with the job type's defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Run after a delay
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Run at a point in time
    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    /// Override max retries
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Add to a batch
    pub fn batch(mut self, batch_id: BatchId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }
}

/// Producer-side handle for enqueueing jobs.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn JobStore>,
    handlers: HandlerRegistry,
    metrics: Arc<QueueMetrics>,
    work: Arc<Notify>,
}

impl Client {
    /// Create a client
    pub fn new(
        store: Arc<dyn JobStore>,
        handlers: HandlerRegistry,
        metrics: Arc<QueueMetrics>,
        work: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            handlers,
            metrics,
            work,
        }
    }

    /// Build a job the way `enqueue` would, without storing it.
    pub fn build_job(
        &self,
        queue: impl Into<String>,
        job_type: impl Into<String>,
        payload: JobData,
        options: &EnqueueOptions,
    ) -> Job {
        let job_type = job_type.into();
        let max_retries = options
            .max_retries
            .unwrap_or_else(|| self.handlers.policy_for(&job_type).max_retries());

        let mut job = Job::new(queue, job_type, payload).with_max_retries(max_retries);
        if let Some(at) = options.run_at {
            job = job.schedule_at(at);
        } else if let Some(delay) = options.delay {
            job = job.schedule_after(delay);
        }
        if let Some(batch_id) = options.batch_id {
            job = job.in_batch(batch_id);
        }
        job
    }

    /// Enqueue a job.
    ///
    /// The id is returned only after the store has accepted the job.
    pub async fn enqueue(
        &self,
        queue: impl Into<String>,
        job_type: impl Into<String>,
        payload: JobData,
        options: EnqueueOptions,
    ) -> QueueResult<JobId> {
        let job = self.build_job(queue, job_type, payload, &options);
        self.enqueue_job(job).await
    }

    /// Enqueue a prepared job. Jobs carrying a batch id join that batch.
    pub async fn enqueue_job(&self, job: Job) -> QueueResult<JobId> {
        let id = job.id;
        let queue = job.queue.clone();
        let delayed = !job.is_due(Utc::now());

        match job.batch_id {
            Some(batch_id) => {
                self.store.enqueue_batch_members(batch_id, vec![job]).await?;
            }
            None => {
                self.store.enqueue(job).await?;
            }
        }

        self.metrics.enqueued(&queue);
        debug!(job_id = %id, queue = %queue, delayed = delayed, "Job enqueued");
        if !delayed {
            self.work.notify_waiters();
        }
        Ok(id)
    }

    /// Enqueue several prepared jobs, all or none. Jobs must not carry batch ids.
    pub async fn enqueue_all(&self, jobs: Vec<Job>) -> QueueResult<Vec<JobId>> {
        if jobs.iter().any(|j| j.batch_id.is_some()) {
            return Err(QueueError::InvalidBatch(
                "use the batch coordinator to add batch members".to_string(),
            ));
        }

        let queues: Vec<String> = jobs.iter().map(|j| j.queue.clone()).collect();
        let ids = self.store.enqueue_all(jobs).await?;
        for queue in &queues {
            self.metrics.enqueued(queue);
        }
        debug!(count = ids.len(), "Jobs enqueued");
        self.work.notify_waiters();
        Ok(ids)
    }

    /// Ready jobs in a queue
    pub async fn queue_depth(&self, queue: &str) -> QueueResult<usize> {
        self.store.queue_depth(queue).await
    }

    /// A job by id, wherever it lives
    pub async fn get_job(&self, id: JobId) -> QueueResult<Option<Job>> {
        self.store.get_job(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{DEFAULT_MAX_RETRIES, JobState};
    use crate::retry::RetryPolicy;
    use crate::store::MemoryStore;

    fn client() -> (Client, HandlerRegistry) {
        let handlers = HandlerRegistry::new();
        let client = Client::new(
            Arc::new(MemoryStore::new()),
            handlers.clone(),
            Arc::new(QueueMetrics::new().unwrap()),
            Arc::new(Notify::new()),
        );
        (client, handlers)
    }

    #[tokio::test]
    async fn test_enqueue_uses_policy_retries() {
        let (client, handlers) = client();
        handlers.register("mail", RetryPolicy::new(3), |_, _| async {
            Ok(crate::handler::Completion::Done)
        });

        let id = client
            .enqueue("default", "mail", serde_json::json!({}), EnqueueOptions::new())
            .await
            .unwrap();
        let job = client.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.state, JobState::Ready);

        let other = client
            .enqueue("default", "unknown", serde_json::json!({}), EnqueueOptions::new())
            .await
            .unwrap();
        let job = client.get_job(other).await.unwrap().unwrap();
        assert_eq!(job.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[tokio::test]
    async fn test_delayed_enqueue_is_scheduled() {
        let (client, _) = client();
        let id = client
            .enqueue(
                "default",
                "report",
                serde_json::json!({}),
                EnqueueOptions::new().delay(Duration::from_secs(60)).max_retries(1),
            )
            .await
            .unwrap();

        let job = client.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(job.max_retries, 1);
        assert_eq!(client.queue_depth("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_batch_rejected() {
        let (client, _) = client();
        let result = client
            .enqueue(
                "default",
                "task",
                serde_json::json!({}),
                EnqueueOptions::new().batch(uuid::Uuid::new_v4()),
            )
            .await;
        assert!(matches!(result, Err(QueueError::BatchNotFound(_))));
    }
}
