//! Job handlers and their registry.

use crate::batch::BatchId;
use crate::error::JobError;
use crate::job::{Job, JobId};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// How a handler finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Work is done
    Done,
    /// Run again after the delay without consuming a retry
    Snooze(Duration),
}

/// What a handler knows about the execution besides the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    /// Job id
    pub job_id: JobId,
    /// Attempt number, starting at 1
    pub attempt: u32,
    /// Queue the job was taken from
    pub queue: String,
    /// Owning batch
    pub batch_id: Option<BatchId>,
    /// When the job last entered its ready queue
    pub enqueued_at: Option<DateTime<Utc>>,
}

impl JobContext {
    /// Context for executing `job`
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            attempt: job.attempt(),
            queue: job.queue.clone(),
            batch_id: job.batch_id,
            enqueued_at: job.enqueued_at,
        }
    }
}

/// Job handler function type.
pub type JobHandler =
    Arc<dyn Fn(Job, JobContext) -> BoxFuture<'static, Result<Completion, JobError>> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    handler: JobHandler,
    policy: Arc<RetryPolicy>,
}

/// Handlers by job type, each with its retry policy.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<DashMap<String, Registration>>,
    default_policy: Arc<RetryPolicy>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry whose unregistered types use `policy`
    pub fn with_default_policy(policy: RetryPolicy) -> Self {
        Self {
            handlers: Arc::new(DashMap::new()),
            default_policy: Arc::new(policy),
        }
    }

    /// Register a handler for a job type, replacing any previous one.
    ///
    /// ```
    /// use jobwright_queue::{Completion, HandlerRegistry, JobError, RetryPolicy};
    ///
    /// let handlers = HandlerRegistry::new();
    /// handlers.register("send_email", RetryPolicy::new(5), |job, _ctx| async move {
    ///     let _to = job.payload["to"].as_str().ok_or_else(|| {
    ///         JobError::permanent("BadPayload", "missing recipient")
    ///     })?;
    ///     Ok::<_, JobError>(Completion::Done)
    /// });
    /// assert!(handlers.contains("send_email"));
    /// ```
    pub fn register<F, Fut>(&self, job_type: impl Into<String>, policy: RetryPolicy, handler: F)
    where
        F: Fn(Job, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Completion, JobError>> + Send + 'static,
    {
        let job_type = job_type.into();
        let handler: JobHandler = Arc::new(
            move |job: Job, ctx: JobContext| -> BoxFuture<'static, Result<Completion, JobError>> {
                Box::pin(handler(job, ctx))
            },
        );
        debug!(job_type = %job_type, max_retries = policy.max_retries(), "Registered handler");
        self.handlers.insert(
            job_type,
            Registration {
                handler,
                policy: Arc::new(policy),
            },
        );
    }

    /// Handler for a job type
    pub fn handler(&self, job_type: &str) -> Option<JobHandler> {
        self.handlers.get(job_type).map(|r| r.handler.clone())
    }

    /// Retry policy for a job type, falling back to the default
    pub fn policy_for(&self, job_type: &str) -> Arc<RetryPolicy> {
        self.handlers
            .get(job_type)
            .map(|r| r.policy.clone())
            .unwrap_or_else(|| self.default_policy.clone())
    }

    /// Check whether a job type has a handler
    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, sorted
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_invoke() {
        let handlers = HandlerRegistry::new();
        handlers.register("echo", RetryPolicy::new(2), |job, ctx| async move {
            assert_eq!(ctx.job_id, job.id);
            Ok(Completion::Snooze(Duration::from_secs(1)))
        });

        let job = Job::new("default", "echo", serde_json::json!({}));
        let ctx = JobContext::for_job(&job);
        let handler = handlers.handler("echo").unwrap();

        assert_eq!(
            handler(job, ctx).await.unwrap(),
            Completion::Snooze(Duration::from_secs(1))
        );
        assert_eq!(handlers.policy_for("echo").max_retries(), 2);
    }

    #[test]
    fn test_unknown_type_uses_default_policy() {
        let handlers = HandlerRegistry::with_default_policy(RetryPolicy::new(7));
        assert!(handlers.handler("missing").is_none());
        assert_eq!(handlers.policy_for("missing").max_retries(), 7);
    }

    #[test]
    fn test_context_attempt_starts_at_one() {
        let mut job = Job::new("q", "t", serde_json::json!({}));
        assert_eq!(JobContext::for_job(&job).attempt, 1);
        job.retry_count = 2;
        assert_eq!(JobContext::for_job(&job).attempt, 3);
    }
}
