//! Retry policies and failure handling.
//!
//! A failed execution moves the job `failed -> scheduled` (retry) or
//! `failed -> dead`. Nothing sleeps: the retry is a scheduled-set entry that
//! the scheduler promotes when it falls due.

use crate::batch::{BatchCoordinator, MemberOutcome};
use crate::error::{JobError, OVER_LIMIT_CLASS, QueueError, QueueResult};
use crate::job::{DEFAULT_MAX_RETRIES, ErrorRecord, Job, after};
use crate::metrics::QueueMetrics;
use crate::store::JobStore;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Computes the delay before a retry.
pub trait Backoff: Send + Sync {
    /// Delay before retry number `retry_count + 1`
    fn delay(&self, retry_count: u32, error: &JobError) -> Duration;
}

/// `count^4 + 15s` plus up to `10 * (count + 1)` seconds of jitter.
#[derive(Debug, Clone, Copy)]
pub struct PolynomialBackoff {
    /// Add random jitter
    pub jitter: bool,
}

impl Default for PolynomialBackoff {
    fn default() -> Self {
        Self { jitter: true }
    }
}

impl Backoff for PolynomialBackoff {
    fn delay(&self, retry_count: u32, _error: &JobError) -> Duration {
        let count = retry_count as u64;
        let base = count.saturating_pow(4).saturating_add(15);
        let jitter = if self.jitter {
            rand::rng().random_range(0..10u64) * (count + 1)
        } else {
            0
        };
        Duration::from_secs(base.saturating_add(jitter))
    }
}

/// `base * 2^count`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    /// First delay
    pub base: Duration,
    /// Upper bound
    pub max: Duration,
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, retry_count: u32, _error: &JobError) -> Duration {
        let factor = 2u32.saturating_pow(retry_count.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Same delay every time.
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff(pub Duration);

impl Backoff for FixedBackoff {
    fn delay(&self, _retry_count: u32, _error: &JobError) -> Duration {
        self.0
    }
}

/// `(count + 1) * step`.
#[derive(Debug, Clone, Copy)]
pub struct LinearBackoff {
    /// Growth per retry
    pub step: Duration,
}

impl Backoff for LinearBackoff {
    fn delay(&self, retry_count: u32, _error: &JobError) -> Duration {
        self.step.saturating_mul(retry_count.saturating_add(1))
    }
}

/// Backoff computed by a closure.
pub struct FnBackoff<F>(F);

impl<F> Backoff for FnBackoff<F>
where
    F: Fn(u32, &JobError) -> Duration + Send + Sync,
{
    fn delay(&self, retry_count: u32, error: &JobError) -> Duration {
        (self.0)(retry_count, error)
    }
}

/// Wrap a closure as a backoff.
///
/// ```
/// use jobwright_queue::retry::{backoff_fn, Backoff};
/// use jobwright_queue::JobError;
/// use std::time::Duration;
///
/// let linear = backoff_fn(|count, _err| Duration::from_secs(count as u64 + 1));
/// assert_eq!(linear.delay(2, &JobError::failed("Io", "x")), Duration::from_secs(3));
/// ```
pub fn backoff_fn<F>(f: F) -> FnBackoff<F>
where
    F: Fn(u32, &JobError) -> Duration + Send + Sync,
{
    FnBackoff(f)
}

/// Retry policy for a job type.
///
/// Immutable once attached to a handler. The per-class table takes
/// precedence over the default backoff.
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Arc<dyn Backoff>,
    by_class: HashMap<String, Arc<dyn Backoff>>,
}

impl RetryPolicy {
    /// Policy with `max_retries` and the polynomial backoff
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Arc::new(PolynomialBackoff::default()),
            by_class: HashMap::new(),
        }
    }

    /// Replace the default backoff
    pub fn with_backoff(mut self, backoff: impl Backoff + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Use a different backoff for one error class
    pub fn on_class(mut self, class: impl Into<String>, backoff: impl Backoff + 'static) -> Self {
        self.by_class.insert(class.into(), Arc::new(backoff));
        self
    }

    /// Retries allowed
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before the next retry
    pub fn delay(&self, retry_count: u32, error: &JobError) -> Duration {
        self.by_class
            .get(error.class())
            .unwrap_or(&self.backoff)
            .delay(retry_count, error)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut classes: Vec<&String> = self.by_class.keys().collect();
        classes.sort();
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("classes", &classes)
            .finish()
    }
}

/// Where a job went after execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Succeeded and removed
    Completed,
    /// Handler asked to run again later
    Snoozed {
        /// When it runs again
        until: DateTime<Utc>,
    },
    /// Transient failure, retry scheduled
    Retried {
        /// When the retry runs
        at: DateTime<Utc>,
        /// Retries consumed including this one
        retry_count: u32,
    },
    /// Refused by a limiter, rescheduled without consuming a retry
    Rescheduled {
        /// When it runs again
        at: DateTime<Utc>,
    },
    /// Moved to the dead set
    Dead,
}

/// Over-limit and dead-set settings for the failure path.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay before rerunning a job refused by a limiter
    pub over_limit_backoff: Duration,
    /// Consecutive limiter refusals before counting as a failure
    pub max_over_limit_reschedules: u32,
    /// Dead jobs kept before the oldest are trimmed
    pub dead_max_jobs: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            over_limit_backoff: Duration::from_secs(30),
            max_over_limit_reschedules: 20,
            dead_max_jobs: Some(10_000),
        }
    }
}

/// Settles executed jobs: acknowledge, snooze, retry, reschedule or bury.
#[derive(Clone)]
pub struct RetryManager {
    store: Arc<dyn JobStore>,
    batches: BatchCoordinator,
    metrics: Arc<QueueMetrics>,
    config: RetryConfig,
}

impl RetryManager {
    /// Create a manager
    pub fn new(
        store: Arc<dyn JobStore>,
        batches: BatchCoordinator,
        metrics: Arc<QueueMetrics>,
        config: RetryConfig,
    ) -> Self {
        Self {
            store,
            batches,
            metrics,
            config,
        }
    }

    /// Acknowledge a successful job.
    pub async fn complete(&self, job: Job) -> QueueResult<Outcome> {
        if let Some(batch_id) = job.batch_id {
            self.batches
                .record(batch_id, job.id, MemberOutcome::Completed)
                .await?;
        }

        match self.store.remove(job.id).await {
            Ok(()) => {}
            // Lease expired mid-run and another slot owns the job now
            Err(QueueError::JobNotFound(_)) => {
                warn!(job_id = %job.id, "Completed job was no longer claimed");
            }
            Err(e) => return Err(e),
        }

        self.metrics.succeeded(&job.queue);
        debug!(job_id = %job.id, queue = %job.queue, "Job completed");
        Ok(Outcome::Completed)
    }

    /// Put a job back to run after `delay` without touching its retry budget.
    pub async fn snooze(
        &self,
        job: Job,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Outcome> {
        let until = after(now, delay);
        debug!(job_id = %job.id, until = %until, "Job snoozed");
        let queue = job.queue.clone();
        self.store.schedule(job, until).await?;
        self.metrics.rescheduled(&queue);
        Ok(Outcome::Snoozed { until })
    }

    /// Handle a failed execution.
    pub async fn fail(
        &self,
        mut job: Job,
        error: JobError,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> QueueResult<Outcome> {
        let error = match error {
            JobError::OverLimit { limiter }
                if job.over_limit_count < self.config.max_over_limit_reschedules =>
            {
                return self.reschedule_over_limit(job, &limiter, now).await;
            }
            JobError::OverLimit { limiter } => {
                warn!(
                    job_id = %job.id,
                    limiter = %limiter,
                    reschedules = job.over_limit_count,
                    "Limiter refused job too many times, counting as failure"
                );
                JobError::failed(
                    OVER_LIMIT_CLASS,
                    format!(
                        "limiter '{}' refused {} consecutive runs",
                        limiter, job.over_limit_count
                    ),
                )
            }
            other => other,
        };

        job.over_limit_count = 0;
        job.record_error(ErrorRecord {
            class: error.class().to_string(),
            message: error.message(),
            backtrace: error.backtrace().map(str::to_string),
            at: now,
        });
        self.metrics.failed(&job.queue);

        if error.is_permanent() {
            error!(
                job_id = %job.id,
                job_type = %job.job_type,
                error = %error,
                "Job failed permanently"
            );
            return self.bury(job, now).await;
        }

        if !job.can_retry() {
            error!(
                job_id = %job.id,
                job_type = %job.job_type,
                retries = job.retry_count,
                error = %error,
                "Job exhausted its retries"
            );
            return self.bury(job, now).await;
        }

        let delay = policy.delay(job.retry_count, &error);
        let at = after(now, delay);
        job.retry_count += 1;
        let retry_count = job.retry_count;

        error!(
            job_id = %job.id,
            job_type = %job.job_type,
            retry_count = retry_count,
            retry_at = %at,
            error = %error,
            "Job failed, retry scheduled"
        );
        self.store.schedule(job, at).await?;
        Ok(Outcome::Retried { at, retry_count })
    }

    async fn reschedule_over_limit(
        &self,
        mut job: Job,
        limiter: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<Outcome> {
        job.over_limit_count += 1;

        let base = self.config.over_limit_backoff;
        let jitter_ms = (base.as_millis() as u64) / 2;
        let jitter = Duration::from_millis(rand::rng().random_range(0..=jitter_ms));
        let at = after(now, base + jitter);

        debug!(
            job_id = %job.id,
            limiter = %limiter,
            reschedules = job.over_limit_count,
            at = %at,
            "Job over limit, rescheduled"
        );

        let queue = job.queue.clone();
        self.store.schedule(job, at).await?;
        self.metrics.rescheduled(&queue);
        Ok(Outcome::Rescheduled { at })
    }

    async fn bury(&self, job: Job, now: DateTime<Utc>) -> QueueResult<Outcome> {
        let id = job.id;
        let queue = job.queue.clone();
        let batch_id = job.batch_id;

        self.store.move_to_dead(job, now).await?;
        self.metrics.dead(&queue);

        if let Some(batch_id) = batch_id {
            self.batches
                .record(batch_id, id, MemberOutcome::Dead)
                .await?;
        }

        // The job is already dead; an oversized dead set is trimmed next time
        if let Some(max) = self.config.dead_max_jobs {
            match self.store.trim_dead(max).await {
                Ok(0) => {}
                Ok(trimmed) => info!(trimmed = trimmed, max = max, "Trimmed oldest dead jobs"),
                Err(e) => warn!(error = %e, max = max, "Failed to trim dead set"),
            }
        }

        Ok(Outcome::Dead)
    }
}
