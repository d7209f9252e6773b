//! Job record and state.

use crate::batch::BatchId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Job unique identifier.
pub type JobId = Uuid;

/// Job payload.
pub type JobData = serde_json::Value;

/// Retries allowed when neither the job type nor the enqueue call says otherwise.
pub const DEFAULT_MAX_RETRIES: u32 = 25;

/// Failures kept in a job's error history.
pub const MAX_ERROR_HISTORY: usize = 10;

/// Where a job currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// In a ready queue
    #[default]
    Ready,
    /// Waiting in the scheduled set
    Scheduled,
    /// Claimed by a worker slot
    Claimed,
    /// In the dead set
    Dead,
}

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Error class
    pub class: String,
    /// Error message
    pub message: String,
    /// Backtrace, if captured
    pub backtrace: Option<String>,
    /// When the failure happened
    pub at: DateTime<Utc>,
}

/// A unit of background work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub id: JobId,

    /// Queue name
    pub queue: String,

    /// Handler name
    pub job_type: String,

    /// Opaque payload
    pub payload: JobData,

    /// Current location
    #[serde(default)]
    pub state: JobState,

    /// When the job was created
    pub created_at: DateTime<Utc>,

    /// When the job should run (`None` = now)
    pub scheduled_at: Option<DateTime<Utc>>,

    /// When the job last entered a ready queue
    pub enqueued_at: Option<DateTime<Utc>>,

    /// Retries consumed so far
    pub retry_count: u32,

    /// Retries allowed
    pub max_retries: u32,

    /// Most recent failure
    pub last_error: Option<ErrorRecord>,

    /// Most recent failures, oldest first
    #[serde(default)]
    pub error_history: Vec<ErrorRecord>,

    /// When the most recent failure happened
    pub failed_at: Option<DateTime<Utc>>,

    /// Owning batch
    pub batch_id: Option<BatchId>,

    /// Consecutive limiter reschedules
    #[serde(default)]
    pub over_limit_count: u32,

    /// Claim deadline while a slot holds the job
    pub lease_until: Option<DateTime<Utc>>,

    /// When the job entered the dead set
    pub died_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new job.
    pub fn new(queue: impl Into<String>, job_type: impl Into<String>, payload: JobData) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: queue.into(),
            job_type: job_type.into(),
            payload,
            state: JobState::Ready,
            created_at: Utc::now(),
            scheduled_at: None,
            enqueued_at: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_error: None,
            error_history: Vec::new(),
            failed_at: None,
            batch_id: None,
            over_limit_count: 0,
            lease_until: None,
            died_at: None,
        }
    }

    /// Set max retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Schedule the job for a point in time.
    pub fn schedule_at(mut self, time: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(time);
        self
    }

    /// Schedule the job after a delay.
    pub fn schedule_after(mut self, delay: Duration) -> Self {
        self.scheduled_at = Some(after(Utc::now(), delay));
        self
    }

    /// Attach the job to a batch.
    pub fn in_batch(mut self, batch_id: BatchId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    /// Check if the job may run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_none_or(|at| at <= now)
    }

    /// Check if another retry is allowed.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Attempt number of the next execution, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    /// Record a failure, keeping the history bounded.
    pub fn record_error(&mut self, record: ErrorRecord) {
        self.failed_at = Some(record.at);
        self.error_history.push(record.clone());
        if self.error_history.len() > MAX_ERROR_HISTORY {
            let excess = self.error_history.len() - MAX_ERROR_HISTORY;
            self.error_history.drain(..excess);
        }
        self.last_error = Some(record);
    }

    /// Class of the most recent failure.
    pub fn error_class(&self) -> Option<&str> {
        self.last_error.as_ref().map(|e| e.class.as_str())
    }
}

/// `now + delay`, saturating far in the future.
pub fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: usize) -> ErrorRecord {
        ErrorRecord {
            class: "Io".to_string(),
            message: format!("error {}", n),
            backtrace: None,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_job_creation() {
        let job = Job::new(
            "default",
            "send_email",
            serde_json::json!({"to": "test@example.com"}),
        );

        assert_eq!(job.queue, "default");
        assert_eq!(job.job_type, "send_email");
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(job.state, JobState::Ready);
        assert_eq!(job.attempt(), 1);
    }

    #[test]
    fn test_job_due() {
        let now = Utc::now();
        let job = Job::new("default", "task", serde_json::json!({}));
        assert!(job.is_due(now));

        let later = job.schedule_at(now + chrono::Duration::hours(1));
        assert!(!later.is_due(now));
        assert!(later.is_due(now + chrono::Duration::hours(2)));
    }

    #[test]
    fn test_schedule_after() {
        let job = Job::new("default", "task", serde_json::json!({}))
            .schedule_after(Duration::from_secs(60));
        assert!(!job.is_due(Utc::now()));
    }

    #[test]
    fn test_retry_budget() {
        let mut job = Job::new("default", "task", serde_json::json!({})).with_max_retries(2);
        assert!(job.can_retry());
        job.retry_count = 2;
        assert!(!job.can_retry());

        let none = Job::new("default", "task", serde_json::json!({})).with_max_retries(0);
        assert!(!none.can_retry());
    }

    #[test]
    fn test_error_history_is_bounded() {
        let mut job = Job::new("default", "task", serde_json::json!({}));
        for n in 0..15 {
            job.record_error(record(n));
        }

        assert_eq!(job.error_history.len(), MAX_ERROR_HISTORY);
        assert_eq!(job.error_history[0].message, "error 5");
        assert_eq!(job.last_error.as_ref().unwrap().message, "error 14");
        assert_eq!(job.error_class(), Some("Io"));
        assert!(job.failed_at.is_some());
    }

    #[test]
    fn test_job_id_uniqueness() {
        let job1 = Job::new("default", "task", serde_json::json!({}));
        let job2 = Job::new("default", "task", serde_json::json!({}));

        assert_ne!(job1.id, job2.id);
    }

    #[test]
    fn test_job_roundtrips_through_json() {
        let batch = Uuid::new_v4();
        let job = Job::new("mail", "welcome", serde_json::json!({"user": 7})).in_batch(batch);

        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();

        assert_eq!(back.id, job.id);
        assert_eq!(back.batch_id, Some(batch));
        assert_eq!(back.payload, job.payload);
    }

    #[test]
    fn test_after_saturates() {
        let now = Utc::now();
        assert_eq!(after(now, Duration::from_secs(1)), now + chrono::Duration::seconds(1));
        assert_eq!(after(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
