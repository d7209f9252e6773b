//! Worker pool: a fixed set of slots pulling jobs from weighted queues.

use crate::error::{ConfigError, JobError, NO_HANDLER_CLASS, QueueError, QueueResult};
use crate::handler::{Completion, HandlerRegistry, JobContext};
use crate::job::{Job, JobId, after};
use crate::metrics::QueueMetrics;
use crate::retry::{Outcome, RetryManager};
use crate::store::JobStore;
use chrono::Utc;
use futures::FutureExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// How slots pick the next queue to pull from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueSelection {
    /// Declared order: a later queue is polled only when earlier ones are empty
    Strict,
    /// Random order on every fetch, proportional to weights
    #[default]
    Weighted,
}

/// A queue a pool pulls from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueWeight {
    /// Queue name
    pub name: String,
    /// Relative weight (weighted selection only)
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl QueueWeight {
    /// Queue with a weight
    pub fn new(name: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of slots
    pub concurrency: usize,

    /// Queues to pull from
    pub queues: Vec<QueueWeight>,

    /// Queue selection mode
    pub selection: QueueSelection,

    /// Longest an idle slot waits before polling again
    pub poll_interval: Duration,

    /// Claim lease granted on dequeue and on each heartbeat
    pub lease_timeout: Duration,

    /// How often a running job's lease is extended
    pub heartbeat_interval: Duration,

    /// Timeout for job execution
    pub job_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            queues: vec![QueueWeight::new("default", 1)],
            selection: QueueSelection::Weighted,
            poll_interval: Duration::from_secs(1),
            lease_timeout: Duration::from_secs(180),
            heartbeat_interval: Duration::from_secs(60),
            job_timeout: Duration::from_secs(300), // 5 minutes
        }
    }
}

impl WorkerConfig {
    /// Check the configuration is usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.queues.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one queue is required".to_string(),
            ));
        }
        if let Some(q) = self.queues.iter().find(|q| q.weight == 0) {
            return Err(ConfigError::ValidationError(format!(
                "queue '{}' has weight 0",
                q.name
            )));
        }
        if self.heartbeat_interval >= self.lease_timeout {
            return Err(ConfigError::ValidationError(
                "heartbeat interval must be shorter than the lease timeout".to_string(),
            ));
        }
        Ok(())
    }
}

/// Queue names in the order to poll them for one fetch.
pub fn queue_order(queues: &[QueueWeight], selection: QueueSelection) -> Vec<&str> {
    match selection {
        QueueSelection::Strict => queues.iter().map(|q| q.name.as_str()).collect(),
        QueueSelection::Weighted => {
            let mut rng = rand::rng();
            let mut remaining: Vec<&QueueWeight> = queues.iter().collect();
            let mut order = Vec::with_capacity(queues.len());

            while !remaining.is_empty() {
                let total: u64 = remaining.iter().map(|q| q.weight.max(1) as u64).sum();
                let mut pick = rng.random_range(0..total);
                let idx = remaining
                    .iter()
                    .position(|q| {
                        let w = q.weight.max(1) as u64;
                        if pick < w {
                            true
                        } else {
                            pick -= w;
                            false
                        }
                    })
                    .unwrap_or(0);
                order.push(remaining.remove(idx).name.as_str());
            }
            order
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Fetches and runs jobs. Shared by every slot.
#[derive(Clone)]
struct Executor {
    store: Arc<dyn JobStore>,
    handlers: HandlerRegistry,
    retry: RetryManager,
    metrics: Arc<QueueMetrics>,
    config: WorkerConfig,
}

impl Executor {
    async fn fetch(&self) -> QueueResult<Option<Job>> {
        for queue in queue_order(&self.config.queues, self.config.selection) {
            if let Some(job) = self.claim(queue).await? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    async fn claim(&self, queue: &str) -> QueueResult<Option<Job>> {
        let lease_until = after(Utc::now(), self.config.lease_timeout);
        self.store.dequeue(queue, lease_until).await
    }

    fn spawn_heartbeat(&self, id: JobId) -> JoinHandle<()> {
        let store = self.store.clone();
        let interval = self.config.heartbeat_interval;
        let lease = self.config.lease_timeout;

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                ticker.tick().await;
                match store.heartbeat(id, after(Utc::now(), lease)).await {
                    Ok(true) => trace!(job_id = %id, "Lease extended"),
                    Ok(false) => {
                        warn!(job_id = %id, "Claim lost while job was running");
                        return;
                    }
                    Err(e) => warn!(job_id = %id, error = %e, "Heartbeat failed"),
                }
            }
        })
    }

    async fn execute(&self, job: Job) -> QueueResult<Outcome> {
        let policy = self.handlers.policy_for(&job.job_type);

        let Some(handler) = self.handlers.handler(&job.job_type) else {
            let err = JobError::permanent(
                NO_HANDLER_CLASS,
                format!("no handler registered for job type '{}'", job.job_type),
            );
            return self.retry.fail(job, err, &policy, Utc::now()).await;
        };

        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempt(),
            "Processing job"
        );

        let ctx = JobContext::for_job(&job);
        let heartbeat = self.spawn_heartbeat(job.id);
        let started = Instant::now();

        let result = tokio::time::timeout(
            self.config.job_timeout,
            AssertUnwindSafe(handler(job.clone(), ctx)).catch_unwind(),
        )
        .await;

        heartbeat.abort();
        self.metrics.observe_duration(&job.queue, started.elapsed());

        let now = Utc::now();
        match result {
            Ok(Ok(Ok(Completion::Done))) => self.retry.complete(job).await,
            Ok(Ok(Ok(Completion::Snooze(delay)))) => self.retry.snooze(job, delay, now).await,
            Ok(Ok(Err(err))) => self.retry.fail(job, err, &policy, now).await,
            Ok(Err(panic)) => {
                let err = JobError::panic(panic_message(panic.as_ref()));
                self.retry.fail(job, err, &policy, now).await
            }
            Err(_) => {
                let err = JobError::timeout(self.config.job_timeout);
                self.retry.fail(job, err, &policy, now).await
            }
        }
    }
}

/// Pool of worker slots.
pub struct WorkerPool {
    executor: Executor,
    work: Arc<Notify>,
    running: Arc<RwLock<bool>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Create a pool. `work` is the signal fired when jobs become ready.
    pub fn new(
        store: Arc<dyn JobStore>,
        handlers: HandlerRegistry,
        retry: RetryManager,
        metrics: Arc<QueueMetrics>,
        work: Arc<Notify>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            executor: Executor {
                store,
                handlers,
                retry,
                metrics,
                config,
            },
            work,
            running: Arc::new(RwLock::new(false)),
            handles: Vec::new(),
        }
    }

    /// Pool configuration
    pub fn config(&self) -> &WorkerConfig {
        &self.executor.config
    }

    /// Start the slots.
    pub async fn start(&mut self) -> QueueResult<()> {
        self.executor.config.validate()?;

        let mut running = self.running.write().await;
        if *running {
            return Err(QueueError::WorkerAlreadyRunning);
        }
        *running = true;
        drop(running);

        let config = &self.executor.config;
        info!(
            concurrency = config.concurrency,
            queues = ?config.queues.iter().map(|q| q.name.as_str()).collect::<Vec<_>>(),
            selection = ?config.selection,
            "Worker pool starting"
        );

        for slot in 0..config.concurrency {
            let executor = self.executor.clone();
            let work = self.work.clone();
            let running = self.running.clone();
            let poll_interval = config.poll_interval;

            self.handles.push(tokio::spawn(async move {
                while *running.read().await {
                    // Registered before the fetch so a signal sent in between is kept
                    let notified = work.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    match executor.fetch().await {
                        Ok(Some(job)) => {
                            let job_id = job.id;
                            if let Err(e) = executor.execute(job).await {
                                error!(slot = slot, job_id = %job_id, error = %e, "Failed to settle job");
                                tokio::time::sleep(poll_interval).await;
                            }
                        }
                        Ok(None) => {
                            tokio::select! {
                                _ = &mut notified => {}
                                _ = tokio::time::sleep(poll_interval) => {}
                            }
                        }
                        Err(e) => {
                            error!(slot = slot, error = %e, "Error dequeuing job");
                            tokio::time::sleep(poll_interval).await;
                        }
                    }
                }
                debug!(slot = slot, "Worker slot stopped");
            }));
        }

        Ok(())
    }

    /// Stop the pool. Slots finish their current job before exiting.
    pub async fn stop(&mut self) -> QueueResult<()> {
        let mut running = self.running.write().await;
        if !*running {
            return Err(QueueError::WorkerNotRunning);
        }
        *running = false;
        drop(running);

        info!("Worker pool stopping");
        self.work.notify_waiters();

        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker slot ended abnormally");
            }
        }

        info!("Worker pool stopped");
        Ok(())
    }

    /// Check if the pool is running.
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Claim and run one job from `queue`, if any is ready.
    pub async fn process_one(&self, queue: &str) -> QueueResult<Option<Outcome>> {
        match self.executor.claim(queue).await? {
            Some(job) => self.executor.execute(job).await.map(Some),
            None => Ok(None),
        }
    }
}
