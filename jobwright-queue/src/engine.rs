//! Engine: store, limiters, scheduler, worker pool, batches and metrics
//! assembled from one [`EngineConfig`].

use crate::batch::BatchCoordinator;
use crate::client::{Client, EnqueueOptions};
use crate::config::{EngineConfig, StoreConfig};
use crate::dead::DeadSet;
use crate::error::{ConfigError, JobError, QueueResult};
use crate::handler::{Completion, HandlerRegistry, JobContext};
use crate::job::{Job, JobData, JobId};
use crate::metrics::QueueMetrics;
use crate::retry::{Outcome, RetryManager, RetryPolicy};
use crate::scheduler::{Scheduler, SweepReport};
use crate::store::{JobStore, MemoryStore};
use crate::worker::WorkerPool;
use jobwright_ratelimit::LimiterRegistry;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

/// A complete job processing engine.
///
/// ```no_run
/// use jobwright_queue::{Completion, Engine, EngineConfig, EnqueueOptions};
///
/// # async fn example() -> jobwright_queue::QueueResult<()> {
/// let mut engine = Engine::from_config(EngineConfig::default()).await?;
/// engine.register("send_email", |job, _ctx| async move {
///     println!("sending {}", job.payload);
///     Ok(Completion::Done)
/// });
///
/// engine.start().await?;
/// engine
///     .enqueue("default", "send_email", serde_json::json!({"to": "a@b.c"}), EnqueueOptions::new())
///     .await?;
/// engine.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn JobStore>,
    limiters: LimiterRegistry,
    handlers: HandlerRegistry,
    client: Client,
    batches: BatchCoordinator,
    dead: DeadSet,
    metrics: Arc<QueueMetrics>,
    scheduler: Scheduler,
    pool: WorkerPool,
}

impl Engine {
    /// Build an engine, opening the configured store.
    pub async fn from_config(config: EngineConfig) -> QueueResult<Self> {
        config.validate()?;

        let (store, limiters): (Arc<dyn JobStore>, LimiterRegistry) = match &config.store {
            StoreConfig::Memory => (Arc::new(MemoryStore::new()), LimiterRegistry::memory()),
            StoreConfig::File { path } => {
                (Arc::new(MemoryStore::open(path).await?), LimiterRegistry::memory())
            }
            #[cfg(feature = "redis")]
            StoreConfig::Redis { url, prefix } => {
                let jobs = crate::store::RedisStore::with_prefix(url, prefix.clone()).await?;
                let counters = jobwright_ratelimit::RedisStore::with_prefix(
                    url,
                    format!("{}:limiter", prefix),
                )
                .await?;
                (Arc::new(jobs), LimiterRegistry::new(Arc::new(counters)))
            }
            #[cfg(not(feature = "redis"))]
            StoreConfig::Redis { .. } => {
                return Err(ConfigError::ValidationError(
                    "redis store requires the `redis` feature".to_string(),
                )
                .into());
            }
        };

        Self::with_parts(config, store, limiters)
    }

    /// In-memory engine with default settings.
    pub fn memory() -> QueueResult<Self> {
        Self::with_parts(
            EngineConfig::default(),
            Arc::new(MemoryStore::new()),
            LimiterRegistry::memory(),
        )
    }

    /// Build an engine over an existing store and limiter registry.
    pub fn with_parts(
        config: EngineConfig,
        store: Arc<dyn JobStore>,
        limiters: LimiterRegistry,
    ) -> QueueResult<Self> {
        config.validate()?;

        for def in config.limiter_defs()? {
            limiters.register(def)?;
        }

        let work = Arc::new(Notify::new());
        let metrics = Arc::new(QueueMetrics::new()?);
        let handlers = HandlerRegistry::with_default_policy(config.default_policy());
        let batches = BatchCoordinator::new(store.clone(), work.clone());
        let retry = RetryManager::new(
            store.clone(),
            batches.clone(),
            metrics.clone(),
            config.retry_config(),
        );
        let client = Client::new(store.clone(), handlers.clone(), metrics.clone(), work.clone());
        let dead = DeadSet::new(store.clone(), work.clone());
        let scheduler = Scheduler::new(store.clone(), work.clone())
            .with_poll_interval(config.scheduler_interval());
        let pool = WorkerPool::new(
            store.clone(),
            handlers.clone(),
            retry,
            metrics.clone(),
            work,
            config.worker_config(),
        );

        info!(
            store = store.store_type(),
            limiters = limiters.len(),
            concurrency = config.concurrency,
            "Engine assembled"
        );

        Ok(Self {
            config,
            store,
            limiters,
            handlers,
            client,
            batches,
            dead,
            metrics,
            scheduler,
            pool,
        })
    }

    /// Register a handler using the default retry policy.
    pub fn register<F, Fut>(&self, job_type: impl Into<String>, handler: F)
    where
        F: Fn(Job, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Completion, JobError>> + Send + 'static,
    {
        self.handlers
            .register(job_type, self.config.default_policy(), handler);
    }

    /// Register a handler with its own retry policy.
    pub fn register_with_policy<F, Fut>(
        &self,
        job_type: impl Into<String>,
        policy: RetryPolicy,
        handler: F,
    ) where
        F: Fn(Job, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Completion, JobError>> + Send + 'static,
    {
        self.handlers.register(job_type, policy, handler);
    }

    /// Enqueue a job.
    pub async fn enqueue(
        &self,
        queue: impl Into<String>,
        job_type: impl Into<String>,
        payload: JobData,
        options: EnqueueOptions,
    ) -> QueueResult<JobId> {
        self.client.enqueue(queue, job_type, payload, options).await
    }

    /// Start the scheduler and the worker pool.
    pub async fn start(&mut self) -> QueueResult<()> {
        self.scheduler.start().await?;
        if let Err(e) = self.pool.start().await {
            self.scheduler.stop().await?;
            return Err(e);
        }
        info!("Engine started");
        Ok(())
    }

    /// Stop the worker pool (letting running jobs finish), then the scheduler.
    pub async fn stop(&mut self) -> QueueResult<()> {
        self.pool.stop().await?;
        self.scheduler.stop().await?;
        info!("Engine stopped");
        Ok(())
    }

    /// Check if the worker pool is running.
    pub async fn is_running(&self) -> bool {
        self.pool.is_running().await
    }

    /// Claim and run one job from `queue` on the caller's task.
    pub async fn process_one(&self, queue: &str) -> QueueResult<Option<Outcome>> {
        self.pool.process_one(queue).await
    }

    /// Run one scheduler sweep now.
    pub async fn tick(&self) -> QueueResult<SweepReport> {
        self.scheduler.tick().await
    }

    /// Refresh gauges and export all metrics in Prometheus text format.
    pub async fn metrics_text(&self) -> QueueResult<String> {
        self.metrics
            .refresh(self.store.as_ref(), &self.limiters.limiters())
            .await?;
        Ok(self.metrics.export())
    }

    /// Configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Enqueue client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Batch coordinator
    pub fn batches(&self) -> &BatchCoordinator {
        &self.batches
    }

    /// Dead set
    pub fn dead_set(&self) -> &DeadSet {
        &self.dead
    }

    /// Limiter registry
    pub fn limiters(&self) -> &LimiterRegistry {
        &self.limiters
    }

    /// Handler registry
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Job store
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Metrics
    pub fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }
}
