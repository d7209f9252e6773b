//! Prometheus metrics for queues, the dead set and limiters.
//!
//! Each engine owns its own [`Registry`], so several engines in one process
//! never collide on metric names.

use crate::error::QueueResult;
use crate::store::JobStore;
use jobwright_ratelimit::Limiter;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::time::Duration;
use tracing::{error, warn};

/// Queue engine metrics.
#[derive(Clone)]
pub struct QueueMetrics {
    registry: Registry,
    enqueued: IntCounterVec,
    succeeded: IntCounterVec,
    failed: IntCounterVec,
    dead: IntCounterVec,
    rescheduled: IntCounterVec,
    duration: HistogramVec,
    depth: IntGaugeVec,
    scheduled_size: IntGauge,
    dead_size: IntGauge,
    limiter_in_use: IntGaugeVec,
    limiter_saturation: GaugeVec,
}

fn counter(registry: &Registry, name: &str, help: &str) -> QueueResult<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help), &["queue"])?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl QueueMetrics {
    /// Create metrics in a fresh registry.
    pub fn new() -> QueueResult<Self> {
        Self::with_registry(Registry::new())
    }

    /// Register metrics in an existing registry.
    pub fn with_registry(registry: Registry) -> QueueResult<Self> {
        let enqueued = counter(&registry, "jobwright_jobs_enqueued_total", "Jobs enqueued")?;
        let succeeded = counter(&registry, "jobwright_jobs_succeeded_total", "Jobs completed")?;
        let failed = counter(&registry, "jobwright_jobs_failed_total", "Failed executions")?;
        let dead = counter(&registry, "jobwright_jobs_dead_total", "Jobs moved to the dead set")?;
        let rescheduled = counter(
            &registry,
            "jobwright_jobs_rescheduled_total",
            "Jobs rescheduled without consuming a retry",
        )?;

        let duration = HistogramVec::new(
            HistogramOpts::new("jobwright_job_duration_seconds", "Handler execution time"),
            &["queue"],
        )?;
        registry.register(Box::new(duration.clone()))?;

        let depth = IntGaugeVec::new(
            Opts::new("jobwright_queue_depth", "Ready jobs per queue"),
            &["queue"],
        )?;
        registry.register(Box::new(depth.clone()))?;

        let scheduled_size =
            IntGauge::new("jobwright_scheduled_size", "Jobs waiting in the scheduled set")?;
        registry.register(Box::new(scheduled_size.clone()))?;

        let dead_size = IntGauge::new("jobwright_dead_size", "Jobs in the dead set")?;
        registry.register(Box::new(dead_size.clone()))?;

        let limiter_in_use = IntGaugeVec::new(
            Opts::new("jobwright_limiter_in_use", "Capacity taken per limiter"),
            &["limiter"],
        )?;
        registry.register(Box::new(limiter_in_use.clone()))?;

        let limiter_saturation = GaugeVec::new(
            Opts::new(
                "jobwright_limiter_saturation",
                "Fraction of limiter capacity in use",
            ),
            &["limiter"],
        )?;
        registry.register(Box::new(limiter_saturation.clone()))?;

        Ok(Self {
            registry,
            enqueued,
            succeeded,
            failed,
            dead,
            rescheduled,
            duration,
            depth,
            scheduled_size,
            dead_size,
            limiter_in_use,
            limiter_saturation,
        })
    }

    /// Underlying registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Count an enqueued job
    pub fn enqueued(&self, queue: &str) {
        self.enqueued.with_label_values(&[queue]).inc();
    }

    /// Count a completed job
    pub fn succeeded(&self, queue: &str) {
        self.succeeded.with_label_values(&[queue]).inc();
    }

    /// Count a failed execution
    pub fn failed(&self, queue: &str) {
        self.failed.with_label_values(&[queue]).inc();
    }

    /// Count a job moved to the dead set
    pub fn dead(&self, queue: &str) {
        self.dead.with_label_values(&[queue]).inc();
    }

    /// Count a reschedule that did not consume a retry
    pub fn rescheduled(&self, queue: &str) {
        self.rescheduled.with_label_values(&[queue]).inc();
    }

    /// Record handler execution time
    pub fn observe_duration(&self, queue: &str, elapsed: Duration) {
        self.duration
            .with_label_values(&[queue])
            .observe(elapsed.as_secs_f64());
    }

    /// Counter value, mostly for tests and diagnostics
    pub fn count(&self, metric: &str, queue: &str) -> u64 {
        let vec = match metric {
            "enqueued" => &self.enqueued,
            "succeeded" => &self.succeeded,
            "failed" => &self.failed,
            "dead" => &self.dead,
            "rescheduled" => &self.rescheduled,
            _ => return 0,
        };
        vec.with_label_values(&[queue]).get()
    }

    /// Refresh the gauges from the store and the given limiters.
    pub async fn refresh(&self, store: &dyn JobStore, limiters: &[Limiter]) -> QueueResult<()> {
        for queue in store.queue_names().await? {
            let depth = store.queue_depth(&queue).await?;
            self.depth.with_label_values(&[queue.as_str()]).set(depth as i64);
        }
        self.scheduled_size.set(store.scheduled_count().await? as i64);
        self.dead_size.set(store.dead_count().await? as i64);

        for limiter in limiters {
            match limiter.usage().await {
                Ok(usage) => {
                    self.limiter_in_use
                        .with_label_values(&[limiter.name()])
                        .set(usage.in_use as i64);
                    self.limiter_saturation
                        .with_label_values(&[limiter.name()])
                        .set(usage.saturation());
                }
                Err(e) => {
                    warn!(limiter = %limiter.name(), error = %e, "Failed to read limiter usage");
                }
            }
        }
        Ok(())
    }

    /// Export all metrics in Prometheus text format
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buffer) {
            error!(error = %e, "Failed to encode metrics");
            return String::from("# Error encoding metrics\n");
        }

        String::from_utf8(buffer)
            .unwrap_or_else(|_| String::from("# Error converting metrics to UTF-8\n"))
    }
}
