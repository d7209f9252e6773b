//! Background sweep promoting due jobs and reclaiming expired claims.

use crate::error::{QueueError, QueueResult};
use crate::store::JobStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default sweep interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Scheduled jobs moved to their ready queues
    pub promoted: usize,
    /// Expired claims returned to their ready queues
    pub reclaimed: usize,
}

/// Scheduler for delayed and retrying jobs.
///
/// Promotion is by `due_at <= now`, so sweeps missed while the process was
/// down are caught up on the next tick.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    work: Arc<Notify>,
    poll_interval: Duration,
    running: Arc<RwLock<bool>>,
    shutdown: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Create a scheduler. `work` is signalled whenever jobs become ready.
    pub fn new(store: Arc<dyn JobStore>, work: Arc<Notify>) -> Self {
        Self {
            store,
            work,
            poll_interval: DEFAULT_POLL_INTERVAL,
            running: Arc::new(RwLock::new(false)),
            shutdown: Arc::new(Notify::new()),
            handle: None,
        }
    }

    /// Set the sweep interval
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Sweep interval
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Run one sweep now.
    pub async fn tick(&self) -> QueueResult<SweepReport> {
        sweep(self.store.as_ref(), &self.work, Utc::now()).await
    }

    /// Run one sweep as if the clock read `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> QueueResult<SweepReport> {
        sweep(self.store.as_ref(), &self.work, now).await
    }

    /// Start the background sweep.
    pub async fn start(&mut self) -> QueueResult<()> {
        let mut running = self.running.write().await;
        if *running {
            return Err(QueueError::SchedulerAlreadyRunning);
        }
        *running = true;
        drop(running);

        info!(poll_interval = ?self.poll_interval, "Scheduler started");

        let store = self.store.clone();
        let work = self.work.clone();
        let running = self.running.clone();
        let shutdown = self.shutdown.clone();
        let poll_interval = self.poll_interval;

        self.handle = Some(tokio::spawn(async move {
            while *running.read().await {
                if let Err(e) = sweep(store.as_ref(), &work, Utc::now()).await {
                    error!(error = %e, "Scheduler sweep failed");
                }

                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.notified() => {}
                }
            }
            debug!("Scheduler loop exited");
        }));

        Ok(())
    }

    /// Stop the sweep and wait for the loop to exit.
    pub async fn stop(&mut self) -> QueueResult<()> {
        let mut running = self.running.write().await;
        if !*running {
            return Err(QueueError::SchedulerNotRunning);
        }
        *running = false;
        drop(running);

        // Stored permit wakes the loop even if it is mid-sweep
        self.shutdown.notify_one();
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Scheduler task ended abnormally");
        }

        info!("Scheduler stopped");
        Ok(())
    }

    /// Check if the scheduler is running.
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

async fn sweep(store: &dyn JobStore, work: &Notify, now: DateTime<Utc>) -> QueueResult<SweepReport> {
    let promoted = store.promote_due(now).await?.len();
    let reclaimed = store.reclaim_stale(now).await?.len();

    if promoted + reclaimed > 0 {
        debug!(promoted = promoted, reclaimed = reclaimed, "Sweep moved jobs to ready");
        work.notify_waiters();
    }

    Ok(SweepReport {
        promoted,
        reclaimed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use crate::store::MemoryStore;

    fn scheduler() -> (Scheduler, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let scheduler = Scheduler::new(store.clone(), Arc::new(Notify::new()));
        (scheduler, store)
    }

    #[tokio::test]
    async fn test_tick_promotes_due_jobs() {
        let (scheduler, store) = scheduler();
        let now = Utc::now();
        store
            .enqueue(
                Job::new("q", "t", serde_json::json!({}))
                    .schedule_at(now + chrono::Duration::seconds(10)),
            )
            .await
            .unwrap();

        assert_eq!(scheduler.tick_at(now).await.unwrap(), SweepReport::default());

        let report = scheduler
            .tick_at(now + chrono::Duration::seconds(10))
            .await
            .unwrap();
        assert_eq!(report.promoted, 1);
        assert_eq!(store.queue_depth("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_tick_reclaims_expired_claims() {
        let (scheduler, store) = scheduler();
        let now = Utc::now();
        store
            .enqueue(Job::new("q", "t", serde_json::json!({})))
            .await
            .unwrap();
        store
            .dequeue("q", now + chrono::Duration::seconds(1))
            .await
            .unwrap()
            .unwrap();

        let report = scheduler
            .tick_at(now + chrono::Duration::seconds(2))
            .await
            .unwrap();
        assert_eq!(report.reclaimed, 1);
        assert_eq!(store.queue_depth("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_scheduler_lifecycle() {
        let (scheduler, _) = scheduler();
        let mut scheduler = scheduler.with_poll_interval(Duration::from_millis(10));

        assert!(!scheduler.is_running().await);
        scheduler.start().await.unwrap();
        assert!(scheduler.is_running().await);
        assert!(matches!(
            scheduler.start().await,
            Err(QueueError::SchedulerAlreadyRunning)
        ));

        scheduler.stop().await.unwrap();
        assert!(!scheduler.is_running().await);
        assert!(matches!(
            scheduler.stop().await,
            Err(QueueError::SchedulerNotRunning)
        ));
    }
}
