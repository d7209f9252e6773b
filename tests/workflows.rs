//! End-to-end tests for common jobwright workflows.
//!
//! These run a full engine with its scheduler and worker pool.

use jobwright::*;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

async fn wait_for(counter: &AtomicUsize, expected: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while counter.load(Ordering::SeqCst) < expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_concurrency(4)
        .with_poll_interval(Duration::from_millis(20))
        .with_scheduler_interval(Duration::from_millis(25))
}

// =============================================================================
// Durability Tests
// =============================================================================

#[tokio::test]
async fn test_jobs_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.json");
    let config = EngineConfig::default().with_store(StoreConfig::File { path: path.clone() });

    let (ready, delayed, claimed) = {
        let engine = Engine::from_config(config.clone()).await.unwrap();
        let ready = engine
            .enqueue("default", "mail", json!({"to": "a"}), EnqueueOptions::new())
            .await
            .unwrap();
        let delayed = engine
            .enqueue(
                "default",
                "mail",
                json!({"to": "b"}),
                EnqueueOptions::new().delay(Duration::from_secs(600)),
            )
            .await
            .unwrap();
        let claimed = engine
            .enqueue("reports", "build", json!({}), EnqueueOptions::new())
            .await
            .unwrap();

        // Claimed and never acknowledged, as if the process died mid-job
        let lease = chrono::Utc::now() + chrono::Duration::seconds(1);
        let job = engine.store().dequeue("reports", lease).await.unwrap().unwrap();
        assert_eq!(job.id, claimed);

        (ready, delayed, claimed)
    };

    let engine = Engine::from_config(config).await.unwrap();
    assert_eq!(engine.client().queue_depth("default").await.unwrap(), 1);
    assert_eq!(engine.store().scheduled_count().await.unwrap(), 1);

    let job = engine.client().get_job(ready).await.unwrap().unwrap();
    assert_eq!(job.payload, json!({"to": "a"}));
    let job = engine.client().get_job(delayed).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Scheduled);

    let reclaimed = engine
        .store()
        .reclaim_stale(chrono::Utc::now() + chrono::Duration::seconds(5))
        .await
        .unwrap();
    assert_eq!(reclaimed, vec![claimed]);
    assert_eq!(engine.client().queue_depth("reports").await.unwrap(), 1);
}

// =============================================================================
// Running Engine Tests
// =============================================================================

#[tokio::test]
async fn test_running_engine_processes_immediate_and_delayed_jobs() {
    let mut engine = Engine::from_config(fast_config()).await.unwrap();

    let done = Arc::new(AtomicUsize::new(0));
    let counter = done.clone();
    engine.register("touch", move |_, _| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Completion::Done)
        }
    });

    engine.start().await.unwrap();
    assert!(engine.is_running().await);

    for _ in 0..5 {
        engine
            .enqueue("default", "touch", json!({}), EnqueueOptions::new())
            .await
            .unwrap();
    }
    engine
        .enqueue(
            "default",
            "touch",
            json!({}),
            EnqueueOptions::new().delay(Duration::from_millis(100)),
        )
        .await
        .unwrap();

    wait_for(&done, 6).await;
    engine.stop().await.unwrap();
    assert!(!engine.is_running().await);

    assert_eq!(engine.client().queue_depth("default").await.unwrap(), 0);
    assert_eq!(engine.store().scheduled_count().await.unwrap(), 0);

    let text = engine.metrics_text().await.unwrap();
    assert!(text.contains("jobwright_jobs_succeeded_total{queue=\"default\"} 6"));
    assert!(text.contains("jobwright_jobs_enqueued_total{queue=\"default\"} 6"));
}

#[tokio::test]
async fn test_limiter_bounds_concurrency_across_pool() {
    let config = fast_config().with_concurrency(6).with_limiter(LimiterConfig {
        name: "erp".to_string(),
        kind: LimiterKindConfig::Concurrent,
        capacity: 2,
        period_ms: None,
        lock_timeout_ms: None,
        wait_timeout_ms: Some(5_000),
    });
    let mut engine = Engine::from_config(config).await.unwrap();
    let erp = engine.limiters().get("erp").unwrap();

    let done = Arc::new(AtomicUsize::new(0));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (done_c, active_c, peak_c) = (done.clone(), active.clone(), peak.clone());
    engine.register("sync", move |_, _| {
        let erp = erp.clone();
        let (done, active, peak) = (done_c.clone(), active_c.clone(), peak_c.clone());
        async move {
            let result = erp
                .within_limit(|| async {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, JobError>(())
                })
                .await;
            result.map(|()| {
                done.fetch_add(1, Ordering::SeqCst);
                Completion::Done
            })
        }
    });

    engine.start().await.unwrap();
    for i in 0..12 {
        engine
            .enqueue("default", "sync", json!({"n": i}), EnqueueOptions::new())
            .await
            .unwrap();
    }

    wait_for(&done, 12).await;
    engine.stop().await.unwrap();

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(engine.dead_set().size().await.unwrap(), 0);

    let usage = engine.limiters().get("erp").unwrap().usage().await.unwrap();
    assert_eq!(usage.in_use, 0);
}

#[tokio::test]
async fn test_requeued_dead_job_runs_again() {
    let mut engine = Engine::from_config(fast_config()).await.unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    engine.register_with_policy("once_broken", RetryPolicy::new(0), move |_, _| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(JobError::failed("Io", "disk full"))
            } else {
                Ok(Completion::Done)
            }
        }
    });

    engine.start().await.unwrap();
    let id = engine
        .enqueue("default", "once_broken", json!({}), EnqueueOptions::new())
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        while engine.dead_set().get(id).await.unwrap().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let dead = engine.dead_set().get(id).await.unwrap().unwrap();
    assert_eq!(dead.error_class(), Some("Io"));

    engine.dead_set().requeue(id).await.unwrap();
    wait_for(&attempts, 2).await;
    tokio::time::timeout(Duration::from_secs(10), async {
        while engine.client().get_job(id).await.unwrap().is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    engine.stop().await.unwrap();
    assert_eq!(engine.dead_set().size().await.unwrap(), 0);
}

// =============================================================================
// Facade Tests
// =============================================================================

#[test]
fn test_prelude_exposes_engine_types() {
    use jobwright::prelude::*;

    let job = Job::new("default", "noop", serde_json::json!({}));
    assert_eq!(job.state, JobState::Ready);
    assert_eq!(EnqueueOptions::new(), EnqueueOptions::default());

    let registry = LimiterRegistry::memory();
    let limiter: Limiter = registry.concurrent("db", 3).unwrap();
    assert_eq!(limiter.kind().capacity(), 3);

    assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
}
