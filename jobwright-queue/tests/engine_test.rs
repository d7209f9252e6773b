//! Integration tests for the job engine

use chrono::Utc;
use jobwright_queue::*;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn far_future() -> chrono::DateTime<Utc> {
    Utc::now() + chrono::Duration::hours(1)
}

// =============================================================================
// Retry Tests
// =============================================================================

#[tokio::test]
async fn test_retries_follow_policy_then_dead() {
    let engine = Engine::memory().unwrap();
    let policy = RetryPolicy::new(3)
        .with_backoff(backoff_fn(|count, _err| Duration::from_secs(count as u64 + 1)));
    engine.register_with_policy("flaky", policy, |_, _| async {
        Err(JobError::failed("Flaky", "upstream unavailable"))
    });

    let id = engine
        .enqueue("default", "flaky", json!({}), EnqueueOptions::new())
        .await
        .unwrap();

    for expected in 1..=3u32 {
        let before = Utc::now();
        let outcome = engine.process_one("default").await.unwrap().unwrap();
        let after = Utc::now();

        let Outcome::Retried { at, retry_count } = outcome else {
            panic!("expected a retry, got {:?}", outcome);
        };
        assert_eq!(retry_count, expected);

        let delay = chrono::Duration::seconds(expected as i64);
        assert!(at >= before + delay);
        assert!(at <= after + delay);

        // Not visible before it falls due
        assert!(engine.process_one("default").await.unwrap().is_none());
        let promoted = engine.store().promote_due(at).await.unwrap();
        assert_eq!(promoted, vec![id]);
    }

    assert_eq!(
        engine.process_one("default").await.unwrap(),
        Some(Outcome::Dead)
    );

    let dead = engine.dead_set().get(id).await.unwrap().unwrap();
    assert_eq!(dead.state, JobState::Dead);
    assert_eq!(dead.retry_count, 3);
    assert_eq!(dead.error_class(), Some("Flaky"));
    assert_eq!(dead.error_history.len(), 4);
    assert!(dead.died_at.is_some());
}

async fn parse_ids(job: Job, _ctx: JobContext) -> Result<Completion, JobError> {
    let _ids: Vec<u32> = serde_json::from_value(job.payload)?;
    Ok(Completion::Done)
}

#[tokio::test]
async fn test_permanent_failure_skips_retries() {
    let engine = Engine::memory().unwrap();
    engine.register("parse", parse_ids);

    let id = engine
        .enqueue("default", "parse", json!({"not": "a list"}), EnqueueOptions::new())
        .await
        .unwrap();

    assert_eq!(
        engine.process_one("default").await.unwrap(),
        Some(Outcome::Dead)
    );
    let dead = engine.dead_set().get(id).await.unwrap().unwrap();
    assert_eq!(dead.retry_count, 0);
    assert_eq!(dead.error_class(), Some("Deserialization"));
}

// =============================================================================
// Scheduling Tests
// =============================================================================

#[tokio::test]
async fn test_delayed_job_hidden_until_due() {
    let engine = Engine::memory().unwrap();
    engine.register("report", |_, _| async { Ok(Completion::Done) });

    let id = engine
        .enqueue(
            "default",
            "report",
            json!({}),
            EnqueueOptions::new().delay(Duration::from_secs(60)),
        )
        .await
        .unwrap();

    assert_eq!(engine.client().queue_depth("default").await.unwrap(), 0);
    assert!(engine.process_one("default").await.unwrap().is_none());

    let report = engine.tick().await.unwrap();
    assert_eq!(report.promoted, 0);

    let promoted = engine
        .store()
        .promote_due(Utc::now() + chrono::Duration::seconds(61))
        .await
        .unwrap();
    assert_eq!(promoted, vec![id]);
    assert_eq!(engine.client().queue_depth("default").await.unwrap(), 1);
    assert_eq!(
        engine.process_one("default").await.unwrap(),
        Some(Outcome::Completed)
    );
}

#[tokio::test]
async fn test_snooze_keeps_retry_budget() {
    let engine = Engine::memory().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    engine.register("poll", move |_, _| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Completion::Snooze(Duration::from_secs(30)))
            } else {
                Ok(Completion::Done)
            }
        }
    });

    let id = engine
        .enqueue("default", "poll", json!({}), EnqueueOptions::new())
        .await
        .unwrap();

    let outcome = engine.process_one("default").await.unwrap().unwrap();
    assert!(matches!(outcome, Outcome::Snoozed { .. }));

    let job = engine.client().get_job(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Scheduled);
    assert_eq!(job.retry_count, 0);

    engine.store().promote_due(far_future()).await.unwrap();
    assert_eq!(
        engine.process_one("default").await.unwrap(),
        Some(Outcome::Completed)
    );
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

// =============================================================================
// Limiter Tests
// =============================================================================

fn limited_config(max_reschedules: u32) -> EngineConfig {
    let mut config = EngineConfig::default().with_limiter(LimiterConfig {
        name: "erp".to_string(),
        kind: LimiterKindConfig::Concurrent,
        capacity: 1,
        period_ms: None,
        lock_timeout_ms: None,
        wait_timeout_ms: Some(0),
    });
    config.max_over_limit_reschedules = max_reschedules;
    config
}

fn register_limited(engine: &Engine) {
    let erp = engine.limiters().get("erp").unwrap();
    engine.register("sync", move |_, _| {
        let erp = erp.clone();
        async move {
            erp.within_limit(|| async { Ok::<_, JobError>(Completion::Done) })
                .await
        }
    });
}

#[tokio::test]
async fn test_over_limit_reschedules_without_retry() {
    let engine = Engine::from_config(limited_config(20)).await.unwrap();
    register_limited(&engine);

    let holder = engine.limiters().get("erp").unwrap();
    let permit = holder.acquire().await.unwrap();

    let id = engine
        .enqueue("default", "sync", json!({}), EnqueueOptions::new())
        .await
        .unwrap();

    let before = Utc::now();
    let outcome = engine.process_one("default").await.unwrap().unwrap();
    let Outcome::Rescheduled { at } = outcome else {
        panic!("expected a reschedule, got {:?}", outcome);
    };
    assert!(at >= before + chrono::Duration::seconds(30));

    let job = engine.client().get_job(id).await.unwrap().unwrap();
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.over_limit_count, 1);
    assert!(job.last_error.is_none());

    permit.release().await.unwrap();
    engine.store().promote_due(far_future()).await.unwrap();
    assert_eq!(
        engine.process_one("default").await.unwrap(),
        Some(Outcome::Completed)
    );

    let text = engine.metrics_text().await.unwrap();
    assert!(text.contains("jobwright_jobs_rescheduled_total{queue=\"default\"} 1"));
    assert!(!text.contains("jobwright_jobs_failed_total{queue=\"default\"}"));
}

#[tokio::test]
async fn test_over_limit_cap_counts_as_failure() {
    let engine = Engine::from_config(limited_config(2)).await.unwrap();
    register_limited(&engine);

    let holder = engine.limiters().get("erp").unwrap();
    let _permit = holder.acquire().await.unwrap();

    let id = engine
        .enqueue("default", "sync", json!({}), EnqueueOptions::new())
        .await
        .unwrap();

    for _ in 0..2 {
        let outcome = engine.process_one("default").await.unwrap().unwrap();
        assert!(matches!(outcome, Outcome::Rescheduled { .. }));
        engine.store().promote_due(far_future()).await.unwrap();
    }

    let outcome = engine.process_one("default").await.unwrap().unwrap();
    assert!(matches!(outcome, Outcome::Retried { retry_count: 1, .. }));

    let job = engine.client().get_job(id).await.unwrap().unwrap();
    assert_eq!(job.over_limit_count, 0);
    assert_eq!(job.error_class(), Some(OVER_LIMIT_CLASS));
}

// =============================================================================
// Batch Tests
// =============================================================================

#[tokio::test]
async fn test_batch_with_dead_member_fires_failure_once() {
    let config = EngineConfig::default()
        .with_concurrency(4)
        .with_poll_interval(Duration::from_millis(20));
    let mut engine = Engine::from_config(config).await.unwrap();
    engine.register("member", |job, _| async move {
        if job.payload["fail"].as_bool().unwrap_or(false) {
            Err(JobError::permanent("Rejected", "bad record"))
        } else {
            Ok(Completion::Done)
        }
    });

    let success = Arc::new(AtomicUsize::new(0));
    let failure = Arc::new(AtomicUsize::new(0));
    let complete = Arc::new(AtomicUsize::new(0));

    let batches = engine.batches().clone();
    let batch_id = batches.begin_batch("nightly import").await.unwrap();
    for (event, counter) in [
        (BatchEvent::Success, success.clone()),
        (BatchEvent::Failure, failure.clone()),
        (BatchEvent::Complete, complete.clone()),
    ] {
        batches.on_event(batch_id, event, move |_, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    let jobs: Vec<Job> = (0..10)
        .map(|i| Job::new("default", "member", json!({"fail": i == 3})))
        .collect();
    batches.add_jobs(batch_id, jobs).await.unwrap();

    engine.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), async {
        while complete.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    engine.stop().await.unwrap();

    assert_eq!(complete.load(Ordering::SeqCst), 1);
    assert_eq!(failure.load(Ordering::SeqCst), 1);
    assert_eq!(success.load(Ordering::SeqCst), 0);

    let status = batches.status(batch_id).await.unwrap();
    assert_eq!(status.state, BatchState::Failed);
    assert_eq!(status.total, 10);
    assert_eq!(status.completed, 9);
    assert_eq!(status.dead, 1);
    assert_eq!(status.pending, 0);
}

#[tokio::test]
async fn test_batch_all_succeed_fires_success() {
    let engine = Engine::memory().unwrap();
    engine.register("member", |_, _| async { Ok(Completion::Done) });

    let success = Arc::new(AtomicUsize::new(0));
    let batch_id = engine.batches().begin_batch("ok").await.unwrap();
    let counter = success.clone();
    engine
        .batches()
        .on_event(batch_id, BatchEvent::Success, move |_, status| {
            let counter = counter.clone();
            async move {
                assert_eq!(status.completed, 3);
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

    for _ in 0..3 {
        engine
            .enqueue(
                "default",
                "member",
                json!({}),
                EnqueueOptions::new().batch(batch_id),
            )
            .await
            .unwrap();
    }

    while engine.process_one("default").await.unwrap().is_some() {}

    assert_eq!(success.load(Ordering::SeqCst), 1);
    let status = engine.batches().status(batch_id).await.unwrap();
    assert_eq!(status.state, BatchState::Complete);
}

#[tokio::test]
async fn test_requeued_member_reopens_pending_batch() {
    let engine = Engine::memory().unwrap();
    engine.register("member", |_, _| async { Ok(Completion::Done) });

    let batch_id = engine.batches().begin_batch("partial").await.unwrap();
    let broken = engine
        .enqueue(
            "default",
            "not_yet_deployed",
            json!({}),
            EnqueueOptions::new().batch(batch_id),
        )
        .await
        .unwrap();
    engine
        .enqueue(
            "default",
            "member",
            json!({}),
            EnqueueOptions::new().batch(batch_id),
        )
        .await
        .unwrap();

    assert_eq!(
        engine.process_one("default").await.unwrap(),
        Some(Outcome::Dead)
    );
    let status = engine.batches().status(batch_id).await.unwrap();
    assert_eq!((status.dead, status.pending), (1, 1));

    engine.dead_set().requeue(broken).await.unwrap();
    let status = engine.batches().status(batch_id).await.unwrap();
    assert_eq!((status.dead, status.pending), (0, 2));
    assert_eq!(status.state, BatchState::Pending);

    engine.register("not_yet_deployed", |_, _| async { Ok(Completion::Done) });
    while engine.process_one("default").await.unwrap().is_some() {}

    let status = engine.batches().status(batch_id).await.unwrap();
    assert_eq!(status.completed, 2);
    assert_eq!(status.state, BatchState::Complete);
}

// =============================================================================
// Dead Set Tests
// =============================================================================

#[tokio::test]
async fn test_dead_set_inspection_and_recovery() {
    let engine = Engine::memory().unwrap();

    let mut ids = Vec::new();
    for queue in ["mail", "mail", "billing"] {
        ids.push(
            engine
                .enqueue(queue, "missing_handler", json!({"q": queue}), EnqueueOptions::new())
                .await
                .unwrap(),
        );
    }
    for queue in ["mail", "mail", "billing"] {
        assert_eq!(
            engine.process_one(queue).await.unwrap(),
            Some(Outcome::Dead)
        );
    }

    let dead = engine.dead_set();
    assert_eq!(dead.size().await.unwrap(), 3);

    let no_handler = dead
        .list(&DeadFilter::all().error_class(NO_HANDLER_CLASS))
        .await
        .unwrap();
    assert_eq!(no_handler.len(), 3);

    let billing = dead
        .list(&DeadFilter::all().queue("billing"))
        .await
        .unwrap();
    assert_eq!(billing.len(), 1);
    assert_eq!(billing[0].payload, json!({"q": "billing"}));

    let requeued = dead.requeue(ids[2]).await.unwrap();
    assert_eq!(requeued.state, JobState::Ready);
    assert_eq!(requeued.retry_count, 0);
    assert_eq!(engine.client().queue_depth("billing").await.unwrap(), 1);

    assert!(dead.delete(ids[0]).await.unwrap());
    assert!(!dead.delete(ids[0]).await.unwrap());

    let purged = dead.purge(&DeadFilter::all().queue("mail")).await.unwrap();
    assert_eq!(purged, 1);
    assert_eq!(dead.size().await.unwrap(), 0);
}

// =============================================================================
// Configuration Tests
// =============================================================================

#[tokio::test]
async fn test_engine_from_toml() {
    let config = EngineConfig::from_toml_str(
        r#"
        concurrency = 3
        selection = "strict"
        default_max_retries = 7

        [[queues]]
        name = "critical"
        weight = 5

        [[queues]]
        name = "default"

        [[limiters]]
        name = "search"
        kind = "window"
        capacity = 10
        period_ms = 1000
        "#,
    )
    .unwrap();

    let engine = Engine::from_config(config).await.unwrap();
    assert_eq!(engine.config().concurrency, 3);
    assert_eq!(engine.config().queues[1].weight, 1);
    assert!(engine.limiters().get("search").is_some());

    let id = engine
        .enqueue("critical", "anything", json!({}), EnqueueOptions::new())
        .await
        .unwrap();
    let job = engine.client().get_job(id).await.unwrap().unwrap();
    assert_eq!(job.max_retries, 7);
}
