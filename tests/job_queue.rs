//! End-to-end job queue behaviour on both backends.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Notify;

use research_jobs::config::{BackendKind, QueueConfig};
use research_jobs::queue::{BoxError, JobHandle, JobOptions, JobQueue, JobState, JobStatus};

fn memory_queue() -> JobQueue {
    JobQueue::from_config(&QueueConfig::default()).unwrap()
}

fn durable_config(dir: &tempfile::TempDir) -> QueueConfig {
    QueueConfig {
        backend: BackendKind::Durable,
        data_path: dir.path().join("jobs.json").to_string_lossy().into_owned(),
        ..QueueConfig::default()
    }
}

async fn wait_for_state(queue: &JobQueue, name: &str, id: &str, state: JobState) -> JobStatus {
    for _ in 0..300 {
        let status = queue.get_job_status(name, id).await;
        if status.status == state {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never reached {:?}", id, state);
}

#[tokio::test]
async fn test_job_ids_are_unique() {
    let queue = memory_queue();

    let mut ids = HashSet::new();
    for i in 0..50 {
        let id = queue.enqueue_job("research", json!({ "n": i }), JobOptions::default()).await.unwrap();
        assert!(ids.insert(id), "duplicate job id");
    }

    let counts = queue.get_job_counts("research").await.unwrap();
    assert_eq!(counts.waiting, 50);
}

#[tokio::test]
async fn test_unknown_job_reports_not_found() {
    let queue = memory_queue();
    let status = queue.get_job_status("research", "does-not-exist").await;

    assert_eq!(status.status, JobState::NotFound);
    assert_eq!(status.queue, "research");
    assert!(status.result.is_none());
}

#[tokio::test]
async fn test_completed_job_keeps_result() {
    let queue = memory_queue();
    queue
        .register_processor(
            "echo",
            |job: JobHandle| async move { Ok::<_, BoxError>(json!({ "echo": job.payload().clone() })) },
            Some(1),
        )
        .await
        .unwrap();

    let id = queue.enqueue_job("echo", json!("hello"), JobOptions::default()).await.unwrap();
    let status = wait_for_state(&queue, "echo", &id, JobState::Completed).await;

    assert_eq!(status.result, Some(json!({ "echo": "hello" })));
    assert_eq!(status.attempts_made, 1);
    assert_eq!(status.progress, 100);
    assert!(status.finished_at.is_some());
}

#[tokio::test]
async fn test_concurrency_ceiling_is_respected() {
    let queue = memory_queue();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (r, p) = (running.clone(), peak.clone());
    queue
        .register_processor(
            "bounded",
            move |_job: JobHandle| {
                let running = r.clone();
                let peak = p.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, BoxError>(Value::Null)
                }
            },
            Some(3),
        )
        .await
        .unwrap();

    let mut ids = Vec::new();
    for i in 0..12 {
        ids.push(queue.enqueue_job("bounded", json!({ "n": i }), JobOptions::default()).await.unwrap());
    }
    for id in &ids {
        wait_for_state(&queue, "bounded", id, JobState::Completed).await;
    }

    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency was {}", peak);
    assert!(peak >= 2, "jobs never overlapped");
}

#[tokio::test]
async fn test_higher_priority_runs_first() {
    let queue = memory_queue();
    queue.pause_queue("ordered").await.unwrap();

    let low = queue.enqueue_job("ordered", json!("low"), JobOptions::default()).await.unwrap();
    let first_default = queue.enqueue_job("ordered", json!("a"), JobOptions::default()).await.unwrap();
    let high = queue
        .enqueue_job("ordered", json!("high"), JobOptions::default().with_priority(10))
        .await
        .unwrap();
    let second_default = queue.enqueue_job("ordered", json!("b"), JobOptions::default()).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    queue
        .register_processor(
            "ordered",
            move |job: JobHandle| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(job.id().to_string());
                    Ok::<_, BoxError>(Value::Null)
                }
            },
            Some(1),
        )
        .await
        .unwrap();
    queue.resume_queue("ordered").await.unwrap();

    wait_for_state(&queue, "ordered", &second_default, JobState::Completed).await;
    let order = seen.lock().unwrap().clone();
    assert_eq!(order, vec![high, low, first_default, second_default]);
}

#[tokio::test]
async fn test_pause_holds_jobs_until_resume() {
    pause_holds_jobs_until_resume(memory_queue()).await;
}

#[tokio::test]
async fn test_durable_pause_holds_jobs_until_resume() {
    let dir = tempfile::tempdir().unwrap();
    let queue = JobQueue::from_config(&durable_config(&dir)).unwrap();
    assert_eq!(queue.backend_kind(), BackendKind::Durable);
    pause_holds_jobs_until_resume(queue).await;
}

async fn pause_holds_jobs_until_resume(queue: JobQueue) {
    queue
        .register_processor("pausable", |_job: JobHandle| async { Ok::<_, BoxError>(json!(1)) }, Some(2))
        .await
        .unwrap();

    queue.pause_queue("pausable").await.unwrap();
    assert!(queue.is_paused("pausable").await);

    let id = queue.enqueue_job("pausable", json!({}), JobOptions::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.get_job_status("pausable", &id).await.status, JobState::Waiting);

    queue.resume_queue("pausable").await.unwrap();
    assert!(!queue.is_paused("pausable").await);
    wait_for_state(&queue, "pausable", &id, JobState::Completed).await;
    queue.close().await.unwrap();
}

#[tokio::test]
async fn test_cancel_only_touches_pending_jobs() {
    let queue = memory_queue();
    let id = queue.enqueue_job("cancel", json!({}), JobOptions::default()).await.unwrap();
    let delayed = queue
        .enqueue_job("cancel", json!({}), JobOptions::default().with_delay(Duration::from_secs(60)))
        .await
        .unwrap();

    assert!(queue.cancel_job(&id).await.unwrap());
    assert!(queue.cancel_job(&delayed).await.unwrap());
    assert!(!queue.cancel_job(&id).await.unwrap());
    assert!(!queue.cancel_job("unknown").await.unwrap());

    assert_eq!(queue.get_job_status("cancel", &id).await.status, JobState::NotFound);
    assert_eq!(queue.get_job_counts("cancel").await.unwrap().backlog(), 0);
}

#[tokio::test]
async fn test_failing_job_exhausts_attempts() {
    failing_job_exhausts_attempts(memory_queue()).await;
}

#[tokio::test]
async fn test_durable_failing_job_exhausts_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let config = durable_config(&dir);
    let id = failing_job_exhausts_attempts(JobQueue::from_config(&config).unwrap()).await;

    // The final failure is what a restarted process sees.
    let reopened = JobQueue::from_config(&config).unwrap();
    let status = reopened.get_job_status("flaky", &id).await;
    assert_eq!(status.status, JobState::Failed);
    assert_eq!(status.attempts_made, 3);
    assert_eq!(status.stacktrace.len(), 3);
}

async fn failing_job_exhausts_attempts(queue: JobQueue) -> String {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    queue
        .register_processor(
            "flaky",
            move |_job: JobHandle| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<Value, BoxError>("provider rejected prompt".into())
                }
            },
            Some(1),
        )
        .await
        .unwrap();

    let id = queue
        .enqueue_job("flaky", json!({}), JobOptions::default().with_attempts(3))
        .await
        .unwrap();
    let status = wait_for_state(&queue, "flaky", &id, JobState::Failed).await;

    assert_eq!(status.attempts_made, 3);
    assert_eq!(status.max_attempts, 3);
    assert_eq!(status.error.as_deref(), Some("provider rejected prompt"));
    assert_eq!(status.stacktrace.len(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    queue.close().await.unwrap();
    id
}

#[tokio::test]
async fn test_delayed_job_waits() {
    let queue = memory_queue();
    queue
        .register_processor("later", |_job: JobHandle| async { Ok::<_, BoxError>(Value::Null) }, Some(1))
        .await
        .unwrap();

    let id = queue
        .enqueue_job("later", json!({}), JobOptions::default().with_delay(Duration::from_millis(300)))
        .await
        .unwrap();

    let status = queue.get_job_status("later", &id).await;
    assert_eq!(status.status, JobState::Delayed);
    assert!(status.delay_ms > 0);

    wait_for_state(&queue, "later", &id, JobState::Completed).await;
}

#[tokio::test]
async fn test_backlog_delays_rate_limited_jobs() {
    let queue = memory_queue();

    let quiet = queue
        .enqueue_job("deep", json!({ "deep_research": true }), JobOptions::default())
        .await
        .unwrap();
    assert_eq!(queue.get_job_status("deep", &quiet).await.status, JobState::Waiting);

    for i in 0..4 {
        queue.enqueue_job("deep", json!({ "n": i }), JobOptions::default()).await.unwrap();
    }

    let busy = queue
        .enqueue_job("deep", json!({ "type": "deep_research" }), JobOptions::default())
        .await
        .unwrap();
    let status = queue.get_job_status("deep", &busy).await;
    assert_eq!(status.status, JobState::Delayed);
    assert!(status.delay_ms > 40_000, "delay was {}ms", status.delay_ms);

    let plain = queue.enqueue_job("deep", json!({ "n": 9 }), JobOptions::default()).await.unwrap();
    assert_eq!(queue.get_job_status("deep", &plain).await.status, JobState::Waiting);
}

#[tokio::test]
async fn test_progress_is_visible_while_active() {
    let queue = memory_queue();
    let release = Arc::new(Notify::new());
    let gate = release.clone();
    queue
        .register_processor(
            "progress",
            move |job: JobHandle| {
                let gate = gate.clone();
                async move {
                    job.report_progress(40)?;
                    gate.notified().await;
                    Ok::<_, BoxError>(Value::Null)
                }
            },
            Some(1),
        )
        .await
        .unwrap();

    let id = queue.enqueue_job("progress", json!({}), JobOptions::default()).await.unwrap();
    let mut status = wait_for_state(&queue, "progress", &id, JobState::Active).await;
    for _ in 0..100 {
        if status.progress == 40 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        status = queue.get_job_status("progress", &id).await;
    }
    assert_eq!(status.progress, 40);

    release.notify_one();
    wait_for_state(&queue, "progress", &id, JobState::Completed).await;
}

#[tokio::test]
async fn test_durable_backend_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = durable_config(&dir);

    let id = {
        let queue = JobQueue::from_config(&config).unwrap();
        assert_eq!(queue.backend_kind(), BackendKind::Durable);
        let id = queue
            .enqueue_job("durable", json!({ "prompt": "persist me" }), JobOptions::default().with_priority(3))
            .await
            .unwrap();
        queue.close().await.unwrap();
        id
    };

    let queue = JobQueue::from_config(&config).unwrap();
    let status = queue.get_job_status("durable", &id).await;
    assert_eq!(status.status, JobState::Waiting);
    assert!(queue.queue_names().await.contains(&"durable".to_string()));

    queue
        .register_processor(
            "durable",
            |job: JobHandle| async move { Ok::<_, BoxError>(job.payload()["prompt"].clone()) },
            Some(1),
        )
        .await
        .unwrap();
    let status = wait_for_state(&queue, "durable", &id, JobState::Completed).await;
    assert_eq!(status.result, Some(json!("persist me")));
}

#[tokio::test]
async fn test_closed_queue_rejects_jobs() {
    let queue = memory_queue();
    queue.close().await.unwrap();

    let err = queue.enqueue_job("research", json!({}), JobOptions::default()).await;
    assert!(err.is_err());
}
