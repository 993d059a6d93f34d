//! In-process job engine shared by both backend strategies.
//!
//! # Data Flow
//! ```text
//! add(job) → store (waiting | delayed) → wake dispatcher
//!
//! dispatcher (one task per queue):
//!     acquire permit (at most `concurrency` in flight)
//!     → claim next runnable job (priority, then FIFO), unless paused
//!     → spawn: processor(JobHandle) → record outcome → retention → release permit
//! ```
//!
//! # Design Decisions
//! - The store decides durability: `MemoryStore` for the fallback backend,
//!   `FileStore` for the durable one
//! - Processor panics are caught and recorded as failed attempts
//! - Pausing stops claiming only; in-flight jobs run to completion

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::{broadcast, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::schema::RetentionConfig;
use crate::config::BackendKind;
use crate::lifecycle::shutdown::Shutdown;
use crate::queue::backend::QueueBackend;
use crate::queue::handle::{JobHandle, ProgressSink};
use crate::queue::processor::Processor;
use crate::queue::store::{AttemptDisposition, FileStore, JobStore, MemoryStore};
use crate::queue::types::{
    JobCounts, JobId, JobOptions, JobProcessingError, JobRecord, JobState, QueueError, QueueResult,
};

/// Longest an idle dispatcher sleeps before re-checking the store.
const MAX_IDLE_WAIT: Duration = Duration::from_secs(30);

/// Wait after a store error before trying again.
const STORE_ERROR_WAIT: Duration = Duration::from_secs(1);

/// The in-process fallback backend.
pub type MemoryBackend = LocalBackend<MemoryStore>;

/// The durable backend; jobs survive restarts.
pub type DurableBackend = LocalBackend<FileStore>;

/// Per-queue dispatch state.
#[derive(Debug)]
struct Lane {
    name: String,
    wake: Notify,
    paused: AtomicBool,
    has_processor: AtomicBool,
}

impl Lane {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            wake: Notify::new(),
            paused: AtomicBool::new(false),
            has_processor: AtomicBool::new(false),
        }
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

pub struct LocalBackend<S: JobStore> {
    store: Arc<S>,
    retention: RetentionConfig,
    lanes: DashMap<String, Arc<Lane>>,
    shutdown: Shutdown,
    closed: AtomicBool,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalBackend<MemoryStore> {
    pub fn in_memory(retention: RetentionConfig) -> Self {
        Self::with_store(MemoryStore::new(), retention)
    }
}

impl LocalBackend<FileStore> {
    /// Open the durable backend journalled at `path`.
    pub fn open(path: impl AsRef<Path>, retention: RetentionConfig) -> QueueResult<Self> {
        Ok(Self::with_store(FileStore::open(path)?, retention))
    }
}

impl<S: JobStore> LocalBackend<S> {
    pub fn with_store(store: S, retention: RetentionConfig) -> Self {
        Self {
            store: Arc::new(store),
            retention,
            lanes: DashMap::new(),
            shutdown: Shutdown::new(),
            closed: AtomicBool::new(false),
            dispatchers: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn lane(&self, queue: &str) -> Arc<Lane> {
        if let Some(lane) = self.lanes.get(queue) {
            return lane.value().clone();
        }
        self.lanes
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Lane::new(queue)))
            .value()
            .clone()
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<S: JobStore> QueueBackend for LocalBackend<S> {
    fn kind(&self) -> BackendKind {
        self.store.kind()
    }

    async fn add(&self, queue: &str, payload: Value, options: JobOptions) -> QueueResult<JobId> {
        self.ensure_open()?;
        if options.max_attempts == 0 {
            return Err(QueueError::InvalidOptions("max_attempts must be at least 1".to_string()));
        }

        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let (state, run_at) = if options.delay_ms > 0 {
            let delay = chrono::Duration::milliseconds(options.delay_ms.min(i64::MAX as u64) as i64);
            (JobState::Delayed, Some(now + delay))
        } else {
            (JobState::Waiting, None)
        };

        self.store.write(|table| {
            let seq = table.next_seq();
            table.insert(JobRecord {
                id: id.clone(),
                queue: queue.to_string(),
                seq,
                payload,
                options,
                state,
                progress: 0,
                attempts_made: 0,
                created_at: now,
                run_at,
                started_at: None,
                finished_at: None,
                result: None,
                error: None,
                stacktrace: Vec::new(),
            });
        })?;

        tracing::debug!(queue = %queue, job_id = %id, state = %state, "Job added");
        self.lane(queue).wake.notify_one();
        Ok(id)
    }

    async fn get(&self, queue: &str, id: &str) -> QueueResult<Option<JobRecord>> {
        Ok(self.store.read(|table| table.get(queue, id).cloned()))
    }

    async fn process(&self, queue: &str, concurrency: usize, processor: Arc<dyn Processor>) -> QueueResult<()> {
        self.ensure_open()?;
        let lane = self.lane(queue);
        if lane.has_processor.swap(true, Ordering::SeqCst) {
            return Err(QueueError::ProcessorAlreadyRegistered(queue.to_string()));
        }

        let concurrency = concurrency.max(1);
        let dispatcher = Dispatcher {
            store: self.store.clone(),
            lane,
            processor,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            retention: self.retention.clone(),
        };
        let shutdown = self.shutdown.subscribe();

        tracing::info!(queue = %queue, concurrency, backend = self.store.kind().as_str(), "Queue processor started");
        let handle = tokio::spawn(dispatcher.run(shutdown));
        self.dispatchers.lock().expect("dispatcher list mutex poisoned").push(handle);
        Ok(())
    }

    async fn counts(&self, queue: &str) -> QueueResult<JobCounts> {
        Ok(self.store.read(|table| table.counts(queue, Utc::now())))
    }

    async fn remove(&self, id: &str) -> QueueResult<bool> {
        let removed = self.store.write(|table| table.remove_pending(id))?;
        match removed {
            Some(job) => {
                tracing::info!(queue = %job.queue, job_id = %id, "Job cancelled");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn pause(&self, queue: &str) -> QueueResult<()> {
        self.lane(queue).paused.store(true, Ordering::SeqCst);
        tracing::info!(queue = %queue, "Queue paused");
        Ok(())
    }

    async fn resume(&self, queue: &str) -> QueueResult<()> {
        let lane = self.lane(queue);
        lane.paused.store(false, Ordering::SeqCst);
        lane.wake.notify_one();
        tracing::info!(queue = %queue, "Queue resumed");
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> bool {
        self.lanes.get(queue).map(|lane| lane.is_paused()).unwrap_or(false)
    }

    async fn queues(&self) -> Vec<String> {
        let mut names = self.store.read(|table| table.queue_names());
        names.extend(self.lanes.iter().map(|lane| lane.key().clone()));
        names.sort();
        names.dedup();
        names
    }

    async fn close(&self) -> QueueResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.shutdown.trigger();
        let handles: Vec<JoinHandle<()>> = self
            .dispatchers
            .lock()
            .expect("dispatcher list mutex poisoned")
            .drain(..)
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Queue dispatcher task failed");
            }
        }

        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.flush())
            .await
            .map_err(|e| QueueError::Io(std::io::Error::other(e)))??;
        tracing::info!(backend = self.store.kind().as_str(), "Job backend closed");
        Ok(())
    }
}

struct Dispatcher<S: JobStore> {
    store: Arc<S>,
    lane: Arc<Lane>,
    processor: Arc<dyn Processor>,
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    retention: RetentionConfig,
}

impl<S: JobStore> Dispatcher<S> {
    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        'dispatch: loop {
            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.recv() => break,
            };

            let job = loop {
                let mut wait = MAX_IDLE_WAIT;
                if !self.lane.is_paused() {
                    match self.store.write(|table| table.claim_next(&self.lane.name, Utc::now())) {
                        Ok(Some(job)) => break job,
                        Ok(None) => wait = self.idle_wait(),
                        Err(e) => {
                            tracing::error!(queue = %self.lane.name, error = %e, "Failed to claim next job");
                            wait = STORE_ERROR_WAIT;
                        }
                    }
                }

                tokio::select! {
                    _ = self.lane.wake.notified() => {}
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.recv() => break 'dispatch,
                }
            };

            tokio::spawn(run_job(
                self.store.clone(),
                self.lane.clone(),
                self.processor.clone(),
                self.retention.clone(),
                job,
                permit,
            ));
        }

        tracing::debug!(queue = %self.lane.name, "Dispatcher stopping, waiting for in-flight jobs");
        let _ = self.semaphore.acquire_many(self.concurrency as u32).await;
        tracing::info!(queue = %self.lane.name, "Queue processor stopped");
    }

    /// How long to sleep when nothing is runnable.
    fn idle_wait(&self) -> Duration {
        match self.store.read(|table| table.next_due(&self.lane.name)) {
            Some(due) => (due - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .clamp(Duration::from_millis(1), MAX_IDLE_WAIT),
            None => MAX_IDLE_WAIT,
        }
    }
}

async fn run_job<S: JobStore>(
    store: Arc<S>,
    lane: Arc<Lane>,
    processor: Arc<dyn Processor>,
    retention: RetentionConfig,
    job: JobRecord,
    permit: OwnedSemaphorePermit,
) {
    let sink: Arc<dyn ProgressSink> = store.clone();
    let handle = JobHandle::new(job.id.clone(), job.queue.clone(), job.payload.clone(), job.attempts_made + 1, sink);

    let outcome = match AssertUnwindSafe(processor.process(handle)).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(JobProcessingError::from_error(e.as_ref())),
        Err(panic) => {
            let message = format!("processor panicked: {}", panic_message(panic.as_ref()));
            tracing::error!(queue = %job.queue, job_id = %job.id, "{}", message);
            Err(JobProcessingError::new(message))
        }
    };

    let recorded = store.write(|table| {
        let disposition = table.finish_attempt(&job.id, outcome, Utc::now());
        let pruned = match disposition {
            AttemptDisposition::Completed => {
                table.prune_finished(&job.queue, JobState::Completed, retention.keep_completed)
            }
            AttemptDisposition::Failed => table.prune_finished(&job.queue, JobState::Failed, retention.keep_failed),
            _ => 0,
        };
        let attempts = table.find(&job.id).map(|j| j.attempts_made).unwrap_or_default();
        (disposition, attempts, pruned)
    });

    match recorded {
        Ok((AttemptDisposition::Failed, attempts, _)) => {
            tracing::warn!(queue = %job.queue, job_id = %job.id, attempts, "Job failed permanently");
        }
        Ok((AttemptDisposition::Retrying, attempts, _)) => {
            tracing::info!(
                queue = %job.queue,
                job_id = %job.id,
                attempts,
                max_attempts = job.options.max_attempts,
                "Job will be retried"
            );
        }
        Ok((AttemptDisposition::Missing, _, _)) => {
            tracing::warn!(queue = %job.queue, job_id = %job.id, "Finished job no longer in store");
        }
        Ok((AttemptDisposition::Completed, _, pruned)) => {
            if pruned > 0 {
                tracing::debug!(queue = %job.queue, pruned, "Pruned completed jobs");
            }
        }
        Err(e) => {
            tracing::error!(queue = %job.queue, job_id = %job.id, error = %e, "Failed to record job outcome");
        }
    }

    drop(permit);
    lane.wake.notify_one();
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::types::BoxError;

    async fn wait_for_state(backend: &MemoryBackend, queue: &str, id: &str, state: JobState) -> JobRecord {
        for _ in 0..200 {
            if let Some(job) = backend.get(queue, id).await.unwrap() {
                if job.state == state {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {}", id, state);
    }

    #[tokio::test]
    async fn test_panicking_processor_fails_job() {
        let backend = MemoryBackend::in_memory(RetentionConfig::default());
        let processor = |_job: JobHandle| async move {
            if true {
                panic!("kaboom");
            }
            Ok::<Value, BoxError>(Value::Null)
        };
        backend.process("q", 1, Arc::new(processor)).await.unwrap();

        let id = backend.add("q", Value::Null, JobOptions::default()).await.unwrap();
        let job = wait_for_state(&backend, "q", &id, JobState::Failed).await;

        assert_eq!(job.attempts_made, 1);
        assert_eq!(job.error.as_deref(), Some("processor panicked: kaboom"));
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_processor_rejected() {
        let backend = MemoryBackend::in_memory(RetentionConfig::default());
        let processor = |_job: JobHandle| async move { Ok::<Value, BoxError>(Value::Null) };

        backend.process("q", 1, Arc::new(processor)).await.unwrap();
        let err = backend.process("q", 1, Arc::new(processor)).await.unwrap_err();

        assert!(matches!(err, QueueError::ProcessorAlreadyRegistered(name) if name == "q"));
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_backend_rejects_jobs() {
        let backend = MemoryBackend::in_memory(RetentionConfig::default());
        backend.close().await.unwrap();

        let err = backend.add("q", Value::Null, JobOptions::default()).await.unwrap_err();
        assert!(matches!(err, QueueError::Closed));
    }

    #[tokio::test]
    async fn test_retention_prunes_completed() {
        let backend = MemoryBackend::in_memory(RetentionConfig {
            keep_completed: 2,
            keep_failed: 2,
        });
        let processor = |_job: JobHandle| async move { Ok::<Value, BoxError>(Value::Bool(true)) };

        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(backend.add("q", Value::Null, JobOptions::default()).await.unwrap());
        }
        backend.process("q", 1, Arc::new(processor)).await.unwrap();
        wait_for_state(&backend, "q", &ids[3], JobState::Completed).await;

        let counts = backend.counts("q").await.unwrap();
        assert_eq!(counts.completed, 2);
        assert!(backend.get("q", &ids[0]).await.unwrap().is_none());
        backend.close().await.unwrap();
    }
}
