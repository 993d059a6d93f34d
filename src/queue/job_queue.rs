//! Job queue facade.
//!
//! # Responsibilities
//! - Pick the backend strategy once, from configuration
//! - Keep the registry of known queues
//! - Shape admission of rate-limited jobs with a backlog-based delay
//! - Wrap processors with timing and logging
//! - Answer status queries with a well-formed status, never an error

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;

use crate::config::{BackendKind, QueueConfig, ThrottleConfig};
use crate::queue::backend::QueueBackend;
use crate::queue::engine::{DurableBackend, MemoryBackend};
use crate::queue::processor::{Instrumented, Processor};
use crate::queue::types::{JobCounts, JobId, JobOptions, JobStatus, QueueResult};

/// A queue the facade has seen.
#[derive(Debug, Clone, Serialize)]
pub struct QueueInfo {
    pub name: String,
    pub concurrency: Option<usize>,
    pub created_at: DateTime<Utc>,
}

pub struct JobQueue {
    backend: Arc<dyn QueueBackend>,
    queues: DashMap<String, QueueInfo>,
    throttle: ThrottleConfig,
    default_concurrency: usize,
}

impl JobQueue {
    pub fn new(backend: Arc<dyn QueueBackend>, config: &QueueConfig) -> Self {
        Self {
            backend,
            queues: DashMap::new(),
            throttle: config.throttle.clone(),
            default_concurrency: config.default_concurrency.max(1),
        }
    }

    /// Build the backend named by `config.backend`.
    pub fn from_config(config: &QueueConfig) -> QueueResult<Self> {
        let backend: Arc<dyn QueueBackend> = match config.backend {
            BackendKind::Durable => Arc::new(DurableBackend::open(&config.data_path, config.retention.clone())?),
            BackendKind::Memory => Arc::new(MemoryBackend::in_memory(config.retention.clone())),
        };
        tracing::info!(backend = config.backend.as_str(), "Job queue initialised");
        Ok(Self::new(backend, config))
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Add a job, delaying rate-limited jobs when the queue is backed up.
    pub async fn enqueue_job(&self, queue: &str, payload: Value, mut options: JobOptions) -> QueueResult<JobId> {
        self.touch(queue);

        if self.is_throttled(&payload) {
            let counts = self.backend.counts(queue).await?;
            if let Some(extra) = self.throttle_delay(counts.backlog()) {
                tracing::info!(
                    queue = %queue,
                    backlog = counts.backlog(),
                    delay_ms = extra.as_millis() as u64,
                    "Delaying rate-limited job"
                );
                options.delay_ms = options.delay_ms.saturating_add(extra.as_millis() as u64);
            }
        }

        self.backend.add(queue, payload, options).await
    }

    /// Status of a job. Unknown ids, and store faults, yield `not_found`.
    pub async fn get_job_status(&self, queue: &str, id: &str) -> JobStatus {
        match self.backend.get(queue, id).await {
            Ok(Some(record)) => JobStatus::from_record(&record, Utc::now()),
            Ok(None) => JobStatus::not_found(queue, id),
            Err(e) => {
                tracing::error!(queue = %queue, job_id = %id, error = %e, "Failed to read job status");
                let mut status = JobStatus::not_found(queue, id);
                status.error = Some(e.to_string());
                status
            }
        }
    }

    /// Start processing `queue`; `None` uses the configured default concurrency.
    pub async fn register_processor<P: Processor>(
        &self,
        queue: &str,
        processor: P,
        concurrency: Option<usize>,
    ) -> QueueResult<()> {
        let concurrency = concurrency.unwrap_or(self.default_concurrency).max(1);
        let wrapped = Instrumented::new(queue, Arc::new(processor));
        self.backend.process(queue, concurrency, Arc::new(wrapped)).await?;

        self.touch(queue);
        if let Some(mut info) = self.queues.get_mut(queue) {
            info.concurrency = Some(concurrency);
        }
        Ok(())
    }

    pub async fn get_job_counts(&self, queue: &str) -> QueueResult<JobCounts> {
        self.backend.counts(queue).await
    }

    pub async fn pause_queue(&self, queue: &str) -> QueueResult<()> {
        self.touch(queue);
        self.backend.pause(queue).await
    }

    pub async fn resume_queue(&self, queue: &str) -> QueueResult<()> {
        self.touch(queue);
        self.backend.resume(queue).await
    }

    pub async fn is_paused(&self, queue: &str) -> bool {
        self.backend.is_paused(queue).await
    }

    /// Remove a job that has not started. Active, finished and unknown jobs
    /// are left alone and yield false.
    pub async fn cancel_job(&self, id: &str) -> QueueResult<bool> {
        self.backend.remove(id).await
    }

    /// Every known queue: registered here or present in the backend.
    pub async fn queue_names(&self) -> Vec<String> {
        let mut names = self.backend.queues().await;
        names.extend(self.queues.iter().map(|q| q.key().clone()));
        names.sort();
        names.dedup();
        names
    }

    pub fn queue_info(&self, queue: &str) -> Option<QueueInfo> {
        self.queues.get(queue).map(|q| q.value().clone())
    }

    /// Stop dispatching, wait for in-flight jobs and flush the backend.
    pub async fn close(&self) -> QueueResult<()> {
        tracing::info!("Closing job queue");
        self.backend.close().await
    }

    /// Whether `payload` belongs to the rate-limited class: the flag key set
    /// to `true`, or a `type` field equal to the flag.
    pub fn is_throttled(&self, payload: &Value) -> bool {
        if !self.throttle.enabled {
            return false;
        }
        let flag = self.throttle.payload_flag.as_str();
        payload.get(flag).and_then(Value::as_bool).unwrap_or(false)
            || payload.get("type").and_then(Value::as_str) == Some(flag)
    }

    /// Extra delay for a rate-limited job given the current backlog.
    pub fn throttle_delay(&self, backlog: u64) -> Option<Duration> {
        if backlog <= self.throttle.backlog_threshold {
            return None;
        }
        let proportional = backlog.saturating_mul(self.throttle.per_job_delay_ms);
        Some(Duration::from_millis(proportional.max(self.throttle.min_delay_ms)))
    }

    fn touch(&self, queue: &str) {
        if self.queues.contains_key(queue) {
            return;
        }
        self.queues.entry(queue.to_string()).or_insert_with(|| QueueInfo {
            name: queue.to_string(),
            concurrency: None,
            created_at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue() -> JobQueue {
        JobQueue::new(
            Arc::new(MemoryBackend::in_memory(Default::default())),
            &QueueConfig::default(),
        )
    }

    #[test]
    fn test_throttle_flag_detection() {
        let q = queue();
        assert!(q.is_throttled(&json!({ "deep_research": true })));
        assert!(q.is_throttled(&json!({ "type": "deep_research" })));
        assert!(!q.is_throttled(&json!({ "deep_research": false })));
        assert!(!q.is_throttled(&json!({ "type": "chat" })));
    }

    #[test]
    fn test_throttle_delay_grows_with_backlog() {
        let q = queue();
        assert_eq!(q.throttle_delay(0), None);
        assert_eq!(q.throttle_delay(2), None);
        assert_eq!(q.throttle_delay(3), Some(Duration::from_secs(30)));
        assert_eq!(q.throttle_delay(5), Some(Duration::from_secs(50)));
    }

    #[test]
    fn test_throttle_delay_has_minimum() {
        let mut config = QueueConfig::default();
        config.throttle.per_job_delay_ms = 1;
        let q = JobQueue::new(Arc::new(MemoryBackend::in_memory(Default::default())), &config);

        assert_eq!(q.throttle_delay(3), Some(Duration::from_millis(5_000)));
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let q = queue();
        let status = q.get_job_status("research", "nope").await;
        assert_eq!(status.status, crate::queue::types::JobState::NotFound);
        assert_eq!(status.id, "nope");
        assert!(status.error.is_none());
    }

    #[tokio::test]
    async fn test_queue_registry_tracks_names() {
        let q = queue();
        q.enqueue_job("b", json!({}), JobOptions::default()).await.unwrap();
        q.pause_queue("a").await.unwrap();

        assert_eq!(q.queue_names().await, vec!["a", "b"]);
        assert!(q.is_paused("a").await);
        assert!(q.queue_info("b").is_some());
    }
}
