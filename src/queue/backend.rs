//! Backend strategy contract.
//!
//! The job queue talks to exactly one backend, chosen at construction. Both
//! the durable and the in-process backend satisfy this trait identically.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::BackendKind;
use crate::queue::processor::Processor;
use crate::queue::types::{JobCounts, JobId, JobOptions, JobRecord, QueueResult};

#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Store a new job and return its id.
    async fn add(&self, queue: &str, payload: Value, options: JobOptions) -> QueueResult<JobId>;

    async fn get(&self, queue: &str, id: &str) -> QueueResult<Option<JobRecord>>;

    /// Start running jobs of `queue` with at most `concurrency` in flight.
    async fn process(&self, queue: &str, concurrency: usize, processor: Arc<dyn Processor>) -> QueueResult<()>;

    async fn counts(&self, queue: &str) -> QueueResult<JobCounts>;

    /// Remove a job that has not started. Returns false if it is active,
    /// finished or unknown.
    async fn remove(&self, id: &str) -> QueueResult<bool>;

    async fn pause(&self, queue: &str) -> QueueResult<()>;

    async fn resume(&self, queue: &str) -> QueueResult<()>;

    async fn is_paused(&self, queue: &str) -> bool;

    /// Queues the backend holds jobs for.
    async fn queues(&self) -> Vec<String>;

    /// Stop dispatching, wait for in-flight jobs and flush storage.
    async fn close(&self) -> QueueResult<()>;
}
