//! The view of a job handed to its processor.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::queue::store::JobStore;
use crate::queue::types::{JobId, QueueResult};

/// Receives progress reports for running jobs.
pub trait ProgressSink: Send + Sync {
    fn report_progress(&self, job_id: &str, percent: u8) -> QueueResult<bool>;
}

impl<S: JobStore> ProgressSink for S {
    fn report_progress(&self, job_id: &str, percent: u8) -> QueueResult<bool> {
        self.write(|table| table.set_progress(job_id, percent))
    }
}

/// A running job: its identity, payload and a progress channel.
#[derive(Clone)]
pub struct JobHandle {
    id: JobId,
    queue: String,
    payload: Value,
    attempt: u32,
    sink: Arc<dyn ProgressSink>,
}

impl JobHandle {
    pub fn new(id: JobId, queue: String, payload: Value, attempt: u32, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            id,
            queue,
            payload,
            attempt,
            sink,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Deserialize the payload into `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    /// 1-based number of the attempt being run.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record progress; values above 100 are clamped.
    pub fn report_progress(&self, percent: u8) -> QueueResult<()> {
        let percent = percent.min(100);
        if !self.sink.report_progress(&self.id, percent)? {
            tracing::debug!(job_id = %self.id, queue = %self.queue, "Progress for inactive job ignored");
        }
        Ok(())
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("attempt", &self.attempt)
            .finish()
    }
}
