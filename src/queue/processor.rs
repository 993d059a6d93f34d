//! Processor contract.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;

use crate::observability::metrics;
use crate::queue::handle::JobHandle;
use crate::queue::types::BoxError;

/// Work performed for each job of a queue.
///
/// Returning `Ok` completes the job with the value as its result; returning
/// `Err` fails the attempt.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, job: JobHandle) -> Result<Value, BoxError>;
}

#[async_trait]
impl<F, Fut> Processor for F
where
    F: Fn(JobHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
{
    async fn process(&self, job: JobHandle) -> Result<Value, BoxError> {
        (self)(job).await
    }
}

/// Wraps a processor with timing, logs and metrics.
pub(crate) struct Instrumented {
    queue: String,
    inner: Arc<dyn Processor>,
}

impl Instrumented {
    pub(crate) fn new(queue: impl Into<String>, inner: Arc<dyn Processor>) -> Self {
        Self {
            queue: queue.into(),
            inner,
        }
    }
}

#[async_trait]
impl Processor for Instrumented {
    async fn process(&self, job: JobHandle) -> Result<Value, BoxError> {
        let started = Instant::now();
        let job_id = job.id().to_string();
        let attempt = job.attempt();
        tracing::debug!(queue = %self.queue, job_id = %job_id, attempt, "Job started");

        let outcome = self.inner.process(job).await;
        let elapsed = started.elapsed();

        match &outcome {
            Ok(_) => {
                tracing::info!(
                    queue = %self.queue,
                    job_id = %job_id,
                    attempt,
                    duration_ms = elapsed.as_millis() as u64,
                    "Job completed"
                );
                metrics::record_job_finished(&self.queue, "completed", elapsed);
            }
            Err(e) => {
                tracing::warn!(
                    queue = %self.queue,
                    job_id = %job_id,
                    attempt,
                    duration_ms = elapsed.as_millis() as u64,
                    error = %e,
                    "Job attempt failed"
                );
                metrics::record_job_finished(&self.queue, "failed", elapsed);
            }
        }

        outcome
    }
}
