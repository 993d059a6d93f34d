//! Job records, options, statuses and errors.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub type JobId = String;

/// Error type processors may return.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
    NotFound,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::NotFound => "not_found",
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Not yet picked up by a worker.
    pub fn is_pending(self) -> bool {
        matches!(self, JobState::Waiting | JobState::Delayed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wait between failed attempts of the same job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    /// `delay_ms * 2^(attempts_made - 1)`
    Exponential { delay_ms: u64 },
}

impl Backoff {
    /// Delay before the next attempt, after `attempts_made` (>= 1) attempts.
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { delay_ms } => {
                let exponent = attempts_made.saturating_sub(1).min(20);
                Duration::from_millis(delay_ms.saturating_mul(1u64 << exponent))
            }
        }
    }
}

/// Per-job enqueue options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// Higher runs first; equal priorities run in enqueue order.
    pub priority: i32,
    /// Time before the job becomes eligible to run.
    pub delay_ms: u64,
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    pub backoff: Option<Backoff>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay_ms: 0,
            max_attempts: 1,
            backoff: None,
        }
    }
}

impl JobOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

/// A stored job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: String,
    /// Enqueue order within the store.
    pub seq: u64,
    pub payload: Value,
    pub options: JobOptions,
    pub state: JobState,
    pub progress: u8,
    pub attempts_made: u32,
    pub created_at: DateTime<Utc>,
    /// When a delayed job becomes eligible.
    pub run_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// One error chain per failed attempt.
    #[serde(default)]
    pub stacktrace: Vec<String>,
}

impl JobRecord {
    /// State as seen at `now`: delayed jobs whose time has come count as waiting.
    pub fn effective_state(&self, now: DateTime<Utc>) -> JobState {
        match (self.state, self.run_at) {
            (JobState::Delayed, Some(at)) if at <= now => JobState::Waiting,
            (state, _) => state,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.effective_state(now) == JobState::Waiting
    }
}

/// What callers see when asking about a job. Always well-formed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: JobId,
    pub queue: String,
    pub status: JobState,
    pub progress: u8,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Remaining delay for delayed jobs.
    pub delay_ms: u64,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub stacktrace: Vec<String>,
}

impl JobStatus {
    pub fn not_found(queue: &str, id: &str) -> Self {
        Self {
            id: id.to_string(),
            queue: queue.to_string(),
            status: JobState::NotFound,
            progress: 0,
            attempts_made: 0,
            max_attempts: 0,
            created_at: None,
            started_at: None,
            finished_at: None,
            delay_ms: 0,
            result: None,
            error: None,
            stacktrace: Vec::new(),
        }
    }

    pub fn from_record(record: &JobRecord, now: DateTime<Utc>) -> Self {
        let state = record.effective_state(now);
        let delay_ms = match (state, record.run_at) {
            (JobState::Delayed, Some(at)) => (at - now).num_milliseconds().max(0) as u64,
            _ => 0,
        };

        Self {
            id: record.id.clone(),
            queue: record.queue.clone(),
            status: state,
            progress: record.progress,
            attempts_made: record.attempts_made,
            max_attempts: record.options.max_attempts,
            created_at: Some(record.created_at),
            started_at: record.started_at,
            finished_at: record.finished_at,
            delay_ms,
            result: record.result.clone(),
            error: record.error.clone(),
            stacktrace: record.stacktrace.clone(),
        }
    }
}

/// Jobs per state for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn add(&mut self, state: JobState) {
        match state {
            JobState::Waiting => self.waiting += 1,
            JobState::Delayed => self.delayed += 1,
            JobState::Active => self.active += 1,
            JobState::Completed => self.completed += 1,
            JobState::Failed => self.failed += 1,
            JobState::NotFound => {}
        }
    }

    /// Jobs competing for a worker right now.
    pub fn backlog(&self) -> u64 {
        self.active + self.waiting
    }

    pub fn finished(&self) -> u64 {
        self.completed + self.failed
    }
}

/// Faults of the queue itself, as opposed to failures of a job.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("job store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("job queue is closed")]
    Closed,

    #[error("a processor is already registered for queue '{0}'")]
    ProcessorAlreadyRegistered(String),

    #[error("invalid job options: {0}")]
    InvalidOptions(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// A processor failure as recorded on the job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct JobProcessingError {
    pub message: String,
    /// The error followed by its sources, outermost first.
    pub chain: Vec<String>,
}

impl JobProcessingError {
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            chain: vec![message.clone()],
            message,
        }
    }

    pub fn from_error(err: &(dyn StdError + 'static)) -> Self {
        let mut chain = vec![err.to_string()];
        let mut source = err.source();
        while let Some(inner) = source {
            chain.push(inner.to_string());
            source = inner.source();
        }
        Self {
            message: err.to_string(),
            chain,
        }
    }

    /// The chain as one multi-line string.
    pub fn trace(&self) -> String {
        self.chain.join("\n  caused by: ")
    }
}
