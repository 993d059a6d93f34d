//! Job queue subsystem.
//!
//! # Data Flow
//! ```text
//! enqueue_job (job_queue.rs)
//!     → backlog throttle for rate-limited jobs
//!     → QueueBackend::add (backend.rs)
//!         → engine.rs dispatcher claims jobs from store.rs
//!         → processor.rs (instrumented) runs with a JobHandle (handle.rs)
//!         → outcome recorded, retried or failed, retention applied
//!
//! monitor.rs: periodic counts → metrics and threshold warnings
//! ```
//!
//! # Design Decisions
//! - Backend strategy chosen once: durable (file store) or memory
//! - Status queries for unknown jobs return `not_found`, never an error
//! - Cancellation only before a job starts

pub mod backend;
pub mod engine;
pub mod handle;
pub mod job_queue;
pub mod monitor;
pub mod processor;
pub mod store;
pub mod types;

pub use backend::QueueBackend;
pub use engine::{DurableBackend, LocalBackend, MemoryBackend};
pub use handle::JobHandle;
pub use job_queue::{JobQueue, QueueInfo};
pub use monitor::{QueueAlert, QueueMonitor};
pub use processor::Processor;
pub use types::{
    Backoff, BoxError, JobCounts, JobId, JobOptions, JobProcessingError, JobRecord, JobState, JobStatus,
    QueueError, QueueResult,
};
