//! Job storage.
//!
//! # Responsibilities
//! - Hold every job record of every queue
//! - Pick the next runnable job (priority, then enqueue order)
//! - Apply attempt outcomes, retries and retention
//! - Persist snapshots for the durable backend
//!
//! # Design Decisions
//! - All mutation goes through [`JobTable`]; stores only decide where it lives
//! - The file store is write-behind: changes mark the table dirty and a
//!   background thread rewrites the snapshot (temp file + rename), so callers
//!   never wait on disk; bursts of changes coalesce into one rewrite
//! - `flush` persists synchronously and runs on close
//! - Jobs found active on reopen were interrupted by a crash and go back to waiting

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::BackendKind;
use crate::queue::types::{JobCounts, JobId, JobProcessingError, JobRecord, JobState, QueueResult};

/// Outcome of one processor run.
pub type AttemptOutcome = Result<Value, JobProcessingError>;

/// What happened to a job after an attempt was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptDisposition {
    Completed,
    /// Another attempt is scheduled.
    Retrying,
    Failed,
    /// The job no longer exists.
    Missing,
}

/// In-memory table of jobs across all queues.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct JobTable {
    next_seq: u64,
    jobs: HashMap<JobId, JobRecord>,
    #[serde(skip)]
    dirty: bool,
}

impl JobTable {
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub fn insert(&mut self, record: JobRecord) {
        self.next_seq = self.next_seq.max(record.seq + 1);
        self.jobs.insert(record.id.clone(), record);
        self.dirty = true;
    }

    pub fn get(&self, queue: &str, id: &str) -> Option<&JobRecord> {
        self.jobs.get(id).filter(|job| job.queue == queue)
    }

    pub fn find(&self, id: &str) -> Option<&JobRecord> {
        self.jobs.get(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn counts(&self, queue: &str, now: DateTime<Utc>) -> JobCounts {
        let mut counts = JobCounts::default();
        for job in self.jobs.values().filter(|job| job.queue == queue) {
            counts.add(job.effective_state(now));
        }
        counts
    }

    /// Mark the best runnable job of `queue` active and return it.
    pub fn claim_next(&mut self, queue: &str, now: DateTime<Utc>) -> Option<JobRecord> {
        let id = self
            .jobs
            .values()
            .filter(|job| job.queue == queue && job.is_ready(now))
            .min_by(|a, b| b.options.priority.cmp(&a.options.priority).then(a.seq.cmp(&b.seq)))
            .map(|job| job.id.clone())?;

        let job = self.jobs.get_mut(&id)?;
        job.state = JobState::Active;
        job.run_at = None;
        job.started_at = Some(now);
        self.dirty = true;
        Some(job.clone())
    }

    /// Earliest time a delayed job of `queue` becomes runnable.
    pub fn next_due(&self, queue: &str) -> Option<DateTime<Utc>> {
        self.jobs
            .values()
            .filter(|job| job.queue == queue && job.state == JobState::Delayed)
            .filter_map(|job| job.run_at)
            .min()
    }

    pub fn set_progress(&mut self, id: &str, percent: u8) -> bool {
        match self.jobs.get_mut(id) {
            Some(job) if job.state == JobState::Active => {
                job.progress = percent.min(100);
                self.dirty = true;
                true
            }
            _ => false,
        }
    }

    /// Record the outcome of an attempt and decide whether to retry.
    pub fn finish_attempt(&mut self, id: &str, outcome: AttemptOutcome, now: DateTime<Utc>) -> AttemptDisposition {
        let Some(job) = self.jobs.get_mut(id) else {
            return AttemptDisposition::Missing;
        };
        self.dirty = true;
        job.attempts_made += 1;

        match outcome {
            Ok(result) => {
                job.state = JobState::Completed;
                job.progress = 100;
                job.result = Some(result);
                job.error = None;
                job.finished_at = Some(now);
                AttemptDisposition::Completed
            }
            Err(err) => {
                job.error = Some(err.message.clone());
                job.stacktrace.push(err.trace());

                if job.attempts_made < job.options.max_attempts {
                    let delay = job
                        .options
                        .backoff
                        .map(|b| b.delay_after(job.attempts_made))
                        .unwrap_or_default();
                    job.progress = 0;
                    job.started_at = None;
                    if delay.is_zero() {
                        job.state = JobState::Waiting;
                        job.run_at = None;
                    } else {
                        job.state = JobState::Delayed;
                        job.run_at = Some(now + to_chrono(delay));
                    }
                    AttemptDisposition::Retrying
                } else {
                    job.state = JobState::Failed;
                    job.finished_at = Some(now);
                    AttemptDisposition::Failed
                }
            }
        }
    }

    /// Remove a job that has not started yet.
    pub fn remove_pending(&mut self, id: &str) -> Option<JobRecord> {
        match self.jobs.get(id) {
            Some(job) if job.state.is_pending() => {
                self.dirty = true;
                self.jobs.remove(id)
            }
            _ => None,
        }
    }

    /// Drop the oldest finished jobs in `state` beyond `keep`. Returns how many were removed.
    pub fn prune_finished(&mut self, queue: &str, state: JobState, keep: usize) -> usize {
        let mut finished: Vec<(Option<DateTime<Utc>>, u64, JobId)> = self
            .jobs
            .values()
            .filter(|job| job.queue == queue && job.state == state)
            .map(|job| (job.finished_at, job.seq, job.id.clone()))
            .collect();

        if finished.len() <= keep {
            return 0;
        }

        finished.sort();
        let excess = finished.len() - keep;
        for (_, _, id) in finished.into_iter().take(excess) {
            self.jobs.remove(&id);
        }
        self.dirty = true;
        excess
    }

    /// Return interrupted active jobs to waiting. Returns how many were recovered.
    pub fn recover_active(&mut self) -> usize {
        let mut recovered = 0;
        for job in self.jobs.values_mut().filter(|job| job.state == JobState::Active) {
            job.state = JobState::Waiting;
            job.started_at = None;
            job.progress = 0;
            recovered += 1;
        }
        if recovered > 0 {
            self.dirty = true;
        }
        recovered
    }

    /// Every queue name with at least one job.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.values().map(|job| job.queue.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

fn to_chrono(delay: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Where the job table lives.
pub trait JobStore: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    fn read<R>(&self, f: impl FnOnce(&JobTable) -> R) -> R;

    /// Mutate the table. Durable stores persist the change in the background.
    fn write<R>(&self, f: impl FnOnce(&mut JobTable) -> R) -> QueueResult<R>;

    /// Persist anything still pending.
    fn flush(&self) -> QueueResult<()>;
}

/// Process-local store; jobs are lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    table: Mutex<JobTable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, JobTable> {
        self.table.lock().expect("job table mutex poisoned")
    }
}

impl JobStore for MemoryStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn read<R>(&self, f: impl FnOnce(&JobTable) -> R) -> R {
        f(&self.lock())
    }

    fn write<R>(&self, f: impl FnOnce(&mut JobTable) -> R) -> QueueResult<R> {
        let mut table = self.lock();
        let result = f(&mut table);
        table.take_dirty();
        Ok(result)
    }

    fn flush(&self) -> QueueResult<()> {
        Ok(())
    }
}

/// Store backed by a JSON snapshot on disk; survives restarts.
#[derive(Debug)]
pub struct FileStore {
    shared: Arc<FileShared>,
    flusher: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct FileShared {
    path: PathBuf,
    table: Mutex<JobTable>,
    /// Serializes snapshot writes so an older table never lands last.
    io: Mutex<()>,
    signal: Mutex<FlushSignal>,
    wake: Condvar,
}

#[derive(Debug, Default)]
struct FlushSignal {
    pending: bool,
    stop: bool,
}

impl FileStore {
    /// Open (or create) the snapshot at `path`.
    pub fn open(path: impl AsRef<Path>) -> QueueResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut table = if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            let table: JobTable = serde_json::from_reader(reader)?;
            tracing::info!(path = %path.display(), jobs = table.len(), "Loaded job store snapshot");
            table
        } else {
            JobTable::default()
        };

        let recovered = table.recover_active();
        if recovered > 0 {
            tracing::warn!(recovered, "Returned interrupted active jobs to waiting");
        }
        table.dirty = true;

        let shared = Arc::new(FileShared {
            path,
            table: Mutex::new(table),
            io: Mutex::new(()),
            signal: Mutex::new(FlushSignal::default()),
            wake: Condvar::new(),
        });
        shared.persist_pending()?;

        let worker = shared.clone();
        let flusher = std::thread::Builder::new()
            .name("job-store-flusher".into())
            .spawn(move || worker.run_flusher())?;

        Ok(Self {
            shared,
            flusher: Some(flusher),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }
}

impl FileShared {
    fn run_flusher(&self) {
        loop {
            {
                let mut signal = self.signal.lock().expect("flush signal mutex poisoned");
                while !signal.pending && !signal.stop {
                    signal = self.wake.wait(signal).expect("flush signal mutex poisoned");
                }
                if signal.stop {
                    return;
                }
                signal.pending = false;
            }

            if let Err(e) = self.persist_pending() {
                tracing::error!(path = %self.path.display(), error = %e, "Failed to persist job store");
            }
        }
    }

    fn request_flush(&self) {
        self.signal.lock().expect("flush signal mutex poisoned").pending = true;
        self.wake.notify_one();
    }

    /// Write the table if it changed since the last snapshot.
    ///
    /// The table lock is only held while serializing.
    fn persist_pending(&self) -> QueueResult<()> {
        let _io = self.io.lock().expect("job store io mutex poisoned");

        let snapshot = {
            let mut table = self.lock();
            if !table.take_dirty() {
                return Ok(());
            }
            match serde_json::to_vec(&*table) {
                Ok(bytes) => bytes,
                Err(e) => {
                    table.dirty = true;
                    return Err(e.into());
                }
            }
        };

        if let Err(e) = self.write_snapshot(&snapshot) {
            self.lock().dirty = true;
            return Err(e);
        }
        Ok(())
    }

    fn write_snapshot(&self, snapshot: &[u8]) -> QueueResult<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            writer.write_all(snapshot)?;
            writer.flush()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, JobTable> {
        self.table.lock().expect("job table mutex poisoned")
    }
}

impl JobStore for FileStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Durable
    }

    fn read<R>(&self, f: impl FnOnce(&JobTable) -> R) -> R {
        f(&self.shared.lock())
    }

    fn write<R>(&self, f: impl FnOnce(&mut JobTable) -> R) -> QueueResult<R> {
        let (result, dirty) = {
            let mut table = self.shared.lock();
            let result = f(&mut table);
            (result, table.dirty)
        };
        if dirty {
            self.shared.request_flush();
        }
        Ok(result)
    }

    fn flush(&self) -> QueueResult<()> {
        self.shared.persist_pending()
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        self.shared.signal.lock().expect("flush signal mutex poisoned").stop = true;
        self.shared.wake.notify_one();
        if let Some(flusher) = self.flusher.take() {
            if flusher.join().is_err() {
                tracing::error!("Job store flusher thread panicked");
            }
        }
        if let Err(e) = self.shared.persist_pending() {
            tracing::error!(path = %self.shared.path.display(), error = %e, "Failed to persist job store on drop");
        }
    }
}
