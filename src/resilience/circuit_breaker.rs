//! Circuit breaker for outbound service protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: service assumed down, calls fail fast
//! - Half-Open: trial calls test whether the service recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= failure_threshold
//! Open → Half-Open: first check after reset_timeout has elapsed
//! Half-Open → Closed: consecutive successes >= success_threshold
//! Half-Open → Open: any failure
//! ```
//!
//! While Half-Open at most `half_open_max_calls` trial calls run at once;
//! callers beyond that are rejected as if the circuit were open.
//!
//! # Design Decisions
//! - One breaker per service, shared by every caller of that service
//! - Fail fast in Open state (no network attempt)
//! - Failures are counted consecutively, not over a sliding time window

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::CircuitBreakerConfig;
use crate::observability::metrics;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned instead of calling a service whose circuit is open.
#[derive(Debug, Clone, Error)]
#[error("circuit breaker open for service '{service}', next attempt in {retry_in:?}")]
pub struct CircuitOpenError {
    pub service: String,
    pub retry_in: Duration,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub rejected_calls: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    next_attempt_at: Option<Instant>,
    total_failures: u64,
    total_successes: u64,
    rejected_calls: u64,
    half_open_in_flight: u32,
    /// Bumped on every entry to Half-Open so stale trial slots are ignored.
    half_open_epoch: u64,
}

/// Failure/success state machine guarding one service.
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    failure_threshold: u32,
    success_threshold: u32,
    reset_timeout: Duration,
    half_open_max_calls: u32,
    inner: Mutex<BreakerInner>,
}

/// A claimed half-open trial; frees its slot when dropped.
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    epoch: u64,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        let mut inner = self.breaker.lock();
        if inner.half_open_epoch == self.epoch {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            reset_timeout: config.reset_timeout(),
            half_open_max_calls: config.half_open_max_calls.max(1),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                next_attempt_at: None,
                total_failures: 0,
                total_successes: 0,
                rejected_calls: 0,
                half_open_in_flight: 0,
                half_open_epoch: 0,
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// True while calls must be refused.
    ///
    /// An open circuit whose reset timeout has elapsed moves to Half-Open
    /// here. A Half-Open circuit counts as open while every trial slot is taken.
    pub fn is_open(&self) -> bool {
        let mut inner = self.lock();
        let state = inner.state;
        match state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen => inner.half_open_in_flight >= self.half_open_max_calls,
            CircuitState::Open => {
                if self.reset_due(&inner) {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Whether one more recorded failure would open the circuit.
    pub fn failure_would_trip(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count.saturating_add(1) >= self.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        }
    }

    /// Run `call` unless the circuit is open, recording its outcome.
    pub async fn execute<F, Fut, T, E>(&self, call: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        let slot = match self.try_admit() {
            Ok(slot) => slot,
            Err(e) => return Err(e.into()),
        };

        let result = match call().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        };
        drop(slot);
        result
    }

    /// Admission check for one call, claiming a trial slot when Half-Open.
    fn try_admit(&self) -> Result<Option<TrialSlot<'_>>, CircuitOpenError> {
        let mut inner = self.lock();

        if inner.state == CircuitState::Open && self.reset_due(&inner) {
            self.transition(&mut inner, CircuitState::HalfOpen);
        }

        let state = inner.state;
        match state {
            CircuitState::Closed => return Ok(None),
            CircuitState::HalfOpen if inner.half_open_in_flight < self.half_open_max_calls => {
                inner.half_open_in_flight += 1;
                return Ok(Some(TrialSlot {
                    breaker: self,
                    epoch: inner.half_open_epoch,
                }));
            }
            _ => {}
        }

        inner.rejected_calls += 1;
        let error = self.open_error_locked(&inner);
        drop(inner);

        metrics::record_circuit_rejected(&self.service);
        tracing::debug!(service = %self.service, "Circuit open, call rejected");
        Err(error)
    }

    fn reset_due(&self, inner: &BreakerInner) -> bool {
        !matches!(inner.next_attempt_at, Some(at) if Instant::now() < at)
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.total_successes += 1;

        let state = inner.state;
        match state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.total_failures += 1;
        inner.failure_count = inner.failure_count.saturating_add(1);

        let state = inner.state;
        match state {
            CircuitState::Closed if inner.failure_count >= self.failure_threshold => {
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open),
            _ => {}
        }
    }

    /// Current state without triggering the Open → Half-Open check.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn stats(&self) -> CircuitStats {
        let inner = self.lock();
        CircuitStats {
            service: self.service.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            rejected_calls: inner.rejected_calls,
        }
    }

    /// Force the circuit closed (operator action).
    pub fn reset(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed);
        }
        inner.failure_count = 0;
    }

    /// The error handed to callers while the circuit is open.
    pub fn open_error(&self) -> CircuitOpenError {
        let inner = self.lock();
        self.open_error_locked(&inner)
    }

    fn open_error_locked(&self, inner: &BreakerInner) -> CircuitOpenError {
        let retry_in = inner
            .next_attempt_at
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or_default();

        CircuitOpenError {
            service: self.service.clone(),
            retry_in,
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;

        match to {
            CircuitState::Open => {
                inner.next_attempt_at = Some(Instant::now() + self.reset_timeout);
                inner.success_count = 0;
                tracing::warn!(
                    service = %self.service,
                    from = %from,
                    failures = inner.failure_count,
                    reset_timeout_ms = self.reset_timeout.as_millis() as u64,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.success_count = 0;
                inner.half_open_in_flight = 0;
                inner.half_open_epoch += 1;
                tracing::info!(service = %self.service, "Circuit breaker half-open, allowing trial calls");
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count = 0;
                inner.next_attempt_at = None;
                tracing::info!(service = %self.service, from = %from, "Circuit breaker closed");
            }
        }

        metrics::record_circuit_transition(&self.service, to);
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().expect("circuit breaker mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    fn breaker(failures: u32, successes: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test-service",
            &CircuitBreakerConfig {
                failure_threshold: failures,
                success_threshold: successes,
                reset_timeout_ms: reset_ms,
                half_open_max_calls: 1,
            },
        )
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let cb = breaker(3, 1, 60_000);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(!cb.is_open());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.is_open());
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let cb = breaker(3, 1, 60_000);

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failure_count, 2);
    }

    #[test]
    fn test_half_open_after_reset_timeout() {
        let cb = breaker(1, 1, 20);

        cb.record_failure();
        assert!(cb.is_open());

        std::thread::sleep(Duration::from_millis(30));

        assert!(!cb.is_open());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_closes_after_success_threshold_in_half_open() {
        let cb = breaker(1, 2, 10);

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(!cb.is_open());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);

        let stats = cb.stats();
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.success_count, 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker(3, 2, 10);

        for _ in 0..3 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(20));
        assert!(!cb.is_open());

        cb.record_success();
        cb.record_failure();

        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.is_open());
    }

    #[tokio::test]
    async fn test_execute_skips_call_when_open() {
        let cb = breaker(1, 1, 60_000);
        cb.record_failure();

        let mut called = false;
        let result: Result<(), CircuitOpenError> = cb
            .execute(|| {
                called = true;
                async { Ok(()) }
            })
            .await;

        assert!(!called);
        let err = result.unwrap_err();
        assert_eq!(err.service, "test-service");
        assert!(err.retry_in > Duration::ZERO);
        assert_eq!(cb.stats().rejected_calls, 1);
    }

    #[derive(Debug)]
    enum CallError {
        Open,
        Upstream,
    }

    impl From<CircuitOpenError> for CallError {
        fn from(_: CircuitOpenError) -> Self {
            CallError::Open
        }
    }

    #[tokio::test]
    async fn test_execute_records_outcomes() {
        let cb = breaker(2, 1, 60_000);

        let ok: Result<u32, CallError> = cb.execute(|| async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        for _ in 0..2 {
            let err: Result<u32, CallError> = cb.execute(|| async { Err(CallError::Upstream) }).await;
            assert!(matches!(err, Err(CallError::Upstream)));
        }

        let rejected: Result<u32, CallError> = cb.execute(|| async { Ok(1) }).await;
        assert!(matches!(rejected, Err(CallError::Open)));

        let stats = cb.stats();
        assert_eq!(stats.total_successes, 1);
        assert_eq!(stats.total_failures, 2);
        assert_eq!(stats.state, CircuitState::Open);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_half_open_admits_one_trial_at_a_time() {
        let cb = Arc::new(breaker(1, 1, 10));
        cb.record_failure();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let admitted = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let cb = cb.clone();
            let admitted = admitted.clone();
            handles.push(tokio::spawn(async move {
                let result: Result<(), CircuitOpenError> = cb
                    .execute(|| async move {
                        admitted.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(())
                    })
                    .await;
                result.is_ok()
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap() {
                succeeded += 1;
            }
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 1);
        assert_eq!(succeeded, 1);
        assert_eq!(cb.stats().rejected_calls, 9);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_trial_slot_freed_after_call() {
        let cb = breaker(1, 2, 10);
        cb.record_failure();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let first: Result<u32, CircuitOpenError> = cb.execute(|| async { Ok(1) }).await;
        assert!(first.is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.is_open());

        let second: Result<u32, CircuitOpenError> = cb.execute(|| async { Ok(2) }).await;
        assert!(second.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().rejected_calls, 0);
    }

    #[test]
    fn test_failure_would_trip() {
        let cb = breaker(2, 1, 10);
        assert!(!cb.failure_would_trip());

        cb.record_failure();
        assert!(cb.failure_would_trip());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.failure_would_trip());

        std::thread::sleep(Duration::from_millis(20));
        assert!(!cb.is_open());
        assert!(cb.failure_would_trip());
    }

    #[test]
    fn test_reset_closes_circuit() {
        let cb = breaker(1, 1, 60_000);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(!cb.is_open());
    }
}
