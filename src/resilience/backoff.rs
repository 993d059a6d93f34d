//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Upper bound of the random jitter, as a fraction of the exponential delay.
const JITTER_FACTOR: f64 = 0.3;

/// Attempts after this one get the escalation multiplier.
const ESCALATE_AFTER_ATTEMPT: u32 = 2;
const ESCALATION_MULTIPLIER: f64 = 1.5;

/// Calculate the wait before retrying after the failed `attempt` (0-based).
///
/// `base * 2^attempt`, plus up to 30% jitter, times 1.5 once `attempt > 2`,
/// capped at `max`.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponential = base.as_millis() as f64 * 2f64.powi(attempt.min(32) as i32);
    let jitter = exponential * rand::thread_rng().gen_range(0.0..JITTER_FACTOR);

    let mut delay = exponential + jitter;
    if attempt > ESCALATE_AFTER_ATTEMPT {
        delay *= ESCALATION_MULTIPLIER;
    }

    let capped = delay.min(max.as_millis() as f64);
    Duration::from_millis(capped as u64)
}

/// Honour a server-provided `Retry-After` when present, otherwise back off.
///
/// Both paths are capped at `max`.
pub fn retry_delay(
    attempt: u32,
    base: Duration,
    max: Duration,
    retry_after: Option<Duration>,
) -> Duration {
    match retry_after {
        Some(server_delay) => server_delay.min(max),
        None => calculate_backoff(attempt, base, max),
    }
}
