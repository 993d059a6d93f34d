//! Retry policy.
//!
//! # Responsibilities
//! - Decide which HTTP outcomes are retryable
//! - Parse server-provided `Retry-After` hints
//! - Turn configuration into per-attempt delays
//!
//! # Design Decisions
//! - Connection errors and timeouts are always retryable
//! - 408, 429 and 500/502/503/504 are retryable; other statuses fail immediately
//! - `Retry-After` wins over computed backoff when the server sends one

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::RetryConfig;
use crate::resilience::backoff::retry_delay;

/// Status codes worth another attempt.
pub const RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// Parse a `Retry-After` header value: delta-seconds or an HTTP date.
///
/// Dates in the past yield a zero delay.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    parse_retry_after_at(value, Utc::now())
}

fn parse_retry_after_at(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// Retry behaviour for one client.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub request_timeout: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        retry_delay(attempt, self.base_delay, self.max_delay, retry_after)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(is_retryable_status(status), "{} should retry", status);
        }
        for status in [400, 401, 403, 404, 422, 501] {
            assert!(!is_retryable_status(status), "{} should not retry", status);
        }
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("2"), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after(" 120 "), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let now = DateTime::parse_from_rfc2822("Wed, 21 Oct 2015 07:28:00 GMT")
            .unwrap()
            .with_timezone(&Utc);

        let delay = parse_retry_after_at("Wed, 21 Oct 2015 07:28:30 GMT", now);
        assert_eq!(delay, Some(Duration::from_secs(30)));

        let past = parse_retry_after_at("Wed, 21 Oct 2015 07:00:00 GMT", now);
        assert_eq!(past, Some(Duration::ZERO));
    }

    #[test]
    fn test_policy_from_config() {
        let policy = RetryPolicy::from(&RetryConfig {
            max_retries: 2,
            base_delay_ms: 250,
            max_delay_ms: 4_000,
            request_timeout_secs: 5,
        });

        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(policy.delay_for(0, Some(Duration::from_secs(10))), Duration::from_secs(4));
    }
}
