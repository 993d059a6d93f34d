//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the job runtime.
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the research job runtime.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Job queue backend, throttling, retention and monitoring.
    pub queue: QueueConfig,

    /// Circuit breaker thresholds shared by every outbound service.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Retry policy for outbound HTTP calls.
    pub retries: RetryConfig,

    /// Per-provider sliding-window limits.
    pub rate_limits: RateLimitsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub admin: AdminConfig,
}

/// Which queue backend strategy to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Journalled store that survives restarts.
    Durable,
    /// In-process fallback; jobs are lost on exit.
    #[default]
    Memory,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Durable => "durable",
            BackendKind::Memory => "memory",
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "durable" => Ok(BackendKind::Durable),
            "memory" | "fallback" => Ok(BackendKind::Memory),
            other => Err(format!("unknown queue backend '{}'", other)),
        }
    }
}

/// Job queue configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Backend strategy, chosen once at construction.
    pub backend: BackendKind,

    /// Journal file for the durable backend.
    pub data_path: String,

    /// Concurrency used when a processor is registered without one.
    pub default_concurrency: usize,

    /// Backlog-based delay injection for expensive jobs.
    pub throttle: ThrottleConfig,

    /// How many finished jobs to keep per queue.
    pub retention: RetentionConfig,

    /// Periodic queue health checks.
    pub monitor: MonitorConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            data_path: "data/jobs.json".to_string(),
            default_concurrency: 2,
            throttle: ThrottleConfig::default(),
            retention: RetentionConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

/// Enqueue-time admission shaping for rate-limited job classes.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Enable delay injection.
    pub enabled: bool,

    /// Payload key that marks a job as rate limited (boolean `true`,
    /// or the value of the payload's `type` field).
    pub payload_flag: String,

    /// Active + waiting jobs tolerated before delaying new ones.
    pub backlog_threshold: u64,

    /// Delay added per job in the backlog, in milliseconds.
    pub per_job_delay_ms: u64,

    /// Lower bound for any injected delay, in milliseconds.
    pub min_delay_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            payload_flag: "deep_research".to_string(),
            backlog_threshold: 2,
            per_job_delay_ms: 10_000,
            min_delay_ms: 5_000,
        }
    }
}

/// Retention of finished jobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_completed: 1_000,
            keep_failed: 5_000,
        }
    }
}

/// Queue monitor configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Enable the periodic monitor.
    pub enabled: bool,

    /// Check interval in seconds.
    pub interval_secs: u64,

    /// Warn when more jobs than this are waiting.
    pub backlog_threshold: u64,

    /// Warn when failed / (completed + failed) exceeds this ratio.
    pub failure_rate_threshold: f64,

    /// Finished jobs required before the failure rate is evaluated.
    pub min_finished_for_rate: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            backlog_threshold: 100,
            failure_rate_threshold: 0.1,
            min_finished_for_rate: 10,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,

    /// Consecutive half-open successes before the circuit closes.
    pub success_threshold: u32,

    /// Time spent open before a trial call is allowed, in milliseconds.
    pub reset_timeout_ms: u64,

    /// Trial calls allowed in flight at once while half-open.
    pub half_open_max_calls: u32,
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_ms: 60_000,
            half_open_max_calls: 1,
        }
    }
}

/// Retry configuration for outbound calls.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Ceiling for any single retry delay in milliseconds.
    pub max_delay_ms: u64,

    /// Per-attempt timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            request_timeout_secs: 30,
        }
    }
}

/// Sliding-window ceilings for a single provider.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProviderLimits {
    /// Requests allowed per standard window.
    pub max_requests: u32,

    /// Standard window length in milliseconds.
    pub window_ms: u64,

    /// Requests allowed per expensive window; `None` disables the class limit.
    pub expensive_max_requests: Option<u32>,

    /// Expensive window length in milliseconds.
    pub expensive_window_ms: u64,
}

impl ProviderLimits {
    /// Limits used to pace providers nobody configured.
    pub fn conservative() -> Self {
        Self {
            max_requests: 10,
            window_ms: 60_000,
            expensive_max_requests: Some(1),
            expensive_window_ms: 3_600_000,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn expensive_window(&self) -> Duration {
        Duration::from_millis(self.expensive_window_ms)
    }
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window_ms: 60_000,
            expensive_max_requests: None,
            expensive_window_ms: 3_600_000,
        }
    }
}

/// Rate limiting configuration keyed by provider name.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitsConfig {
    pub providers: HashMap<String, ProviderLimits>,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        let mut providers = HashMap::new();
        providers.insert(
            "openai".to_string(),
            ProviderLimits {
                max_requests: 60,
                expensive_max_requests: Some(5),
                ..ProviderLimits::default()
            },
        );
        providers.insert(
            "perplexity".to_string(),
            ProviderLimits {
                max_requests: 20,
                expensive_max_requests: Some(3),
                ..ProviderLimits::default()
            },
        );
        Self { providers }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
