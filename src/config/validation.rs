//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thresholds > 0, windows > 0, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: AppConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::{AppConfig, BackendKind, ProviderLimits};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &AppConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let queue = &config.queue;
    if queue.backend == BackendKind::Durable && queue.data_path.trim().is_empty() {
        errors.push(ValidationError::new(
            "queue.data_path",
            "durable backend requires a data path",
        ));
    }
    if queue.default_concurrency == 0 {
        errors.push(ValidationError::new("queue.default_concurrency", "must be at least 1"));
    }
    if queue.monitor.enabled && queue.monitor.interval_secs == 0 {
        errors.push(ValidationError::new("queue.monitor.interval_secs", "must be at least 1"));
    }
    if !(0.0..=1.0).contains(&queue.monitor.failure_rate_threshold) {
        errors.push(ValidationError::new(
            "queue.monitor.failure_rate_threshold",
            "must be between 0.0 and 1.0",
        ));
    }

    let breaker = &config.circuit_breaker;
    if breaker.failure_threshold == 0 {
        errors.push(ValidationError::new("circuit_breaker.failure_threshold", "must be at least 1"));
    }
    if breaker.success_threshold == 0 {
        errors.push(ValidationError::new("circuit_breaker.success_threshold", "must be at least 1"));
    }
    if breaker.half_open_max_calls == 0 {
        errors.push(ValidationError::new("circuit_breaker.half_open_max_calls", "must be at least 1"));
    }

    let retries = &config.retries;
    if retries.max_delay_ms < retries.base_delay_ms {
        errors.push(ValidationError::new(
            "retries.max_delay_ms",
            "must not be smaller than base_delay_ms",
        ));
    }
    if retries.request_timeout_secs == 0 {
        errors.push(ValidationError::new("retries.request_timeout_secs", "must be at least 1"));
    }

    let mut providers: Vec<_> = config.rate_limits.providers.iter().collect();
    providers.sort_by(|a, b| a.0.cmp(b.0));
    for (name, limits) in providers {
        validate_provider(name, limits, &mut errors);
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "not a valid socket address",
        ));
    }

    if config.admin.enabled {
        if config.admin.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new("admin.bind_address", "not a valid socket address"));
        }
        if config.admin.api_key.trim().is_empty() {
            errors.push(ValidationError::new("admin.api_key", "must not be empty"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Check one provider's limits, as loaded or after a live update.
pub fn validate_provider(name: &str, limits: &ProviderLimits, errors: &mut Vec<ValidationError>) {
    let prefix = format!("rate_limits.providers.{}", name);
    if limits.max_requests == 0 {
        errors.push(ValidationError::new(format!("{}.max_requests", prefix), "must be at least 1"));
    }
    if limits.window_ms == 0 {
        errors.push(ValidationError::new(format!("{}.window_ms", prefix), "must be at least 1"));
    }
    if limits.expensive_max_requests == Some(0) {
        errors.push(ValidationError::new(
            format!("{}.expensive_max_requests", prefix),
            "must be at least 1 when set",
        ));
    }
    if limits.expensive_max_requests.is_some() && limits.expensive_window_ms == 0 {
        errors.push(ValidationError::new(
            format!("{}.expensive_window_ms", prefix),
            "must be at least 1",
        ));
    }
}
