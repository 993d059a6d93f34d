//! Metrics collection and exposition.
//!
//! # Metrics
//! - `circuit_transitions_total` (counter): breaker transitions by service, target state
//! - `circuit_state` (gauge): 0=closed, 1=half_open, 2=open
//! - `circuit_rejected_total` (counter): calls refused while open
//! - `outbound_retries_total` (counter): retried attempts by service
//! - `outbound_failures_total` (counter): final failures by service, reason
//! - `rate_limit_delay_seconds` (histogram): pacing delays by provider, class
//! - `jobs_finished_total` (counter): processor outcomes by queue, outcome
//! - `job_duration_seconds` (histogram): processor latency by queue
//! - `queue_jobs` (gauge): job counts by queue, state
//! - `queue_alerts_total` (counter): monitor threshold breaches by queue, kind
//!
//! Recording is a no-op until a recorder is installed with [`init_metrics`].

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::queue::types::JobCounts;
use crate::resilience::circuit_breaker::CircuitState;

/// Install the Prometheus exporter with an HTTP scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_circuit_transition(service: &str, to: CircuitState) {
    counter!(
        "circuit_transitions_total",
        "service" => service.to_string(),
        "to" => to.as_str()
    )
    .increment(1);

    let value = match to {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    gauge!("circuit_state", "service" => service.to_string()).set(value);
}

pub fn record_circuit_rejected(service: &str) {
    counter!("circuit_rejected_total", "service" => service.to_string()).increment(1);
}

pub fn record_retry(service: &str) {
    counter!("outbound_retries_total", "service" => service.to_string()).increment(1);
}

pub fn record_outbound_failure(service: &str, reason: &'static str) {
    counter!(
        "outbound_failures_total",
        "service" => service.to_string(),
        "reason" => reason
    )
    .increment(1);
}

pub fn record_rate_limit_delay(provider: &str, class: &'static str, delay: Duration) {
    histogram!(
        "rate_limit_delay_seconds",
        "provider" => provider.to_string(),
        "class" => class
    )
    .record(delay.as_secs_f64());
}

pub fn record_job_finished(queue: &str, outcome: &'static str, duration: Duration) {
    counter!(
        "jobs_finished_total",
        "queue" => queue.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!("job_duration_seconds", "queue" => queue.to_string())
        .record(duration.as_secs_f64());
}

pub fn record_queue_counts(queue: &str, counts: &JobCounts) {
    let states = [
        ("waiting", counts.waiting),
        ("delayed", counts.delayed),
        ("active", counts.active),
        ("completed", counts.completed),
        ("failed", counts.failed),
    ];
    for (state, value) in states {
        gauge!("queue_jobs", "queue" => queue.to_string(), "state" => state).set(value as f64);
    }
}

pub fn record_queue_alert(queue: &str, kind: &'static str) {
    counter!(
        "queue_alerts_total",
        "queue" => queue.to_string(),
        "kind" => kind
    )
    .increment(1);
}
