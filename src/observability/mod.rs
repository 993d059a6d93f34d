//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! resilience + queue subsystems produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → Log aggregation (stdout, pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Every retry, circuit transition and queue threshold breach emits both a log and a metric
//! - Metrics are cheap when no recorder is installed

pub mod logging;
pub mod metrics;
