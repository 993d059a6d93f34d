//! Resilience and job-processing core for an AI-research backend.
//!
//! # Architecture Overview
//!
//! ```text
//!     enqueue ──▶ queue::JobQueue ──▶ backend (durable file store | memory)
//!                      │                        │
//!                      │ backlog throttle       ▼
//!                      │                dispatcher ──▶ Processor(JobHandle)
//!                      │                                    │
//!                      ▼                                    ▼
//!               queue::QueueMonitor           resilience::RateLimiter (pace)
//!                                                           │
//!                                                           ▼
//!                                            resilience::ResilientClient
//!                                              (retry, backoff, timeout)
//!                                                           │
//!                                                           ▼
//!                                            resilience::CircuitBreaker
//!
//!     Cross-cutting: config (TOML, env, hot reload), observability
//!     (tracing, Prometheus), lifecycle (startup, signals, shutdown), admin API
//! ```

pub mod admin;
pub mod config;
pub mod lifecycle;
pub mod observability;
pub mod processors;
pub mod queue;
pub mod resilience;

pub use config::schema::AppConfig;
pub use lifecycle::Shutdown;
pub use queue::JobQueue;
pub use resilience::{ResilienceRegistry, ResilientClient};
