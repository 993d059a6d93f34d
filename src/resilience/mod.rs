//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound call:
//!     → rate_limit.rs (pace per provider, never rejects)
//!     → client.rs (attempt loop inside the service's circuit breaker)
//!         → timeouts.rs (per-attempt deadline)
//!         → retries.rs / backoff.rs (retryable? how long to wait?)
//!     → circuit_breaker.rs (track outcomes, fail fast while open)
//! ```
//!
//! # Design Decisions
//! - Every outbound attempt has a deadline
//! - Breakers and the limiter are shared per service/provider via `registry.rs`
//! - Retries see `Retry-After` before computed backoff

pub mod backoff;
pub mod circuit_breaker;
pub mod client;
pub mod error;
pub mod rate_limit;
pub mod registry;
pub mod retries;
pub mod timeouts;

pub use circuit_breaker::{CircuitBreaker, CircuitOpenError, CircuitState, CircuitStats};
pub use client::{CallSpec, ResilientClient};
pub use error::{ClientError, TransportFailure};
pub use rate_limit::{ProviderLimitsUpdate, RateLimitStats, RateLimiter, RequestClass};
pub use registry::ResilienceRegistry;
pub use retries::RetryPolicy;
