//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse, deserialize, environment overrides)
//!     → validation.rs (semantic checks)
//!     → AppConfig (validated, immutable)
//!     → consumed once by the composition root
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → rate limits pushed into the live RateLimiter
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Backend selection happens once at startup, never per call
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use schema::AppConfig;
pub use schema::BackendKind;
pub use schema::CircuitBreakerConfig;
pub use schema::MonitorConfig;
pub use schema::ProviderLimits;
pub use schema::QueueConfig;
pub use schema::RetryConfig;
pub use schema::ThrottleConfig;
