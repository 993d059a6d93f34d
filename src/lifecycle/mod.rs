//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validated config → registries → job queue → processors → monitor/watcher/admin
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → graceful shutdown
//!
//! Shutdown (shutdown.rs):
//!     Broadcast → background tasks exit → queue drains → store flushed
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core, then listeners
//! - Draining the queue has a deadline

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
