//! Timeout enforcement.
//!
//! Every outbound attempt has a deadline; hitting it is reported as its own
//! error so the retry layer can treat it as transient.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation timed out after {0:?}")]
pub struct TimedOut(pub Duration);

/// Run `fut` with a deadline of `limit`.
pub async fn with_timeout<F: Future>(limit: Duration, fut: F) -> Result<F::Output, TimedOut> {
    tokio::time::timeout(limit, fut).await.map_err(|_| TimedOut(limit))
}
