//! Error taxonomy for outbound calls.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::resilience::circuit_breaker::CircuitOpenError;

/// Why a single attempt failed in a way worth retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    /// The server answered with a retryable status.
    Status(u16),
    /// No answer within the attempt deadline.
    Timeout(Duration),
    /// Connection refused, reset, DNS failure and similar.
    Network(String),
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportFailure::Status(status) => write!(f, "HTTP {}", status),
            TransportFailure::Timeout(limit) => write!(f, "timed out after {:?}", limit),
            TransportFailure::Network(message) => write!(f, "network error: {}", message),
        }
    }
}

/// Errors surfaced by [`ResilientClient`](crate::resilience::client::ResilientClient).
#[derive(Debug, Error)]
pub enum ClientError {
    /// Refused without a network attempt.
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// Timeout, network error or retryable status.
    #[error("retryable transport failure: {failure}")]
    RetryableTransport {
        failure: TransportFailure,
        retry_after: Option<Duration>,
    },

    /// Status outside the retryable set; never retried.
    #[error("non-retryable response: HTTP {status}")]
    NonRetryable { status: u16, body: String },

    /// Every attempt failed; wraps the last failure.
    #[error("gave up after {attempts} attempts: {last}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        last: Box<ClientError>,
    },

    /// The request could not be built.
    #[error("invalid request: {0}")]
    Request(String),

    /// A successful response did not match the expected shape.
    #[error("failed to decode response body: {0}")]
    Decode(String),
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::RetryableTransport { .. })
    }

    /// Server-provided delay hint, if the failure carried one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ClientError::RetryableTransport { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// HTTP status of the (last) failed response, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::RetryableTransport {
                failure: TransportFailure::Status(status),
                ..
            } => Some(*status),
            ClientError::NonRetryable { status, .. } => Some(*status),
            ClientError::ExhaustedRetries { last, .. } => last.status(),
            _ => None,
        }
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::CircuitOpen(_) => "circuit_open",
            ClientError::RetryableTransport { .. } => "retryable_transport",
            ClientError::NonRetryable { .. } => "non_retryable",
            ClientError::ExhaustedRetries { .. } => "exhausted_retries",
            ClientError::Request(_) => "request",
            ClientError::Decode(_) => "decode",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_exposes_last_status() {
        let err = ClientError::ExhaustedRetries {
            attempts: 3,
            last: Box::new(ClientError::RetryableTransport {
                failure: TransportFailure::Status(503),
                retry_after: None,
            }),
        };

        assert_eq!(err.status(), Some(503));
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "gave up after 3 attempts: retryable transport failure: HTTP 503");
    }
}
