//! Retrying HTTP client bound to a circuit breaker.
//!
//! # Data Flow
//! ```text
//! request(call)
//!     → circuit_breaker.execute (fail fast when open)
//!         → attempt loop (0..=max_retries)
//!             → timeouts.rs (per-attempt deadline)
//!             → 2xx: parse body, done
//!             → retryable: record failure, wait (Retry-After or backoff), retry
//!             → retryable but would open the circuit: stop, retries exhausted
//!             → other status: fail immediately
//! ```

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::observability::metrics;
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::error::{ClientError, TransportFailure};
use crate::resilience::retries::{is_retryable_status, parse_retry_after, RetryPolicy};
use crate::resilience::timeouts::{with_timeout, TimedOut};

/// Error bodies are truncated to this many bytes before being kept.
const MAX_ERROR_BODY: usize = 2048;

/// Description of one outbound call.
#[derive(Debug, Clone)]
pub struct CallSpec {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Per-attempt deadline; falls back to the policy's request timeout.
    pub timeout: Option<Duration>,
}

impl CallSpec {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, url).json(body)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// HTTP client that retries transient failures and shares fate with its
/// service's circuit breaker.
#[derive(Debug, Clone)]
pub struct ResilientClient {
    http: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
}

impl ResilientClient {
    pub fn new(breaker: Arc<CircuitBreaker>, policy: RetryPolicy) -> Self {
        Self::with_http(reqwest::Client::new(), breaker, policy)
    }

    /// Build on an existing connection pool.
    pub fn with_http(http: reqwest::Client, breaker: Arc<CircuitBreaker>, policy: RetryPolicy) -> Self {
        Self { http, breaker, policy }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Perform the call, returning the parsed response body.
    ///
    /// Empty bodies become `null`; bodies that are not JSON are returned as a string.
    pub async fn request(&self, call: &CallSpec) -> Result<Value, ClientError> {
        self.breaker.execute(|| self.attempt_loop(call)).await
    }

    /// Perform the call and deserialize the body into `T`.
    pub async fn request_as<T: DeserializeOwned>(&self, call: &CallSpec) -> Result<T, ClientError> {
        let body = self.request(call).await?;
        serde_json::from_value(body).map_err(|e| ClientError::Decode(e.to_string()))
    }

    async fn attempt_loop(&self, call: &CallSpec) -> Result<Value, ClientError> {
        let service = self.breaker.service();
        let max_retries = self.policy.max_retries;
        let mut attempt: u32 = 0;

        loop {
            let err = match self.attempt(call).await {
                Ok(body) => return Ok(body),
                Err(err) => err,
            };

            if !err.is_retryable() {
                tracing::error!(
                    service = %service,
                    url = %call.url,
                    attempt = attempt + 1,
                    error = %err,
                    "Request failed with non-retryable error"
                );
                metrics::record_outbound_failure(service, err.kind());
                return Err(err);
            }

            // A failure that would open the circuit ends the loop; `execute`
            // records the final failure, intermediate ones are recorded here.
            let trips = self.breaker.failure_would_trip();
            if attempt >= max_retries || trips {
                tracing::error!(
                    service = %service,
                    url = %call.url,
                    attempts = attempt + 1,
                    circuit_tripped = trips,
                    error = %err,
                    "Request failed, retries exhausted"
                );
                metrics::record_outbound_failure(service, "exhausted_retries");
                return Err(ClientError::ExhaustedRetries {
                    attempts: attempt + 1,
                    last: Box::new(err),
                });
            }
            self.breaker.record_failure();

            let delay = self.policy.delay_for(attempt, err.retry_after());
            tracing::warn!(
                service = %service,
                url = %call.url,
                attempt = attempt + 1,
                max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying request"
            );
            metrics::record_retry(service);

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt(&self, call: &CallSpec) -> Result<Value, ClientError> {
        let deadline = call.timeout.unwrap_or(self.policy.request_timeout);

        let mut builder = self.http.request(call.method.clone(), &call.url);
        for (name, value) in &call.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &call.body {
            builder = builder.json(body);
        }

        let exchange = async {
            let response = builder.send().await?;
            let status = response.status().as_u16();
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let text = response.text().await?;
            Ok::<_, reqwest::Error>((status, retry_after, text))
        };

        let (status, retry_after, text) = match with_timeout(deadline, exchange).await {
            Ok(Ok(parts)) => parts,
            Ok(Err(e)) => return Err(classify_transport_error(e, deadline)),
            Err(TimedOut(limit)) => {
                return Err(ClientError::RetryableTransport {
                    failure: TransportFailure::Timeout(limit),
                    retry_after: None,
                })
            }
        };

        if (200..300).contains(&status) {
            return Ok(parse_body(&text));
        }

        if is_retryable_status(status) {
            Err(ClientError::RetryableTransport {
                failure: TransportFailure::Status(status),
                retry_after,
            })
        } else {
            Err(ClientError::NonRetryable {
                status,
                body: truncate(text),
            })
        }
    }
}

fn classify_transport_error(e: reqwest::Error, deadline: Duration) -> ClientError {
    if e.is_builder() {
        ClientError::Request(e.to_string())
    } else if e.is_timeout() {
        ClientError::RetryableTransport {
            failure: TransportFailure::Timeout(deadline),
            retry_after: None,
        }
    } else {
        ClientError::RetryableTransport {
            failure: TransportFailure::Network(e.to_string()),
            retry_after: None,
        }
    }
}

fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn truncate(mut text: String) -> String {
    if text.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_body_variants() {
        assert_eq!(parse_body(""), Value::Null);
        assert_eq!(parse_body("{\"ok\":true}"), serde_json::json!({"ok": true}));
        assert_eq!(parse_body("plain text"), Value::String("plain text".into()));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let long = "é".repeat(MAX_ERROR_BODY);
        let cut = truncate(long);
        assert!(cut.len() <= MAX_ERROR_BODY);
        assert!(cut.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_call_spec_builder() {
        let call = CallSpec::post("http://localhost/v1/chat", serde_json::json!({"q": 1}))
            .header("authorization", "Bearer k")
            .timeout(Duration::from_secs(3));

        assert_eq!(call.method, Method::POST);
        assert_eq!(call.headers.len(), 1);
        assert_eq!(call.timeout, Some(Duration::from_secs(3)));
        assert!(call.body.is_some());
    }

    #[tokio::test]
    async fn test_invalid_url_is_not_retried() {
        let breaker = Arc::new(CircuitBreaker::new("svc", &Default::default()));
        let client = ResilientClient::new(breaker.clone(), RetryPolicy::default());

        let err = client.request(&CallSpec::get("not a url")).await.unwrap_err();

        assert!(matches!(err, ClientError::Request(_)), "got {:?}", err);
        assert_eq!(breaker.stats().total_failures, 1);
    }
}
