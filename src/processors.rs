//! Built-in processors.
//!
//! `OutboundCallProcessor` runs jobs that describe one outbound HTTP call:
//! paced by the provider's rate limiter, executed through the provider's
//! resilient client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::queue::{BoxError, JobHandle, Processor};
use crate::resilience::{CallSpec, RequestClass, ResilienceRegistry};

/// Queue served by [`OutboundCallProcessor`] in the service binary.
pub const OUTBOUND_QUEUE: &str = "outbound-http";

/// Payload of an outbound call job.
#[derive(Debug, Clone, Deserialize)]
pub struct OutboundCall {
    /// Rate-limit and circuit-breaker key.
    pub provider: String,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub class: RequestClass,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Marks the job for backlog throttling at enqueue time.
    #[serde(default)]
    pub deep_research: bool,
}

fn default_method() -> String {
    "POST".to_string()
}

impl OutboundCall {
    pub fn to_call_spec(&self) -> Result<CallSpec, BoxError> {
        let method = reqwest::Method::from_bytes(self.method.to_uppercase().as_bytes())?;
        let mut call = CallSpec::new(method, &self.url);
        for (name, value) in &self.headers {
            call = call.header(name, value);
        }
        if let Some(body) = &self.body {
            call = call.json(body.clone());
        }
        if let Some(ms) = self.timeout_ms {
            call = call.timeout(Duration::from_millis(ms));
        }
        Ok(call)
    }

    /// Deep-research jobs are charged against the expensive window.
    pub fn request_class(&self) -> RequestClass {
        if self.deep_research {
            RequestClass::Expensive
        } else {
            self.class
        }
    }
}

pub struct OutboundCallProcessor {
    registry: Arc<ResilienceRegistry>,
}

impl OutboundCallProcessor {
    pub fn new(registry: Arc<ResilienceRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Processor for OutboundCallProcessor {
    async fn process(&self, job: JobHandle) -> Result<Value, BoxError> {
        let call: OutboundCall = job.payload_as()?;
        let spec = call.to_call_spec()?;
        let client = self.registry.client(&call.provider);
        let class = call.request_class();

        job.report_progress(10)?;
        let body = self
            .registry
            .rate_limiter()
            .schedule(&call.provider, class, || client.request(&spec))
            .await?;
        job.report_progress(100)?;

        Ok(body)
    }
}
