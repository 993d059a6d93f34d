//! Shared resilience state owned by the composition root.
//!
//! One circuit breaker per service, created on first use, and one rate
//! limiter for all providers. Callers get clients bound to their service's
//! breaker so concurrent users of a service share fate.

use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;

use crate::config::{AppConfig, CircuitBreakerConfig};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitStats};
use crate::resilience::client::ResilientClient;
use crate::resilience::rate_limit::RateLimiter;
use crate::resilience::retries::RetryPolicy;

#[derive(Debug)]
pub struct ResilienceRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    breaker_config: ArcSwap<CircuitBreakerConfig>,
    retry_policy: ArcSwap<RetryPolicy>,
    rate_limiter: Arc<RateLimiter>,
    http: reqwest::Client,
}

impl ResilienceRegistry {
    pub fn new(breaker_config: CircuitBreakerConfig, retry_policy: RetryPolicy, rate_limiter: RateLimiter) -> Self {
        Self {
            breakers: DashMap::new(),
            breaker_config: ArcSwap::from_pointee(breaker_config),
            retry_policy: ArcSwap::from_pointee(retry_policy),
            rate_limiter: Arc::new(rate_limiter),
            http: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.circuit_breaker.clone(),
            RetryPolicy::from(&config.retries),
            RateLimiter::new(config.rate_limits.providers.clone()),
        )
    }

    /// The breaker guarding `service`, created with the current settings on first use.
    pub fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(service) {
            return existing.value().clone();
        }

        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                tracing::debug!(service = %service, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(service, &self.breaker_config.load()))
            })
            .value()
            .clone()
    }

    /// A client for `service` sharing the registry's connection pool.
    pub fn client(&self, service: &str) -> ResilientClient {
        let policy = self.retry_policy.load_full();
        ResilientClient::with_http(self.http.clone(), self.breaker(service), (*policy).clone())
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Stats for every known breaker, sorted by service.
    pub fn circuit_stats(&self) -> Vec<CircuitStats> {
        let mut stats: Vec<CircuitStats> = self.breakers.iter().map(|b| b.value().stats()).collect();
        stats.sort_by(|a, b| a.service.cmp(&b.service));
        stats
    }

    /// Force a service's circuit closed. Returns false if the service is unknown.
    pub fn reset_circuit(&self, service: &str) -> bool {
        match self.breakers.get(service) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Apply reloaded settings.
    ///
    /// Rate limits take effect immediately. Breaker settings apply to breakers
    /// created afterwards; existing breakers keep their state.
    pub fn apply_config(&self, config: &AppConfig) {
        self.rate_limiter.apply_limits(&config.rate_limits.providers);
        self.breaker_config.store(Arc::new(config.circuit_breaker.clone()));
        self.retry_policy.store(Arc::new(RetryPolicy::from(&config.retries)));
    }
}
