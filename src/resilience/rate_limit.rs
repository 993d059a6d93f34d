//! Per-provider sliding-window rate limiting.
//!
//! # Responsibilities
//! - Count recent requests per (provider, class)
//! - Tell callers whether one more request would break a ceiling
//! - Pace scheduled tasks so they stay under the ceiling
//!
//! # Design Decisions
//! - Sliding windows of timestamps, pruned on every read and write
//! - Expensive requests count against both the standard and the expensive
//!   window; the expensive window is only kept for providers with a ceiling
//! - Live updates are validated like loaded config and rejected whole
//! - Unknown providers are reported as over the limit, and scheduled work for
//!   them is paced with conservative fallback limits
//! - Never errors; the only effect is delay

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::validation::{validate_provider, ValidationError};
use crate::config::ProviderLimits;
use crate::observability::metrics;

/// Which ceiling a request is charged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequestClass {
    #[default]
    Standard,
    /// Long-running, costly operations such as deep research.
    Expensive,
}

impl RequestClass {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestClass::Standard => "standard",
            RequestClass::Expensive => "expensive",
        }
    }
}

#[derive(Debug, Default)]
struct SlidingWindow {
    hits: VecDeque<Instant>,
}

impl SlidingWindow {
    fn prune(&mut self, window: Duration, now: Instant) {
        while let Some(&oldest) = self.hits.front() {
            if now.duration_since(oldest) >= window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    fn count(&mut self, window: Duration, now: Instant) -> usize {
        self.prune(window, now);
        self.hits.len()
    }

    /// Time until one more hit fits under `max`.
    fn wait_time(&mut self, max: u32, window: Duration, now: Instant) -> Duration {
        let count = self.count(window, now);
        let max = max as usize;
        if count < max {
            return Duration::ZERO;
        }
        if max == 0 {
            return window;
        }

        // The hit that must expire before there is room again.
        let blocking = self.hits[count - max];
        (blocking + window).saturating_duration_since(now)
    }
}

/// Usage of one window.
#[derive(Debug, Clone, Serialize)]
pub struct WindowStats {
    pub used: usize,
    pub limit: u32,
    pub remaining: u32,
    pub window_ms: u64,
}

/// Snapshot returned by [`RateLimiter::get_rate_limit_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStats {
    pub provider: String,
    /// False when the provider has no configured limits.
    pub configured: bool,
    pub standard: WindowStats,
    pub expensive: Option<WindowStats>,
}

/// Partial limits for a live update; `None` keeps the current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderLimitsUpdate {
    pub max_requests: Option<u32>,
    pub window_ms: Option<u64>,
    pub expensive_max_requests: Option<u32>,
    pub expensive_window_ms: Option<u64>,
}

impl ProviderLimitsUpdate {
    fn apply_to(&self, limits: &mut ProviderLimits) {
        if let Some(max) = self.max_requests {
            limits.max_requests = max;
        }
        if let Some(window_ms) = self.window_ms {
            limits.window_ms = window_ms;
        }
        if let Some(max) = self.expensive_max_requests {
            limits.expensive_max_requests = Some(max);
        }
        if let Some(window_ms) = self.expensive_window_ms {
            limits.expensive_window_ms = window_ms;
        }
    }
}

/// Shared sliding-window limiter for every outbound provider.
#[derive(Debug)]
pub struct RateLimiter {
    limits: DashMap<String, ProviderLimits>,
    windows: Mutex<HashMap<(String, RequestClass), SlidingWindow>>,
    fallback: ProviderLimits,
}

impl RateLimiter {
    pub fn new(limits: HashMap<String, ProviderLimits>) -> Self {
        Self {
            limits: limits.into_iter().collect(),
            windows: Mutex::new(HashMap::new()),
            fallback: ProviderLimits::conservative(),
        }
    }

    pub fn is_configured(&self, provider: &str) -> bool {
        self.limits.contains_key(provider)
    }

    /// Limits currently in force for `provider`, if configured.
    pub fn limits_for(&self, provider: &str) -> Option<ProviderLimits> {
        self.limits.get(provider).map(|l| l.value().clone())
    }

    /// Charge one request against the provider's windows.
    pub fn record_request(&self, provider: &str, class: RequestClass) {
        let limits = self.limits_for(provider).unwrap_or_else(|| self.fallback.clone());
        let now = Instant::now();
        let mut windows = self.lock();

        let standard = windows.entry((provider.to_string(), RequestClass::Standard)).or_default();
        standard.prune(limits.window(), now);
        standard.hits.push_back(now);

        if class != RequestClass::Expensive {
            return;
        }
        let key = (provider.to_string(), RequestClass::Expensive);
        if limits.expensive_max_requests.is_some() {
            let expensive = windows.entry(key).or_default();
            expensive.prune(limits.expensive_window(), now);
            expensive.hits.push_back(now);
        } else {
            // Nothing reads an expensive window without a ceiling.
            windows.remove(&key);
        }
    }

    /// Whether one more standard request now would break the ceiling.
    pub fn would_exceed_rate_limit(&self, provider: &str) -> bool {
        self.would_exceed(provider, RequestClass::Standard)
    }

    /// Whether one more request of `class` now would break a ceiling.
    ///
    /// Unknown providers always report true.
    pub fn would_exceed(&self, provider: &str, class: RequestClass) -> bool {
        match self.limits_for(provider) {
            Some(limits) => !self.delay_under(provider, class, &limits).is_zero(),
            None => true,
        }
    }

    /// Minimum wait before a request of `class` fits under every applicable ceiling.
    pub fn required_delay(&self, provider: &str, class: RequestClass) -> Duration {
        let limits = self.limits_for(provider).unwrap_or_else(|| self.fallback.clone());
        self.delay_under(provider, class, &limits)
    }

    /// Wait until `task` fits under the provider's ceilings, run it, then
    /// record the request.
    ///
    /// Only the calling task is suspended. The task's own outcome is returned
    /// unchanged.
    pub async fn schedule<F, Fut, T>(&self, provider: &str, class: RequestClass, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.is_configured(provider) {
            tracing::warn!(provider = %provider, "No rate limits configured, using fallback limits");
        }

        let mut waited = Duration::ZERO;
        loop {
            let delay = self.required_delay(provider, class);
            if delay.is_zero() {
                break;
            }
            tracing::debug!(
                provider = %provider,
                class = class.as_str(),
                delay_ms = delay.as_millis() as u64,
                "Rate limit reached, delaying request"
            );
            tokio::time::sleep(delay).await;
            waited += delay;
        }

        if !waited.is_zero() {
            metrics::record_rate_limit_delay(provider, class.as_str(), waited);
        }

        let outcome = task().await;
        self.record_request(provider, class);
        outcome
    }

    pub fn get_rate_limit_stats(&self, provider: &str) -> RateLimitStats {
        let configured = self.limits_for(provider);
        let limits = configured.clone().unwrap_or_else(|| self.fallback.clone());
        let now = Instant::now();
        let mut windows = self.lock();

        let standard_used = windows
            .get_mut(&(provider.to_string(), RequestClass::Standard))
            .map(|w| w.count(limits.window(), now))
            .unwrap_or(0);

        let expensive = limits.expensive_max_requests.map(|limit| {
            let used = windows
                .get_mut(&(provider.to_string(), RequestClass::Expensive))
                .map(|w| w.count(limits.expensive_window(), now))
                .unwrap_or(0);
            window_stats(used, limit, limits.expensive_window_ms)
        });

        RateLimitStats {
            provider: provider.to_string(),
            configured: configured.is_some(),
            standard: window_stats(standard_used, limits.max_requests, limits.window_ms),
            expensive,
        }
    }

    /// Stats for every configured provider, sorted by name.
    pub fn all_stats(&self) -> Vec<RateLimitStats> {
        let mut providers: Vec<String> = self.limits.iter().map(|e| e.key().clone()).collect();
        providers.sort();
        providers.iter().map(|p| self.get_rate_limit_stats(p)).collect()
    }

    /// Apply a partial update to one provider's limits, effective immediately.
    ///
    /// An unknown provider starts from the default limits. Merged limits that
    /// fail validation are rejected and the current ones stay in force.
    pub fn update_rate_limit_config(
        &self,
        provider: &str,
        update: ProviderLimitsUpdate,
    ) -> Result<ProviderLimits, Vec<ValidationError>> {
        let mut limits = self.limits_for(provider).unwrap_or_default();
        update.apply_to(&mut limits);

        let mut errors = Vec::new();
        validate_provider(provider, &limits, &mut errors);
        if !errors.is_empty() {
            tracing::warn!(provider = %provider, errors = errors.len(), "Rejected rate limit update");
            return Err(errors);
        }

        self.limits.insert(provider.to_string(), limits.clone());
        tracing::info!(provider = %provider, limits = ?limits, "Rate limits updated");
        Ok(limits)
    }


    /// Replace the whole provider table, as after a config reload.
    ///
    /// Recorded request history is kept.
    pub fn apply_limits(&self, limits: &HashMap<String, ProviderLimits>) {
        self.limits.retain(|provider, _| limits.contains_key(provider));
        for (provider, provider_limits) in limits {
            self.limits.insert(provider.clone(), provider_limits.clone());
        }
        tracing::info!(providers = limits.len(), "Rate limit table reloaded");
    }

    fn delay_under(&self, provider: &str, class: RequestClass, limits: &ProviderLimits) -> Duration {
        let now = Instant::now();
        let mut windows = self.lock();

        let mut delay = windows
            .entry((provider.to_string(), RequestClass::Standard))
            .or_default()
            .wait_time(limits.max_requests, limits.window(), now);

        if class == RequestClass::Expensive {
            if let Some(max) = limits.expensive_max_requests {
                let expensive = windows
                    .entry((provider.to_string(), RequestClass::Expensive))
                    .or_default()
                    .wait_time(max, limits.expensive_window(), now);
                delay = delay.max(expensive);
            }
        }

        delay
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, RequestClass), SlidingWindow>> {
        self.windows.lock().expect("rate limiter mutex poisoned")
    }
}

fn window_stats(used: usize, limit: u32, window_ms: u64) -> WindowStats {
    WindowStats {
        used,
        limit,
        remaining: limit.saturating_sub(used as u32),
        window_ms,
    }
}
