pub mod config;
pub mod key;
pub mod limiter;
pub mod middleware;

pub use config::RateLimitConfig;
pub use key::{KeyContext, KeySource};
pub use limiter::RateLimiter;
pub use middleware::{rate_limit_middleware, RateLimitError, RateLimitState, ANONYMOUS_KEY};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue};

/// Headers returned with rate limit information
#[derive(Debug, Clone)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    pub reset: u64, // Unix timestamp at which the bucket is full again
    pub retry_after: Option<Duration>,
}

impl RateLimitHeaders {
    /// `Retry-After` only carries whole seconds, so partial seconds round up
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|retry_after| {
            let secs = retry_after.as_secs();
            if retry_after.subsec_nanos() > 0 || secs == 0 {
                secs.saturating_add(1)
            } else {
                secs
            }
        })
    }

    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        // Numbers always produce valid header values.
        if let Ok(value) = HeaderValue::from_str(&self.limit.to_string()) {
            headers.insert("X-RateLimit-Limit", value);
        }

        if let Ok(value) = HeaderValue::from_str(&self.remaining.to_string()) {
            headers.insert("X-RateLimit-Remaining", value);
        }

        if let Ok(value) = HeaderValue::from_str(&self.reset.to_string()) {
            headers.insert("X-RateLimit-Reset", value);
        }

        if let Some(retry_after) = self.retry_after_secs() {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                headers.insert("Retry-After", value);
            }
        }

        headers
    }
}

/// Result of a rate limit check
#[derive(Debug)]
pub enum RateLimitDecision {
    Allow(RateLimitHeaders),
    Deny(RateLimitHeaders),
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allow(_))
    }

    pub fn headers(&self) -> &RateLimitHeaders {
        match self {
            RateLimitDecision::Allow(h) | RateLimitDecision::Deny(h) => h,
        }
    }

    /// Time until the next token is available, only set on denial
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateLimitDecision::Allow(_) => None,
            RateLimitDecision::Deny(h) => h.retry_after,
        }
    }
}

/// Counters for the in-process limiter
#[derive(Debug, Default)]
pub struct RateLimiterMetrics {
    pub allowed: AtomicU64,
    pub rejected: AtomicU64,
    pub evicted: AtomicU64,
}

impl RateLimiterMetrics {
    pub fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("paygate_rate_limit_decisions_total", "decision" => "allowed")
            .increment(1);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("paygate_rate_limit_decisions_total", "decision" => "rejected")
            .increment(1);
    }

    pub fn record_evicted(&self, count: u64) {
        self.evicted.fetch_add(count, Ordering::Relaxed);
    }
}
