use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use crate::error::Error;
use crate::rate_limit::{RateLimitConfig, RateLimitDecision, RateLimitHeaders, RateLimiterMetrics};

/// Helper function to get current Unix timestamp.
/// Returns 0 if system time is before UNIX_EPOCH (extremely rare).
fn get_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Refilling allowance for a single key
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl TokenBucket {
    fn full(burst: u32, now: Instant) -> Self {
        Self {
            tokens: f64::from(burst),
            last_refill: now,
            last_seen: now,
        }
    }

    fn refill(&mut self, now: Instant, rate: f64, burst: u32) {
        // `now` may lag behind `last_refill` when callers race; never refill backwards
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        self.tokens = (self.tokens + elapsed.as_secs_f64() * rate).min(f64::from(burst));
        self.last_refill = now;
    }

    fn is_idle(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) >= ttl
    }
}

/// In-process token bucket limiter keyed by caller identity
///
/// Each key owns one bucket holding at most `burst_size` tokens, refilled at
/// `requests_per_second`. Admission consumes one whole token. Buckets are kept
/// in a sharded map, so checks for the same key serialize on the shard lock
/// while different keys proceed in parallel.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<String, TokenBucket>,
    rate: f64,
    burst: u32,
    idle_ttl: Duration,
    metrics: RateLimiterMetrics,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Result<Self, Error> {
        config.verify()?;

        Ok(Self {
            buckets: DashMap::new(),
            rate: config.requests_per_second,
            burst: config.burst_size,
            idle_ttl: config.idle_ttl(),
            metrics: RateLimiterMetrics::default(),
            sweeper: std::sync::Mutex::new(None),
        })
    }

    /// Check and consume one token for `key` at the current instant
    pub fn admit(&self, key: &str) -> RateLimitDecision {
        self.admit_at(key, Instant::now())
    }

    /// Check and consume one token for `key` as of `now`
    pub fn admit_at(&self, key: &str, now: Instant) -> RateLimitDecision {
        let mut entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::full(self.burst, now));
        let bucket = entry.value_mut();

        if bucket.is_idle(now, self.idle_ttl) {
            *bucket = TokenBucket::full(self.burst, now);
            self.metrics.record_evicted(1);
        }
        bucket.refill(now, self.rate, self.burst);
        bucket.last_seen = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            let headers = self.headers_for(bucket.tokens, None);
            drop(entry);
            self.metrics.record_allowed();
            RateLimitDecision::Allow(headers)
        } else {
            let retry_after = Duration::try_from_secs_f64((1.0 - bucket.tokens) / self.rate)
                .unwrap_or(Duration::MAX);
            let headers = self.headers_for(bucket.tokens, Some(retry_after));
            drop(entry);
            self.metrics.record_rejected();
            debug!(key, ?retry_after, "Rate limit bucket empty");
            RateLimitDecision::Deny(headers)
        }
    }

    fn headers_for(&self, tokens: f64, retry_after: Option<Duration>) -> RateLimitHeaders {
        let missing = f64::from(self.burst) - tokens;
        let until_full = (missing / self.rate).ceil();
        RateLimitHeaders {
            limit: self.burst,
            remaining: tokens.floor() as u32,
            // Float to int casts saturate, and so does the addition
            reset: get_unix_timestamp().saturating_add(until_full as u64),
            retry_after,
        }
    }

    /// Remove every bucket idle for at least the configured TTL as of `now`
    ///
    /// Returns the number of buckets removed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| !bucket.is_idle(now, self.idle_ttl));
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            self.metrics.record_evicted(removed as u64);
            debug!(removed, "Swept idle rate limit buckets");
        }
        removed
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Spawn the background task that periodically drops idle buckets
    ///
    /// The task holds only a weak reference and exits once the limiter is gone.
    /// Calling this again replaces the previous task.
    pub fn start_sweeper(self: &Arc<Self>, every: Duration) {
        let limiter: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                limiter.sweep();
            }
        });

        let mut sweeper = match self.sweeper.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = sweeper.replace(handle) {
            previous.abort();
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn metrics(&self) -> &RateLimiterMetrics {
        &self.metrics
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        let sweeper = match self.sweeper.get_mut() {
            Ok(sweeper) => sweeper,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = sweeper.take() {
            handle.abort();
        }
    }
}
