use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::key::KeySource;
use crate::error::{Error, ErrorDetails};

/// Configuration for the per-key token bucket limiter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Tokens refilled per second for every bucket
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,

    /// Maximum number of tokens a bucket can hold
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,

    /// Buckets untouched for this long are dropped
    #[serde(default = "default_idle_ttl_ms")]
    pub idle_ttl_ms: u64,

    /// Interval of the background sweep that drops idle buckets
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Ordered list of sources the bucket key is taken from; first non-empty wins
    #[serde(default = "default_key_sources")]
    pub key_sources: Vec<KeySource>,
}

fn default_enabled() -> bool {
    true
}

fn default_requests_per_second() -> f64 {
    1.0
}

fn default_burst_size() -> u32 {
    1
}

fn default_idle_ttl_ms() -> u64 {
    60 * 60 * 1000
}

fn default_sweep_interval_ms() -> u64 {
    60 * 1000
}

fn default_key_sources() -> Vec<KeySource> {
    vec![
        KeySource::Header("x-forwarded-for".to_string()),
        KeySource::Header("x-real-ip".to_string()),
        KeySource::RemoteAddr,
    ]
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            requests_per_second: default_requests_per_second(),
            burst_size: default_burst_size(),
            idle_ttl_ms: default_idle_ttl_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            key_sources: default_key_sources(),
        }
    }
}

impl RateLimitConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_millis(self.idle_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Time it takes an empty bucket to refill completely
    ///
    /// Saturates at `Duration::MAX` for rates too small to represent.
    pub fn full_refill(&self) -> Duration {
        Duration::try_from_secs_f64(f64::from(self.burst_size) / self.requests_per_second)
            .unwrap_or(Duration::MAX)
    }

    /// Rejects values the limiter cannot run with
    ///
    /// A bucket idle for `idle_ttl` is reset to full, so the TTL must be at
    /// least the time a refill takes or idle resets would hand out extra tokens.
    pub fn verify(&self) -> Result<(), Error> {
        if !self.requests_per_second.is_finite() || self.requests_per_second <= 0.0 {
            return Err(config_error(format!(
                "`rate_limits.requests_per_second` must be a positive number, got {}",
                self.requests_per_second
            )));
        }
        if self.burst_size == 0 {
            return Err(config_error(
                "`rate_limits.burst_size` must be at least 1".to_string(),
            ));
        }
        if self.key_sources.is_empty() {
            return Err(config_error(
                "`rate_limits.key_sources` must name at least one source".to_string(),
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(config_error(
                "`rate_limits.sweep_interval_ms` must be greater than 0".to_string(),
            ));
        }
        let full_refill = self.full_refill();
        if self.idle_ttl() < full_refill {
            return Err(config_error(format!(
                "`rate_limits.idle_ttl_ms` ({}) must be at least the time an empty bucket takes to refill ({}ms)",
                self.idle_ttl_ms,
                full_refill.as_millis()
            )));
        }
        Ok(())
    }
}

fn config_error(message: String) -> Error {
    Error::new(ErrorDetails::Config { message })
}
