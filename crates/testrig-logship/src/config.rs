//! Shipper and retry settings.

use serde::Deserialize;
use std::time::Duration;

/// How failed posts are retried.
///
/// Retry `n` (1-based) waits `backoff_factor * 2^(n-1)` seconds, capped at
/// [`RetryPolicy::MAX_BACKOFF`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_factor: f64,
    /// Statuses worth another attempt.
    pub status_forcelist: Vec<u16>,
}

impl RetryPolicy {
    pub const MAX_BACKOFF: Duration = Duration::from_secs(120);

    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn should_retry(&self, status: u16) -> bool {
        self.status_forcelist.contains(&status)
    }

    pub fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 || self.backoff_factor <= 0.0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let secs = self.backoff_factor * 2f64.powi(exponent);
        if secs.is_finite() && secs < Self::MAX_BACKOFF.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            Self::MAX_BACKOFF
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            backoff_factor: 0.1,
            status_forcelist: vec![500, 502, 503, 504],
        }
    }
}

/// Where and how batches are shipped.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShipperConfig {
    /// Collector base URL, without a trailing slash.
    pub url_root: String,
    /// Path below `url_root`; batches go to `<url_root>/<endpoint>/`.
    pub endpoint: String,
    pub username: String,
    pub password: Option<String>,
    pub timeout_secs: u64,
    /// Records that trigger an early flush.
    pub capacity: usize,
    /// Flush interval in milliseconds.
    pub interval_ms: u64,
    pub retry: RetryPolicy,
}

impl ShipperConfig {
    pub fn url(&self) -> String {
        format!(
            "{}/{}/",
            self.url_root.trim_end_matches('/'),
            self.endpoint.trim_matches('/')
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            url_root: "http://localhost:8080".to_string(),
            endpoint: "logs".to_string(),
            username: String::new(),
            password: None,
            timeout_secs: 10,
            capacity: 100,
            interval_ms: 10_000,
            retry: RetryPolicy::default(),
        }
    }
}
