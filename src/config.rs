// Copyright 2025 RangeKV Project Authors. Licensed under Apache-2.0.

use std::time::Duration;

use serde_derive::Deserialize;
use serde_derive::Serialize;

/// Retry behavior for talking to the coordinators.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
#[serde(rename_all = "kebab-case")]
pub struct CoordinatorRetryConfig {
    /// Pause between reconnect attempts after all endpoints failed.
    pub reconnect_interval: Duration,
    /// How many full endpoint sweeps to attempt before giving up.
    pub max_reconnect_attempts: usize,
}

impl Default for CoordinatorRetryConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_attempts: 5,
        }
    }
}

/// The configuration for a [`Client`](crate::Client).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Timeout for a single RPC attempt against one store.
    pub timeout: Duration,
    /// Total budget for one logical call, across all retries.
    pub deadline: Duration,
    /// Upper bound on concurrently in-flight per-region sub-batches within
    /// one batch operation.
    pub max_batch_concurrency: usize,
    pub coordinator_retry: CoordinatorRetryConfig,
    /// Region cache TTL base (see `region_cache_ttl_jitter`).
    pub region_cache_ttl: Duration,
    /// Adds jitter to region cache TTL to avoid thundering herds.
    ///
    /// The real TTL is in range `[region_cache_ttl, region_cache_ttl + region_cache_ttl_jitter)`.
    pub region_cache_ttl_jitter: Duration,
}

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_CALL_DEADLINE: Duration = Duration::from_secs(20);
const DEFAULT_MAX_BATCH_CONCURRENCY: usize = 16;
const DEFAULT_REGION_CACHE_TTL: Duration = Duration::from_secs(600);
const DEFAULT_REGION_CACHE_TTL_JITTER: Duration = Duration::from_secs(60);

impl Default for Config {
    fn default() -> Self {
        Config {
            timeout: DEFAULT_REQUEST_TIMEOUT,
            deadline: DEFAULT_CALL_DEADLINE,
            max_batch_concurrency: DEFAULT_MAX_BATCH_CONCURRENCY,
            coordinator_retry: CoordinatorRetryConfig::default(),
            region_cache_ttl: DEFAULT_REGION_CACHE_TTL,
            region_cache_ttl_jitter: DEFAULT_REGION_CACHE_TTL_JITTER,
        }
    }
}

impl Config {
    /// Set the timeout for a single RPC attempt.
    ///
    /// If an attempt does not complete within this window, it is cancelled
    /// and counted against the retry budget. The default is two seconds.
    ///
    /// # Examples
    /// ```rust
    /// # use rangekv_client::Config;
    /// # use std::time::Duration;
    /// let config = Config::default().with_timeout(Duration::from_secs(10));
    /// ```
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the total deadline for one logical call, across all retries.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Cap the number of per-region sub-batches in flight at once.
    ///
    /// All sub-batches of a batch operation still complete before the
    /// operation returns; this only bounds parallelism.
    #[must_use]
    pub fn with_max_batch_concurrency(mut self, max: usize) -> Self {
        self.max_batch_concurrency = max;
        self
    }

    #[must_use]
    pub fn with_coordinator_retry_config(mut self, retry: CoordinatorRetryConfig) -> Self {
        self.coordinator_retry = retry;
        self
    }

    /// Configure the region cache TTL base and jitter.
    ///
    /// The cache is best-effort. A shorter TTL reduces staleness but
    /// increases coordinator load.
    ///
    /// # Examples
    /// ```rust
    /// # use rangekv_client::Config;
    /// # use std::time::Duration;
    /// let config = Config::default()
    ///     .with_region_cache_ttl(Duration::from_secs(300), Duration::from_secs(30));
    /// ```
    #[must_use]
    pub fn with_region_cache_ttl(mut self, base: Duration, jitter: Duration) -> Self {
        self.region_cache_ttl = base;
        self.region_cache_ttl_jitter = jitter;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.timeout, Duration::from_secs(2));
        assert_eq!(cfg.deadline, Duration::from_secs(20));
        assert_eq!(cfg.max_batch_concurrency, 16);
        assert_eq!(cfg.region_cache_ttl, Duration::from_secs(600));
        assert_eq!(cfg.region_cache_ttl_jitter, Duration::from_secs(60));
        assert_eq!(cfg.coordinator_retry, CoordinatorRetryConfig::default());

        let retry = CoordinatorRetryConfig::default();
        assert_eq!(retry.reconnect_interval, Duration::from_secs(1));
        assert_eq!(retry.max_reconnect_attempts, 5);
    }

    #[test]
    fn builders_override_each_knob() {
        let cfg = Config::default()
            .with_timeout(Duration::from_secs(10))
            .with_deadline(Duration::from_secs(60))
            .with_max_batch_concurrency(4)
            .with_region_cache_ttl(Duration::from_secs(3), Duration::from_secs(1));

        assert_eq!(cfg.timeout, Duration::from_secs(10));
        assert_eq!(cfg.deadline, Duration::from_secs(60));
        assert_eq!(cfg.max_batch_concurrency, 4);
        assert_eq!(cfg.region_cache_ttl, Duration::from_secs(3));
        assert_eq!(cfg.region_cache_ttl_jitter, Duration::from_secs(1));
    }

    #[test]
    fn coordinator_retry_config_is_settable() {
        let retry = CoordinatorRetryConfig {
            reconnect_interval: Duration::from_secs(9),
            max_reconnect_attempts: 99,
        };
        let cfg = Config::default().with_coordinator_retry_config(retry);
        assert_eq!(cfg.coordinator_retry, retry);
    }
}
