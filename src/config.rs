//! Configuration for the scheduler and caches.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. explicit path (e.g. the CLI's `--config` flag)
//! 2. `~/.tollgate/config.toml` (user)
//! 3. `/etc/tollgate/config.toml` (system)
//!
//! When no file exists the built-in defaults apply. Every field is optional;
//! durations are written in milliseconds.
//!
//! ```toml
//! [scheduler]
//! max_requests_per_minute = 15
//! backoff_base_ms = 2000
//!
//! [cache]
//! max_memory_items = 100
//! max_disk_bytes = 5242880
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{Result, TollgateError};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Token bucket, retry and circuit-breaker settings.
///
/// ```rust
/// # use tollgate::SchedulerConfig;
/// # use std::time::Duration;
/// let config = SchedulerConfig::new()
///     .max_requests_per_minute(30)
///     .backoff_base(Duration::from_millis(500));
/// assert_eq!(config.refill_interval(), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Sustained dispatch rate. Default: 15.
    pub max_requests_per_minute: u32,
    /// Bucket capacity in tokens. Default: 1.0 (no bursting).
    pub burst_capacity: f64,
    /// Attempts per item for transient errors, including the first. Default: 3.
    pub max_attempts: u32,
    /// Backoff before the first retry; doubles per retry. Default: 2s.
    #[serde(rename = "backoff_base_ms", with = "millis")]
    pub backoff_base: Duration,
    /// Fixed part of the circuit-breaker pause. Default: 10s.
    #[serde(rename = "pause_base_ms", with = "millis")]
    pub pause_base: Duration,
    /// Upper bound of the random part of the pause. Default: 5s.
    #[serde(rename = "pause_jitter_ms", with = "millis")]
    pub pause_jitter: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 15,
            burst_capacity: 1.0,
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            pause_base: Duration::from_secs(10),
            pause_jitter: Duration::from_secs(5),
        }
    }
}

impl SchedulerConfig {
    /// Create a config with the reference defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sustained dispatch rate.
    pub fn max_requests_per_minute(mut self, rpm: u32) -> Self {
        self.max_requests_per_minute = rpm;
        self
    }

    /// Set the bucket capacity.
    pub fn burst_capacity(mut self, tokens: f64) -> Self {
        self.burst_capacity = tokens;
        self
    }

    /// Set attempts per item (1 = no retry).
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    /// Set the backoff before the first retry.
    pub fn backoff_base(mut self, delay: Duration) -> Self {
        self.backoff_base = delay;
        self
    }

    /// Set the fixed and random parts of the circuit-breaker pause.
    pub fn pause(mut self, base: Duration, jitter: Duration) -> Self {
        self.pause_base = base;
        self.pause_jitter = jitter;
        self
    }

    /// Time for one token to accrue: `60s / max_requests_per_minute`.
    pub fn refill_interval(&self) -> Duration {
        Duration::from_secs(60) / self.max_requests_per_minute.max(1)
    }

    /// Backoff before retry number `retry` (1-based): `base * 2^(retry-1)`.
    pub fn backoff_for_retry(&self, retry: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_requests_per_minute == 0 {
            return Err(TollgateError::Configuration(
                "scheduler.max_requests_per_minute must be at least 1".to_string(),
            ));
        }
        if !self.burst_capacity.is_finite() || self.burst_capacity < 1.0 {
            return Err(TollgateError::Configuration(format!(
                "scheduler.burst_capacity must be >= 1.0, got {}",
                self.burst_capacity
            )));
        }
        if self.max_attempts == 0 {
            return Err(TollgateError::Configuration(
                "scheduler.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Tiered cache settings.
///
/// ```rust
/// # use tollgate::CacheConfig;
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .max_memory_items(500)
///     .default_ttl(Duration::from_secs(3600));
/// assert_eq!(config.max_memory_items, 500);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Fast-tier capacity in entries. Default: 100.
    pub max_memory_items: usize,
    /// Durable-tier byte budget. Default: 5 MiB.
    pub max_disk_bytes: u64,
    /// TTL applied when a caller does not pass one. Default: 24 hours.
    #[serde(rename = "default_ttl_ms", with = "millis")]
    pub default_ttl: Duration,
    /// Interval of the expiry sweep. Default: 5 minutes.
    #[serde(rename = "sweep_interval_ms", with = "millis")]
    pub sweep_interval: Duration,
    /// Share of durable records dropped when a write fails. Default: 0.2.
    pub prune_fraction: f64,
    /// Namespace prepended to every durable record key. Default: `cache_v2_`.
    pub prefix: String,
    /// Root directory for file-backed caches. Default: `~/.cache/tollgate`.
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_items: 100,
            max_disk_bytes: 5 * 1024 * 1024,
            default_ttl: Duration::from_secs(24 * 3600),
            sweep_interval: Duration::from_secs(5 * 60),
            prune_fraction: 0.2,
            prefix: "cache_v2_".to_string(),
            dir: default_cache_dir(),
        }
    }
}

impl CacheConfig {
    /// Create a config with the reference defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fast-tier capacity.
    pub fn max_memory_items(mut self, n: usize) -> Self {
        self.max_memory_items = n;
        self
    }

    /// Set the durable-tier byte budget.
    pub fn max_disk_bytes(mut self, bytes: u64) -> Self {
        self.max_disk_bytes = bytes;
        self
    }

    /// Set the TTL used when callers pass none.
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the expiry sweep interval.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the share of durable records dropped when a write fails.
    pub fn prune_fraction(mut self, fraction: f64) -> Self {
        self.prune_fraction = fraction;
        self
    }

    /// Set the durable record namespace.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set the root directory for file-backed caches.
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Reject settings the sweeper or the prune-on-full path cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval.is_zero() {
            return Err(TollgateError::Configuration(
                "cache.sweep_interval_ms must be at least 1".to_string(),
            ));
        }
        if !(self.prune_fraction > 0.0 && self.prune_fraction <= 1.0) {
            return Err(TollgateError::Configuration(format!(
                "cache.prune_fraction must be in (0, 1], got {}",
                self.prune_fraction
            )));
        }
        Ok(())
    }
}

/// Default cache root: `~/.cache/tollgate`.
fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("tollgate")
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided; must exist)
    /// 2. `~/.tollgate/config.toml`
    /// 3. `/etc/tollgate/config.toml`
    /// 4. Built-in defaults
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let Some(path) = Self::resolve_config_path(explicit_path)? else {
            return Ok(Config::default());
        };
        let content = fs::read_to_string(&path).map_err(|e| {
            TollgateError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        let config = Self::from_toml_str(&content).map_err(|e| {
            TollgateError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| TollgateError::Configuration(e.to_string()))?;
        config.scheduler.validate()?;
        config.cache.validate()?;
        Ok(config)
    }

    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
            return Err(TollgateError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".tollgate").join("config.toml");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        let system_config = PathBuf::from("/etc/tollgate/config.toml");
        if system_config.exists() {
            return Ok(Some(system_config));
        }

        Ok(None)
    }
}

/// Serde adapter for durations written as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
