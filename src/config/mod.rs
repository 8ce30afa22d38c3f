//! Typed configuration.
//!
//! [`Config`] is loaded once at startup from environment variables and fails
//! fast if required vars are missing. [`CacheConfig`] holds the tunables of a
//! single read-through cache and can also be read from a TOML file.
//! The Redis URL may embed a password, so it is kept as a
//! [`SecretString`](secrecy::SecretString).

pub mod secrets;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Tunables of one read-through cache instance.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Name of the logical queue. Must be unique per store.
    pub queue_name: String,
    /// Number of concurrent workers.
    pub workers: usize,
    /// How long a computation error stays visible before a retry is possible.
    pub error_ttl: Duration,
    /// Upper bound on how long a caller waits for a result. `None` waits forever.
    pub wait_timeout: Option<Duration>,
    /// How long the dequeue loop blocks waiting for a work-ready signal.
    pub poll_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            queue_name: "default".to_string(),
            workers: 4,
            error_ttl: Duration::from_secs(10),
            wait_timeout: Some(Duration::from_secs(300)),
            poll_timeout: Duration::from_secs(1),
        }
    }
}

/// On-disk shape of [`CacheConfig`]. Missing fields keep their defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CacheConfigFile {
    queue: Option<String>,
    workers: Option<usize>,
    error_ttl_secs: Option<u64>,
    /// `0` disables the wait timeout.
    wait_timeout_secs: Option<u64>,
    poll_timeout_ms: Option<u64>,
}

impl CacheConfig {
    /// Defaults for the given queue name.
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML document, e.g.
    ///
    /// ```toml
    /// queue = "diffs"
    /// workers = 8
    /// error_ttl_secs = 10
    /// ```
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let file: CacheConfigFile =
            toml::from_str(s).map_err(|e| Error::Config(format!("bad cache config: {e}")))?;

        let mut config = Self::default();
        if let Some(queue) = file.queue {
            config.queue_name = queue;
        }
        if let Some(workers) = file.workers {
            config.workers = workers;
        }
        if let Some(secs) = file.error_ttl_secs {
            config.error_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = file.wait_timeout_secs {
            config.wait_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(ms) = file.poll_timeout_ms {
            config.poll_timeout = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read cache config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Reject values the cache cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue_name.is_empty() {
            return Err(Error::Config("queue name must not be empty".to_string()));
        }
        if self.error_ttl.is_zero() {
            return Err(Error::Config("error ttl must be positive".to_string()));
        }
        // BLPOP treats a zero timeout as "block forever".
        if self.poll_timeout.is_zero() {
            return Err(Error::Config("poll timeout must be positive".to_string()));
        }
        Ok(())
    }
}

/// Process-wide configuration.
#[derive(Debug)]
pub struct Config {
    pub redis_url: SecretString,
    pub cache: CacheConfig,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = CacheConfig::default();

        let cache = CacheConfig {
            queue_name: std::env::var("RTCACHE_QUEUE").unwrap_or(defaults.queue_name),
            workers: optional_var("RTCACHE_WORKERS")?.unwrap_or(defaults.workers),
            error_ttl: optional_var("RTCACHE_ERROR_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.error_ttl),
            wait_timeout: match optional_var::<u64>("RTCACHE_WAIT_TIMEOUT_SECS")? {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.wait_timeout,
            },
            poll_timeout: optional_var("RTCACHE_POLL_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_timeout),
        };
        cache.validate()?;

        Ok(Self {
            redis_url: SecretString::from(required_var("REDIS_URL")?),
            cache,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid value {raw:?} for {name}: {e}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overrides_defaults() {
        let config = CacheConfig::from_toml_str(
            r#"
            queue = "diffs"
            workers = 8
            error_ttl_secs = 30
            wait_timeout_secs = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.queue_name, "diffs");
        assert_eq!(config.workers, 8);
        assert_eq!(config.error_ttl, Duration::from_secs(30));
        assert_eq!(config.wait_timeout, None);
        assert_eq!(config.poll_timeout, Duration::from_secs(1));
    }

    #[test]
    fn toml_rejects_unknown_fields() {
        assert!(CacheConfig::from_toml_str("wokers = 3").is_err());
    }

    #[test]
    fn zero_poll_timeout_is_invalid() {
        let config = CacheConfig {
            poll_timeout: Duration::ZERO,
            ..CacheConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
