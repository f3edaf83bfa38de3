//! Configuration module for the ChatPulse monitor.
//!
//! This module handles parsing configuration from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `CHATPULSE_WATCH_DIR` | No | `~/.claude/projects` | Root directory of conversation logs |
//! | `CHATPULSE_DEBOUNCE_MS` | No | 500 | Settle interval for write bursts (1-10000) |
//! | `CHATPULSE_TYPING_THRESHOLD_SECS` | No | 30 | Quiet time before `user_typing` |
//! | `CHATPULSE_RECENT_MINUTES` | No | 5 | `recently_active` -> `idle` boundary |
//! | `CHATPULSE_IDLE_MINUTES` | No | 60 | `idle` -> `inactive` boundary |
//! | `CHATPULSE_INACTIVE_MINUTES` | No | 1440 | `inactive` -> `old` boundary |
//! | `CHATPULSE_CACHE_CAPACITY` | No | 256 | Files kept in the content cache |
//! | `CHATPULSE_CACHE_TTL_SECS` | No | (none) | Idle expiry for cache entries |
//! | `CHATPULSE_MAX_CONCURRENT_READS` | No | 4 | Parallel disk reads |
//! | `CHATPULSE_REFRESH_SECS` | No | 5 | Periodic re-inference interval |
//! | `CHATPULSE_COMPLETION_KEYWORDS` | No | built-in | Comma-separated completion phrases |
//! | `CHATPULSE_ERROR_KEYWORDS` | No | built-in | Comma-separated error phrases |
//! | `CHATPULSE_SOLICITATION_PHRASES` | No | built-in | Comma-separated phrases asking for input |
//! | `CHATPULSE_READ_TOOLS` | No | built-in | Comma-separated read-only tool names |
//!
//! # Example
//!
//! ```no_run
//! use chatpulse_monitor::config::Config;
//!
//! let config = Config::from_env().expect("Failed to load configuration");
//! println!("Watching: {}", config.watch_dir.display());
//! ```

use std::env;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use directories::BaseDirs;
use thiserror::Error;

use crate::cache::{CacheOptions, DEFAULT_CACHE_CAPACITY, DEFAULT_MAX_CONCURRENT_READS};
use crate::inference::{
    InferenceConfig, DEFAULT_IDLE_MINUTES, DEFAULT_INACTIVE_MINUTES, DEFAULT_RECENT_MINUTES,
    DEFAULT_TYPING_THRESHOLD_SECS,
};
use crate::utils::debounce::DEFAULT_DEBOUNCE_MS;

/// Default watch directory relative to home.
const DEFAULT_WATCH_DIR: &str = ".claude/projects";

/// Default periodic re-inference interval (in seconds).
const DEFAULT_REFRESH_SECS: u64 = 5;

const MIN_DEBOUNCE_MS: u64 = 1;
const MAX_DEBOUNCE_MS: u64 = 10_000;

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Failed to determine home directory.
    #[error("failed to determine home directory")]
    NoHomeDirectory,
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Configuration for the ChatPulse monitor.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the conversation log tree.
    pub watch_dir: PathBuf,

    /// Quiet time after the last write before a file is re-ingested.
    pub debounce: Duration,

    /// Thresholds and keyword sets for state inference.
    pub inference: InferenceConfig,

    /// Content cache bounds.
    pub cache: CacheOptions,

    /// How often every conversation is re-inferred as time passes.
    pub refresh_interval: Duration,
}

impl Config {
    /// Default configuration watching `watch_dir`.
    #[must_use]
    pub fn default_for(watch_dir: impl Into<PathBuf>) -> Self {
        Self {
            watch_dir: watch_dir.into(),
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            inference: InferenceConfig::default(),
            cache: CacheOptions::default(),
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_SECS),
        }
    }

    /// Creates a new `Config` by parsing environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if:
    /// - A numeric variable cannot be parsed or is out of range
    /// - The time-bucket thresholds are not strictly ascending
    /// - `CHATPULSE_WATCH_DIR` is unset and the home directory cannot be determined
    pub fn from_env() -> Result<Self, ConfigError> {
        let watch_dir = match env::var("CHATPULSE_WATCH_DIR") {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => BaseDirs::new()
                .ok_or(ConfigError::NoHomeDirectory)?
                .home_dir()
                .join(DEFAULT_WATCH_DIR),
        };

        let debounce_ms: u64 = parse_env("CHATPULSE_DEBOUNCE_MS", DEFAULT_DEBOUNCE_MS)?;
        if !(MIN_DEBOUNCE_MS..=MAX_DEBOUNCE_MS).contains(&debounce_ms) {
            return Err(ConfigError::invalid(
                "CHATPULSE_DEBOUNCE_MS",
                format!(
                    "debounce must be between {MIN_DEBOUNCE_MS} and {MAX_DEBOUNCE_MS} ms, got {debounce_ms}"
                ),
            ));
        }

        let typing_secs: u64 =
            parse_env("CHATPULSE_TYPING_THRESHOLD_SECS", DEFAULT_TYPING_THRESHOLD_SECS)?;
        let recent_minutes: u64 = parse_env("CHATPULSE_RECENT_MINUTES", DEFAULT_RECENT_MINUTES)?;
        let idle_minutes: u64 = parse_env("CHATPULSE_IDLE_MINUTES", DEFAULT_IDLE_MINUTES)?;
        let inactive_minutes: u64 =
            parse_env("CHATPULSE_INACTIVE_MINUTES", DEFAULT_INACTIVE_MINUTES)?;

        if recent_minutes == 0 {
            return Err(ConfigError::invalid(
                "CHATPULSE_RECENT_MINUTES",
                "threshold must be greater than 0",
            ));
        }
        if idle_minutes <= recent_minutes {
            return Err(ConfigError::invalid(
                "CHATPULSE_IDLE_MINUTES",
                format!("must be greater than CHATPULSE_RECENT_MINUTES ({recent_minutes})"),
            ));
        }
        if inactive_minutes <= idle_minutes {
            return Err(ConfigError::invalid(
                "CHATPULSE_INACTIVE_MINUTES",
                format!("must be greater than CHATPULSE_IDLE_MINUTES ({idle_minutes})"),
            ));
        }

        let defaults = InferenceConfig::default();
        let inference = InferenceConfig {
            typing_threshold: Duration::from_secs(typing_secs),
            recent: minutes("CHATPULSE_RECENT_MINUTES", recent_minutes)?,
            idle: minutes("CHATPULSE_IDLE_MINUTES", idle_minutes)?,
            inactive: minutes("CHATPULSE_INACTIVE_MINUTES", inactive_minutes)?,
            completion_keywords: parse_list("CHATPULSE_COMPLETION_KEYWORDS")
                .unwrap_or(defaults.completion_keywords),
            error_keywords: parse_list("CHATPULSE_ERROR_KEYWORDS")
                .unwrap_or(defaults.error_keywords),
            solicitation_phrases: parse_list("CHATPULSE_SOLICITATION_PHRASES")
                .unwrap_or(defaults.solicitation_phrases),
            read_tools: parse_list("CHATPULSE_READ_TOOLS").unwrap_or(defaults.read_tools),
        };

        let capacity: usize = parse_env("CHATPULSE_CACHE_CAPACITY", DEFAULT_CACHE_CAPACITY)?;
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            ConfigError::invalid("CHATPULSE_CACHE_CAPACITY", "capacity must be greater than 0")
        })?;

        let ttl = match env::var("CHATPULSE_CACHE_TTL_SECS") {
            Ok(val) => {
                let secs = parse_value::<u64>("CHATPULSE_CACHE_TTL_SECS", &val)?;
                (secs > 0).then(|| Duration::from_secs(secs))
            }
            Err(_) => None,
        };

        let max_concurrent_reads: usize =
            parse_env("CHATPULSE_MAX_CONCURRENT_READS", DEFAULT_MAX_CONCURRENT_READS)?;
        if max_concurrent_reads == 0 {
            return Err(ConfigError::invalid(
                "CHATPULSE_MAX_CONCURRENT_READS",
                "must be greater than 0",
            ));
        }

        let refresh_secs: u64 = parse_env("CHATPULSE_REFRESH_SECS", DEFAULT_REFRESH_SECS)?;
        if refresh_secs == 0 {
            return Err(ConfigError::invalid(
                "CHATPULSE_REFRESH_SECS",
                "refresh interval must be at least 1 second",
            ));
        }

        Ok(Self {
            watch_dir,
            debounce: Duration::from_millis(debounce_ms),
            inference,
            cache: CacheOptions {
                capacity,
                ttl,
                max_concurrent_reads,
            },
            refresh_interval: Duration::from_secs(refresh_secs),
        })
    }
}

fn minutes(key: &str, value: u64) -> Result<Duration, ConfigError> {
    value
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::invalid(key, format!("{value} minutes is out of range")))
}

fn parse_value<T: FromStr>(key: &str, val: &str) -> Result<T, ConfigError> {
    val.trim().parse::<T>().map_err(|_| {
        ConfigError::invalid(key, format!("expected non-negative integer, got '{val}'"))
    })
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(val) => parse_value(key, &val),
        Err(_) => Ok(default),
    }
}

/// Comma-separated list; `None` when unset or empty.
fn parse_list(key: &str) -> Option<Vec<String>> {
    let items: Vec<String> = env::var(key)
        .ok()?
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    (!items.is_empty()).then_some(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    /// Sets and clears environment variables for one test, restoring the
    /// previous values on drop.
    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            let saved: Vec<(String, Option<String>)> = env::vars()
                .filter(|(k, _)| k.starts_with("CHATPULSE_"))
                .map(|(k, v)| (k, Some(v)))
                .collect();
            for (key, _) in &saved {
                env::remove_var(key);
            }
            Self { saved }
        }

        fn set(&mut self, key: &str, value: &str) {
            if !self.saved.iter().any(|(k, _)| k == key) {
                self.saved.push((key.to_string(), None));
            }
            env::set_var(key, value);
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    #[serial]
    fn defaults_apply_when_unset() {
        let mut env = EnvGuard::new();
        env.set("CHATPULSE_WATCH_DIR", "/data/logs");

        let config = Config::from_env().expect("should parse defaults");

        assert_eq!(config.watch_dir, PathBuf::from("/data/logs"));
        assert_eq!(config.debounce, Duration::from_millis(DEFAULT_DEBOUNCE_MS));
        assert_eq!(config.inference, InferenceConfig::default());
        assert_eq!(config.cache, CacheOptions::default());
        assert_eq!(config.refresh_interval, Duration::from_secs(DEFAULT_REFRESH_SECS));
    }

    #[test]
    #[serial]
    fn watch_dir_defaults_under_home() {
        let _env = EnvGuard::new();
        let config = Config::from_env().expect("should parse");
        assert!(config.watch_dir.ends_with(".claude/projects"));
    }

    #[test]
    #[serial]
    fn full_config() {
        let mut env = EnvGuard::new();
        env.set("CHATPULSE_WATCH_DIR", "/logs");
        env.set("CHATPULSE_DEBOUNCE_MS", "250");
        env.set("CHATPULSE_TYPING_THRESHOLD_SECS", "10");
        env.set("CHATPULSE_RECENT_MINUTES", "2");
        env.set("CHATPULSE_IDLE_MINUTES", "30");
        env.set("CHATPULSE_INACTIVE_MINUTES", "600");
        env.set("CHATPULSE_CACHE_CAPACITY", "16");
        env.set("CHATPULSE_CACHE_TTL_SECS", "120");
        env.set("CHATPULSE_MAX_CONCURRENT_READS", "2");
        env.set("CHATPULSE_REFRESH_SECS", "1");
        env.set("CHATPULSE_COMPLETION_KEYWORDS", " Shipped , merged ,");

        let config = Config::from_env().expect("should parse full config");

        assert_eq!(config.debounce, Duration::from_millis(250));
        assert_eq!(config.inference.typing_threshold, Duration::from_secs(10));
        assert_eq!(config.inference.recent, Duration::from_secs(120));
        assert_eq!(config.inference.idle, Duration::from_secs(1800));
        assert_eq!(config.inference.inactive, Duration::from_secs(36_000));
        assert_eq!(
            config.inference.completion_keywords,
            vec!["shipped".to_string(), "merged".to_string()]
        );
        assert_eq!(config.cache.capacity.get(), 16);
        assert_eq!(config.cache.ttl, Some(Duration::from_secs(120)));
        assert_eq!(config.cache.max_concurrent_reads, 2);
        assert_eq!(config.refresh_interval, Duration::from_secs(1));
    }

    #[test]
    #[serial]
    fn invalid_number_is_rejected() {
        let mut env = EnvGuard::new();
        env.set("CHATPULSE_WATCH_DIR", "/logs");
        env.set("CHATPULSE_DEBOUNCE_MS", "soon");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref key, .. } if key == "CHATPULSE_DEBOUNCE_MS"
        ));
    }

    #[test]
    #[serial]
    fn oversized_minute_threshold_is_rejected() {
        let mut env = EnvGuard::new();
        env.set("CHATPULSE_WATCH_DIR", "/logs");
        env.set("CHATPULSE_INACTIVE_MINUTES", &u64::MAX.to_string());

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref key, .. } if key == "CHATPULSE_INACTIVE_MINUTES"
        ));
    }

    #[test]
    #[serial]
    fn debounce_out_of_range_is_rejected() {
        let mut env = EnvGuard::new();
        env.set("CHATPULSE_WATCH_DIR", "/logs");
        env.set("CHATPULSE_DEBOUNCE_MS", "20000");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref message, .. } if message.contains("between 1 and 10000")
        ));
    }

    #[test]
    #[serial]
    fn thresholds_must_ascend() {
        let mut env = EnvGuard::new();
        env.set("CHATPULSE_WATCH_DIR", "/logs");
        env.set("CHATPULSE_RECENT_MINUTES", "90");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref key, .. } if key == "CHATPULSE_IDLE_MINUTES"
        ));
    }

    #[test]
    #[serial]
    fn zero_cache_capacity_is_rejected() {
        let mut env = EnvGuard::new();
        env.set("CHATPULSE_WATCH_DIR", "/logs");
        env.set("CHATPULSE_CACHE_CAPACITY", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref key, ref message }
                if key == "CHATPULSE_CACHE_CAPACITY" && message.contains("greater than 0")
        ));
    }

    #[test]
    #[serial]
    fn zero_ttl_disables_expiry() {
        let mut env = EnvGuard::new();
        env.set("CHATPULSE_WATCH_DIR", "/logs");
        env.set("CHATPULSE_CACHE_TTL_SECS", "0");

        let config = Config::from_env().expect("should parse");
        assert_eq!(config.cache.ttl, None);
    }

    #[test]
    fn default_for_uses_given_directory() {
        let config = Config::default_for("/tmp/logs");
        assert_eq!(config.watch_dir, PathBuf::from("/tmp/logs"));
        assert_eq!(config.debounce, Duration::from_millis(500));
    }

    #[test]
    fn config_error_display() {
        assert_eq!(
            ConfigError::invalid("CHATPULSE_PORT", "bad").to_string(),
            "invalid value for CHATPULSE_PORT: bad"
        );
        assert_eq!(
            ConfigError::NoHomeDirectory.to_string(),
            "failed to determine home directory"
        );
    }
}
