//! Server configuration module.
//!
//! Parses configuration from environment variables for the ChatPulse server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PORT` | No | 3333 | HTTP server port |
//! | `CHATPULSE_*` | No | - | Monitor settings, see [`chatpulse_monitor::config`] |

use std::env;

use thiserror::Error;

/// Default HTTP server port.
pub const DEFAULT_PORT: u16 = 3333;

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),

    /// One of the monitor settings is invalid.
    #[error(transparent)]
    Monitor(#[from] chatpulse_monitor::ConfigError),
}

/// Server configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,

    /// Settings for the embedded conversation monitor.
    pub monitor: chatpulse_monitor::Config,
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `PORT` is not a valid u16 or any monitor
    /// setting fails validation.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use chatpulse_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = parse_port()?;
        let monitor = chatpulse_monitor::Config::from_env()?;
        Ok(Self { port, monitor })
    }
}

fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(value) => Ok(value.trim().parse::<u16>()?),
        Err(_) => Ok(DEFAULT_PORT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    /// Restores the variables a test touches when dropped.
    struct EnvGuard {
        saved: Vec<(&'static str, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&'static str]) -> Self {
            let saved = keys.iter().map(|k| (*k, env::var(k).ok())).collect();
            for key in keys {
                env::remove_var(key);
            }
            Self { saved }
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

    const KEYS: &[&str] = &["PORT", "CHATPULSE_WATCH_DIR", "CHATPULSE_DEBOUNCE_MS"];

    #[test]
    #[serial]
    fn default_port() {
        let _guard = EnvGuard::new(KEYS);
        env::set_var("CHATPULSE_WATCH_DIR", "/tmp/chatpulse-test");

        let config = Config::from_env().unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    #[serial]
    fn custom_port() {
        let _guard = EnvGuard::new(KEYS);
        env::set_var("PORT", "9000");
        env::set_var("CHATPULSE_WATCH_DIR", "/tmp/chatpulse-test");

        let config = tokio_test::assert_ok!(Config::from_env());
        assert_eq!(config.port, 9000);
        assert_eq!(
            config.monitor.watch_dir,
            std::path::PathBuf::from("/tmp/chatpulse-test")
        );
    }

    #[test]
    #[serial]
    fn invalid_port() {
        let _guard = EnvGuard::new(KEYS);
        env::set_var("PORT", "not-a-number");

        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::InvalidPort(_))));
    }

    #[test]
    #[serial]
    fn monitor_errors_are_surfaced() {
        let _guard = EnvGuard::new(KEYS);
        env::set_var("CHATPULSE_WATCH_DIR", "/tmp/chatpulse-test");
        env::set_var("CHATPULSE_DEBOUNCE_MS", "0");

        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::Monitor(_))));
    }
}
