//! Configuration management for taskdeck.
//!
//! Configuration can be set via environment variables:
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `8000`.
//! - `TASKDECK_STORE` - Optional. `simulated` or `remote`. Defaults to `simulated`.
//! - `TASKDECK_API_URL` - Optional. Base URL of the remote server. Defaults to `http://localhost:8000`.
//! - `TASKDECK_TICK_MS` - Optional. Simulated progress tick. Defaults to `500`.
//! - `TASKDECK_DURATION_MS` - Optional. Simulated run length. Defaults to `30000`.
//! - `TASKDECK_POLL_MS` - Optional. Remote poll interval. Defaults to `1000`.

use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::store::{ProgressPolicy, StoreKind};

pub const DEFAULT_API_URL: &str = "http://localhost:8000";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Which task store backs the service or client
    pub store: StoreKind,

    /// Base URL used by the remote store
    pub api_url: Url,

    /// Simulated progress timing
    pub progress: ProgressPolicy,

    /// Remote poll interval
    pub poll_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for unparseable values or zero durations.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8000".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue("PORT".to_string(), format!("{}", e)))?;

        let store = match std::env::var("TASKDECK_STORE") {
            Ok(value) => StoreKind::parse(&value).ok_or_else(|| {
                ConfigError::InvalidValue(
                    "TASKDECK_STORE".to_string(),
                    format!("expected `simulated` or `remote`, got `{}`", value),
                )
            })?,
            Err(_) => StoreKind::default(),
        };

        let api_url = std::env::var("TASKDECK_API_URL")
            .unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let api_url = Url::parse(&api_url).map_err(|e| {
            ConfigError::InvalidValue("TASKDECK_API_URL".to_string(), format!("{}", e))
        })?;

        let defaults = ProgressPolicy::default();
        let progress = ProgressPolicy::new(
            env_millis("TASKDECK_TICK_MS", defaults.tick)?,
            env_millis("TASKDECK_DURATION_MS", defaults.duration)?,
        );
        let poll_interval = env_millis("TASKDECK_POLL_MS", Duration::from_millis(1000))?;

        Ok(Self {
            host,
            port,
            store,
            api_url,
            progress,
            poll_interval,
        })
    }

    /// Create a config with default values (useful for testing).
    pub fn new() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            store: StoreKind::Simulated,
            api_url: Url::parse(DEFAULT_API_URL).expect("default API URL is valid"),
            progress: ProgressPolicy::default(),
            poll_interval: Duration::from_millis(1000),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Read a positive millisecond duration, falling back to `default` when unset.
fn env_millis(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(default);
    };
    parse_millis(name, &raw)
}

fn parse_millis(name: &str, raw: &str) -> Result<Duration, ConfigError> {
    let millis: u64 = raw
        .trim()
        .parse()
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e)))?;
    if millis == 0 {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            "must be greater than zero".to_string(),
        ));
    }
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new();
        assert_eq!(config.bind_addr(), "127.0.0.1:8000");
        assert_eq!(config.store, StoreKind::Simulated);
        assert_eq!(config.progress.tick, Duration::from_millis(500));
        assert_eq!(config.progress.duration, Duration::from_secs(30));
        assert_eq!(config.api_url.as_str(), "http://localhost:8000/");
    }

    #[test]
    fn test_parse_millis() {
        assert_eq!(
            parse_millis("TASKDECK_TICK_MS", " 250 ").unwrap(),
            Duration::from_millis(250)
        );
        assert!(matches!(
            parse_millis("TASKDECK_TICK_MS", "0"),
            Err(ConfigError::InvalidValue(name, _)) if name == "TASKDECK_TICK_MS"
        ));
        assert!(parse_millis("TASKDECK_POLL_MS", "soon").is_err());
    }
}
