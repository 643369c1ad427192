//! Hub configuration.
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then environment variables, then command-line flags (applied by the
//! binary). The resulting [`BeaconConfig`] is validated once and passed by
//! value to whichever component needs it.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Environment variable overriding the listen address.
pub const ENV_ADDR: &str = "BEACON_ADDR";

/// Environment variable overriding the canned message directory.
pub const ENV_EVENT_DIR: &str = "BEACON_EVENT_DIR";

/// Default listen address
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9999";

/// Default path subscribers connect to
pub const DEFAULT_EVENTS_PATH: &str = "/events";

/// Default canned message directory
pub const DEFAULT_EVENT_DIR: &str = "./event";

/// Path served by the health check, unavailable for the event stream
const RESERVED_HEALTH_PATH: &str = "/health";

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid listen address '{value}' in {origin}")]
    InvalidAddr { value: String, origin: String },

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Runtime configuration for the hub.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BeaconConfig {
    /// Address the HTTP listener binds to
    pub listen_addr: SocketAddr,

    /// Path of the event-stream endpoint
    pub events_path: String,

    /// Directory of canned JSON messages
    pub event_dir: PathBuf,

    /// Capacity of the publish queue
    pub queue_capacity: usize,

    /// Frames buffered per subscriber before writes start to wait
    pub subscriber_buffer: usize,

    /// Maximum number of concurrent subscribers
    pub max_subscribers: usize,

    /// Per-subscriber write timeout during fan-out
    pub write_timeout_ms: u64,

    /// Grace period for subscriber connections to close on shutdown
    pub subscriber_close_timeout_ms: u64,

    /// Grace period for the listener to finish in-flight connections
    pub listener_shutdown_timeout_ms: u64,

    /// Interval between keep-alive comments on idle streams
    pub keep_alive_secs: u64,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9999)),
            events_path: DEFAULT_EVENTS_PATH.to_string(),
            event_dir: PathBuf::from(DEFAULT_EVENT_DIR),
            queue_capacity: 64,
            subscriber_buffer: 32,
            max_subscribers: 1024,
            write_timeout_ms: 1_000,
            subscriber_close_timeout_ms: 5_000,
            listener_shutdown_timeout_ms: 5_000,
            keep_alive_secs: 15,
        }
    }
}

impl BeaconConfig {
    /// Loads configuration from a TOML file; missing fields keep defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parses configuration from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Applies `BEACON_ADDR` and `BEACON_EVENT_DIR` as returned by
    /// `lookup`, typically `|name| std::env::var(name).ok()`.
    pub fn apply_vars<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup(ENV_ADDR) {
            self.listen_addr = parse_addr(&addr, ENV_ADDR)?;
        }
        if let Some(dir) = lookup(ENV_EVENT_DIR) {
            self.event_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Checks that every limit and timeout is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.events_path.starts_with('/') {
            return Err(ConfigError::Invalid {
                field: "events_path",
                reason: format!("'{}' must start with '/'", self.events_path),
            });
        }
        if self.events_path == RESERVED_HEALTH_PATH
            || self.events_path.contains(&['{', '}', '*', ':'][..])
        {
            return Err(ConfigError::Invalid {
                field: "events_path",
                reason: format!("'{}' is reserved or not a literal path", self.events_path),
            });
        }

        let non_zero = [
            ("queue_capacity", self.queue_capacity as u64),
            ("subscriber_buffer", self.subscriber_buffer as u64),
            ("max_subscribers", self.max_subscribers as u64),
            ("write_timeout_ms", self.write_timeout_ms),
            ("subscriber_close_timeout_ms", self.subscriber_close_timeout_ms),
            ("listener_shutdown_timeout_ms", self.listener_shutdown_timeout_ms),
            ("keep_alive_secs", self.keep_alive_secs),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        Ok(())
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn subscriber_close_timeout(&self) -> Duration {
        Duration::from_millis(self.subscriber_close_timeout_ms)
    }

    pub fn listener_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.listener_shutdown_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// Parses a socket address, naming where it came from on failure.
pub fn parse_addr(value: &str, origin: &str) -> Result<SocketAddr, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidAddr {
        value: value.to_string(),
        origin: origin.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = BeaconConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_addr.to_string(), DEFAULT_LISTEN_ADDR);
        assert_eq!(config.events_path, "/events");
        assert_eq!(config.subscriber_close_timeout(), Duration::from_secs(5));
        assert_eq!(config.listener_shutdown_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = BeaconConfig::from_toml_str(
            r#"
            listen_addr = "127.0.0.1:8080"
            queue_capacity = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.events_path, DEFAULT_EVENTS_PATH);
    }

    #[test]
    fn test_unknown_toml_field_rejected() {
        assert!(BeaconConfig::from_toml_str("listen_port = 1").is_err());
    }

    #[test]
    fn test_from_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beacon.toml");
        fs::write(&path, "queue_capacity = \"lots\"").unwrap();

        let err = BeaconConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("beacon.toml"));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let config = BeaconConfig {
            subscriber_buffer: 0,
            ..BeaconConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("subscriber_buffer"));
    }

    #[test]
    fn test_validate_rejects_relative_path() {
        let config = BeaconConfig {
            events_path: "events".to_string(),
            ..BeaconConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_reserved_and_pattern_paths() {
        for path in ["/health", "/events/{id}", "/*rest"] {
            let config = BeaconConfig {
                events_path: path.to_string(),
                ..BeaconConfig::default()
            };
            assert!(config.validate().is_err(), "{path} should be rejected");
        }
    }

    #[test]
    fn test_parse_addr_error_names_origin() {
        let err = parse_addr("not-an-addr", ENV_ADDR).unwrap_err();
        assert!(err.to_string().contains(ENV_ADDR));
    }

    #[test]
    fn test_apply_vars_overrides_addr_and_dir() {
        let mut config = BeaconConfig::default();
        config
            .apply_vars(|name| match name {
                ENV_ADDR => Some("127.0.0.1:7100".to_string()),
                ENV_EVENT_DIR => Some("/srv/canned".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.listen_addr.port(), 7100);
        assert_eq!(config.event_dir, PathBuf::from("/srv/canned"));
    }

    #[test]
    fn test_apply_vars_rejects_bad_addr() {
        let mut config = BeaconConfig::default();
        let err = config
            .apply_vars(|name| (name == ENV_ADDR).then(|| "nowhere".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddr { .. }));
    }
}
