//! Driver configuration.
//!
//! Defaults match the console's factory behaviour. An optional JSON file can
//! override them, and command-line flags override the file.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hp1000_core::protocol::hp1000::{DISCOVERY_PORT, MAX_PAGE_RECORDS, SESSION_PORT};
use hp1000_core::{ClockZone, StationModel};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use thiserror::Error;

use crate::Cli;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("max_retry must be at least 1")]
    NoDiscoveryAttempts,
    #[error("archive_page_size must be between 1 and {max}, not {value}")]
    PageSize { value: u16, max: u16 },
    #[error("{0} must not be zero")]
    ZeroDuration(&'static str),
    #[error("{0} port must not be zero")]
    ZeroPort(&'static str),
}

/// Everything the poll loop needs to know
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StationConfig {
    pub model: StationModel,
    /// Where to send discovery probes; derived from `interface` when absent
    pub broadcast_address: Option<Ipv4Addr>,
    /// Interface whose broadcast address to use; the first suitable one when absent
    pub interface: Option<String>,
    pub discovery_port: u16,
    pub session_port: u16,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub discovery_timeout: Duration,
    /// Discovery attempts in total before giving up
    pub max_retry: u32,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub request_timeout: Duration,
    /// Extra attempts for a request that timed out or came back garbled
    pub link_retries: u32,
    /// Minimum time between two live requests
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub loop_delay: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub degraded_cooldown: Duration,
    /// Retrieve only archive records after this instant
    pub initial_cursor: Option<DateTime<Utc>>,
    pub console_clock: ClockZone,
    pub archive_page_size: u16,
}

impl Default for StationConfig {
    fn default() -> Self {
        StationConfig {
            model: StationModel::Hp1000,
            broadcast_address: None,
            interface: None,
            discovery_port: DISCOVERY_PORT,
            session_port: SESSION_PORT,
            discovery_timeout: Duration::from_secs(5),
            max_retry: 3,
            request_timeout: Duration::from_secs(5),
            link_retries: 1,
            loop_delay: Duration::from_secs(15),
            degraded_cooldown: Duration::from_secs(60),
            initial_cursor: None,
            console_clock: ClockZone::Local,
            archive_page_size: MAX_PAGE_RECORDS,
        }
    }
}

impl StationConfig {
    /// Read a JSON config file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Defaults, then the `--config` file if any, then the other flags
    pub fn from_cli(args: &Cli) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_cli(args);
        config.validate()?;
        Ok(config)
    }

    fn apply_cli(&mut self, args: &Cli) {
        if let Some(model) = args.model {
            self.model = model;
        }
        if let Some(address) = args.broadcast {
            self.broadcast_address = Some(address);
        }
        if let Some(interface) = &args.interface {
            self.interface = Some(interface.clone());
        }
        if let Some(secs) = args.discovery_timeout {
            self.discovery_timeout = Duration::from_secs_f64(secs);
        }
        if let Some(max_retry) = args.max_retry {
            self.max_retry = max_retry;
        }
        if let Some(secs) = args.request_timeout {
            self.request_timeout = Duration::from_secs_f64(secs);
        }
        if let Some(secs) = args.loop_delay {
            self.loop_delay = Duration::from_secs_f64(secs);
        }
        if let Some(secs) = args.cooldown {
            self.degraded_cooldown = Duration::from_secs_f64(secs);
        }
        if let Some(since) = args.since {
            self.initial_cursor = Some(since);
        }
        if let Some(clock) = args.console_clock {
            self.console_clock = clock;
        }
        if let Some(page_size) = args.page_size {
            self.archive_page_size = page_size;
        }
    }

    /// Reject settings the loop cannot work with. `loop_delay` may be zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retry == 0 {
            return Err(ConfigError::NoDiscoveryAttempts);
        }
        if self.archive_page_size == 0 || self.archive_page_size > MAX_PAGE_RECORDS {
            return Err(ConfigError::PageSize {
                value: self.archive_page_size,
                max: MAX_PAGE_RECORDS,
            });
        }
        for (name, duration) in [
            ("discovery_timeout", self.discovery_timeout),
            ("request_timeout", self.request_timeout),
            ("degraded_cooldown", self.degraded_cooldown),
        ] {
            if duration.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if self.discovery_port == 0 {
            return Err(ConfigError::ZeroPort("discovery"));
        }
        if self.session_port == 0 {
            return Err(ConfigError::ZeroPort("session"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = StationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.discovery_port, 6000);
        assert_eq!(config.session_port, 6500);
        assert_eq!(config.max_retry, 3);
        assert_eq!(config.link_retries, 1);
        assert_eq!(config.loop_delay, Duration::from_secs(15));
        assert_eq!(config.degraded_cooldown, Duration::from_secs(60));
    }

    #[test]
    fn test_file_then_flags() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "broadcast_address": "192.168.7.255",
                "loop_delay": 30,
                "discovery_timeout": 2.5,
                "console_clock": "utc",
                "initial_cursor": "2024-05-01T12:00:00Z"
            }}"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let args = Cli::parse_from(["hp1000-driver", "--config", &path, "--loop-delay", "20"]);
        let config = StationConfig::from_cli(&args).unwrap();
        assert_eq!(config.broadcast_address, Some(Ipv4Addr::new(192, 168, 7, 255)));
        assert_eq!(config.loop_delay, Duration::from_secs(20));
        assert_eq!(config.discovery_timeout, Duration::from_millis(2500));
        assert_eq!(config.console_clock, ClockZone::Utc);
        assert_eq!(
            config.initial_cursor,
            Some("2024-05-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap())
        );
        // Untouched keys keep their defaults
        assert_eq!(config.max_retry, 3);
    }

    #[test]
    fn test_bad_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "loop_dealy": 30 }}"#).unwrap();
        assert!(matches!(
            StationConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            StationConfig::load(Path::new("/nonexistent/hp1000.json")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_validation() {
        let config = StationConfig {
            max_retry: 0,
            ..StationConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::NoDiscoveryAttempts)));

        let config = StationConfig {
            archive_page_size: 101,
            ..StationConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::PageSize { value: 101, .. })));

        let config = StationConfig {
            request_timeout: Duration::ZERO,
            ..StationConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroDuration("request_timeout"))
        ));

        let config = StationConfig {
            loop_delay: Duration::ZERO,
            ..StationConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
