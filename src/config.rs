//! Runtime configuration.
//!
//! Defaults come from [`crate::constants`]; everything can be overridden by
//! a `MEDIAHUB_*` environment variable and, for the common knobs, a CLI
//! flag. There is no config file: the daemon targets an embedded image
//! where the environment block is the deployment surface.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants;

/// Complete daemon configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// Listen address of the HTTP front end.
    pub http_addr: String,
    /// Abstract socket name prefix for the backend control servers.
    pub socket_base: String,
    /// Identity announced in the signature handshake.
    pub identity: String,
    /// Front-end request timeout, milliseconds.
    pub bridge_timeout_ms: u64,
    /// Controller scheduler tick, milliseconds.
    pub tick_interval_ms: u64,
    /// Per-link state-machine check throttle, milliseconds.
    pub link_check_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: constants::HTTP_ADDR.to_string(),
            socket_base: constants::SOCKET_NAME_BASE.to_string(),
            identity: constants::CONTROL_IDENTITY.to_string(),
            bridge_timeout_ms: constants::BRIDGE_TIMEOUT.as_millis() as u64,
            tick_interval_ms: constants::SCHEDULER_TICK_INTERVAL.as_millis() as u64,
            link_check_interval_ms: constants::LINK_CHECK_INTERVAL.as_millis() as u64,
        }
    }
}

impl Config {
    /// Build the configuration from defaults plus environment overrides.
    pub fn load() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("MEDIAHUB_HTTP_ADDR") {
            self.http_addr = addr;
        }
        if let Ok(base) = std::env::var("MEDIAHUB_SOCKET_BASE") {
            self.socket_base = base;
        }
        if let Ok(identity) = std::env::var("MEDIAHUB_IDENTITY") {
            self.identity = identity;
        }
        if let Ok(ms) = std::env::var("MEDIAHUB_BRIDGE_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse::<u64>() {
                self.bridge_timeout_ms = ms;
            }
        }
        if let Ok(ms) = std::env::var("MEDIAHUB_TICK_INTERVAL_MS") {
            if let Ok(ms) = ms.parse::<u64>() {
                self.tick_interval_ms = ms;
            }
        }
        if let Ok(ms) = std::env::var("MEDIAHUB_LINK_CHECK_INTERVAL_MS") {
            if let Ok(ms) = ms.parse::<u64>() {
                self.link_check_interval_ms = ms;
            }
        }
    }

    /// Front-end request timeout.
    pub fn bridge_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge_timeout_ms)
    }

    /// Controller scheduler tick.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Per-link check throttle.
    pub fn link_check_interval(&self) -> Duration {
        Duration::from_millis(self.link_check_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_constants() {
        let config = Config::default();
        assert_eq!(config.http_addr, constants::HTTP_ADDR);
        assert_eq!(config.socket_base, constants::SOCKET_NAME_BASE);
        assert_eq!(config.bridge_timeout(), constants::BRIDGE_TIMEOUT);
        assert_eq!(config.tick_interval(), constants::SCHEDULER_TICK_INTERVAL);
        assert_eq!(config.link_check_interval(), constants::LINK_CHECK_INTERVAL);
    }

    #[test]
    fn test_duration_accessors_track_millis() {
        let config = Config {
            bridge_timeout_ms: 250,
            tick_interval_ms: 10,
            link_check_interval_ms: 40,
            ..Config::default()
        };
        assert_eq!(config.bridge_timeout(), Duration::from_millis(250));
        assert_eq!(config.tick_interval(), Duration::from_millis(10));
        assert_eq!(config.link_check_interval(), Duration::from_millis(40));
    }
}
