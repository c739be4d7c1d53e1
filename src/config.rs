//! Server configuration module
//! Handles runtime parameters for the realtime router and its websocket endpoint

use crate::constants::{
    DEFAULT_HOST, DEFAULT_MAX_FRAME_BYTES, DEFAULT_PING_PERIOD, DEFAULT_PORT,
    DEFAULT_READ_TIMEOUT, DEFAULT_SEND_BUFFER, DEFAULT_WRITE_WAIT,
};
use crate::core::connection::ConnectionSettings;
use crate::error::{ChattyError, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration parameters
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Capacity of each connection's outbound queue
    pub send_buffer: usize,
    /// Deadline applied to every transport write
    pub write_wait: Duration,
    /// Keepalive ping period
    pub ping_period: Duration,
    /// Maximum silence tolerated on the read side
    pub read_timeout: Duration,
    /// Largest inbound frame accepted
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            send_buffer: DEFAULT_SEND_BUFFER,
            write_wait: DEFAULT_WRITE_WAIT,
            ping_period: DEFAULT_PING_PERIOD,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables if available
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            host: env::var("CHATTY_HOST").unwrap_or(defaults.host),
            port: parse_var("CHATTY_PORT")?.unwrap_or(defaults.port),
            send_buffer: parse_var("CHATTY_SEND_BUFFER")?.unwrap_or(defaults.send_buffer),
            write_wait: parse_var("CHATTY_WRITE_WAIT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.write_wait),
            ping_period: parse_var("CHATTY_PING_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.ping_period),
            read_timeout: parse_var("CHATTY_READ_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.read_timeout),
            max_frame_bytes: parse_var("CHATTY_MAX_FRAME_BYTES")?
                .unwrap_or(defaults.max_frame_bytes),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check that the timing and sizing parameters are coherent
    pub fn validate(&self) -> Result<()> {
        if self.send_buffer == 0 {
            return Err(ChattyError::ConfigError(
                "send buffer must hold at least one payload".to_string(),
            ));
        }
        if self.max_frame_bytes == 0 {
            return Err(ChattyError::ConfigError(
                "max frame size must be greater than zero".to_string(),
            ));
        }
        if self.write_wait.is_zero() || self.ping_period.is_zero() || self.read_timeout.is_zero() {
            return Err(ChattyError::ConfigError(
                "write wait, ping period and read timeout must be non-zero".to_string(),
            ));
        }
        if self.ping_period <= self.write_wait {
            return Err(ChattyError::ConfigError(format!(
                "ping period ({:?}) must be longer than the write wait ({:?})",
                self.ping_period, self.write_wait
            )));
        }
        if self.read_timeout <= self.ping_period {
            return Err(ChattyError::ConfigError(format!(
                "read timeout ({:?}) must be longer than the ping period ({:?})",
                self.read_timeout, self.ping_period
            )));
        }
        Ok(())
    }

    /// Per-connection delivery settings derived from this configuration
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            send_buffer: self.send_buffer,
            write_wait: self.write_wait,
            ping_period: self.ping_period,
        }
    }
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ChattyError::ConfigError(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.send_buffer, 128);
        assert_eq!(config.write_wait, Duration::from_secs(10));
        assert_eq!(config.ping_period, Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_empty_send_buffer() {
        let config = ServerConfig {
            send_buffer: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_ping_inside_write_window() {
        let config = ServerConfig {
            ping_period: Duration::from_secs(5),
            ..ServerConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ping period"));
    }

    #[test]
    fn test_from_env_rejects_garbage() {
        env::set_var("CHATTY_SEND_BUFFER", "lots");
        let result = ServerConfig::from_env();
        env::remove_var("CHATTY_SEND_BUFFER");

        assert!(result.unwrap_err().to_string().contains("CHATTY_SEND_BUFFER"));
    }

    #[test]
    fn test_connection_settings_follow_config() {
        let config = ServerConfig {
            send_buffer: 8,
            ..ServerConfig::default()
        };
        let settings = config.connection_settings();
        assert_eq!(settings.send_buffer, 8);
        assert_eq!(settings.write_wait, config.write_wait);
    }
}
