use crate::error::{AmsError, Result};
use crate::protocol::MAX_CHANNELS;
use crate::volume::VolumeCurve;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// TCP port the switch listens on out of the box
pub const DEFAULT_PORT: u16 = 52000;

/// Inputs on the 8x8 model
pub const DEFAULT_INPUT_COUNT: u8 = 8;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Everything needed to talk to one switch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmsConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Number of physical inputs; also the "disconnected" sentinel on the wire
    #[serde(default = "default_input_count")]
    pub input_count: u8,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    /// Calibration used to read dB volume responses
    #[serde(default)]
    pub volume_curve: VolumeCurve,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_input_count() -> u8 {
    DEFAULT_INPUT_COUNT
}

impl AmsConfig {
    pub fn new(host: impl Into<String>, port: u16, input_count: u8) -> Self {
        Self {
            host: host.into(),
            port,
            input_count,
            dispatcher: DispatcherConfig::default(),
            transport: TransportConfig::default(),
            volume_curve: VolumeCurve::default(),
        }
    }

    /// Parse and validate a JSON config document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(AmsError::InvalidConfig("host is empty".to_string()));
        }
        if self.port == 0 {
            return Err(AmsError::InvalidConfig("port is 0".to_string()));
        }
        if self.input_count == 0 || self.input_count > MAX_CHANNELS {
            return Err(AmsError::InvalidConfig(format!(
                "input_count {} outside 1..={}",
                self.input_count, MAX_CHANNELS
            )));
        }
        Ok(())
    }

    /// `host:port` for connecting and logging
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Pacing and polling of the command queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Minimum gap between two commands
    #[serde(default = "default_min_send_interval_ms")]
    pub min_send_interval_ms: u64,

    /// Delay between two round-robin output refreshes
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on opening the socket, settle delay included
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_min_send_interval_ms() -> u64 {
    150
}

fn default_poll_interval_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            min_send_interval_ms: default_min_send_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl DispatcherConfig {
    pub fn min_send_interval(&self) -> Duration {
        Duration::from_millis(self.min_send_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms).max(MIN_POLL_INTERVAL)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Device tolerance delays and read deadline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Wait after opening the socket; the device drops commands sent immediately
    #[serde(default = "default_connect_settle_ms")]
    pub connect_settle_ms: u64,

    /// Wait between writing a command and reading its response
    #[serde(default = "default_command_settle_ms")]
    pub command_settle_ms: u64,

    /// Deadline for each response frame
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_connect_settle_ms() -> u64 {
    200
}

fn default_command_settle_ms() -> u64 {
    100
}

fn default_read_timeout_ms() -> u64 {
    5_000
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_settle_ms: default_connect_settle_ms(),
            command_settle_ms: default_command_settle_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl TransportConfig {
    pub fn connect_settle(&self) -> Duration {
        Duration::from_millis(self.connect_settle_ms)
    }

    pub fn command_settle(&self) -> Duration {
        Duration::from_millis(self.command_settle_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_json_gets_defaults() {
        let config = AmsConfig::from_json(r#"{ "host": "192.168.0.22" }"#).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.input_count, DEFAULT_INPUT_COUNT);
        assert_eq!(config.dispatcher.min_send_interval(), Duration::from_millis(150));
        assert_eq!(config.dispatcher.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.transport.connect_settle(), Duration::from_millis(200));
        assert_eq!(config.transport.command_settle(), Duration::from_millis(100));
        assert_eq!(config.transport.read_timeout(), Duration::from_secs(5));
        assert_eq!(config.volume_curve, VolumeCurve::measured());
        assert_eq!(config.address(), "192.168.0.22:52000");
    }

    #[test]
    fn test_partial_sections() {
        let config = AmsConfig::from_json(
            r#"{ "host": "amp", "port": 4000, "input_count": 16,
                 "dispatcher": { "poll_interval_ms": 1 },
                 "transport": { "read_timeout_ms": 250 } }"#,
        )
        .unwrap();
        assert_eq!(config.input_count, 16);
        assert_eq!(config.dispatcher.poll_interval(), MIN_POLL_INTERVAL);
        assert_eq!(config.dispatcher.min_send_interval_ms, 150);
        assert_eq!(config.transport.read_timeout(), Duration::from_millis(250));
        assert_eq!(config.transport.connect_settle_ms, 200);
    }

    #[test]
    fn test_validation() {
        assert!(AmsConfig::new("", 52000, 8).validate().is_err());
        assert!(AmsConfig::new("amp", 0, 8).validate().is_err());
        assert!(AmsConfig::new("amp", 52000, 0).validate().is_err());
        assert!(AmsConfig::new("amp", 52000, 25).validate().is_err());
        assert!(AmsConfig::new("amp", 52000, 24).validate().is_ok());
        assert!(matches!(
            AmsConfig::from_json(r#"{ "host": "amp", "volume_curve": [1.0] }"#),
            Err(AmsError::Json(_))
        ));
    }
}
