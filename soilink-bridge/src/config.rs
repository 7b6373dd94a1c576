//! Configuration for the soil sensor bridge.
//!
//! Every field has a default, so `{}` is a complete configuration.

use serde::{Deserialize, Serialize};
use soilink_common::LoggingConfig;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::packet::{DeviceIdentity, PacketError};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] soilink_common::Error),
    #[error(transparent)]
    Identity(#[from] PacketError),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SoilBridgeConfig {
    /// Device identity settings
    #[serde(default)]
    pub device: DeviceConfig,

    /// Collector (TCP server) settings
    #[serde(default)]
    pub collector: CollectorConfig,

    /// RS-485 sensor settings
    #[serde(default)]
    pub sensor: SensorConfig,

    /// Cycle timing
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Device identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// 15-digit IMEI sent in the login packet
    #[serde(default = "default_identity")]
    pub identity: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            identity: default_identity(),
        }
    }
}

fn default_identity() -> String {
    "862942071230965".to_string()
}

/// Collector connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Host address (IP or hostname)
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Timeout for connect, login acknowledgment and writes
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Maximum bytes read for the login acknowledgment
    #[serde(default = "default_ack_max_bytes")]
    pub ack_max_bytes: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_secs: default_connect_timeout(),
            ack_max_bytes: default_ack_max_bytes(),
        }
    }
}

fn default_host() -> String {
    "13.126.118.139".to_string()
}

fn default_port() -> u16 {
    9619
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_ack_max_bytes() -> usize {
    64
}

/// Serial line and decoder settings for the sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0" or "COM1")
    #[serde(default = "default_serial_port")]
    pub port: String,

    /// Baud rate (default: 9600)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Data bits (default: 8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,

    /// Parity: "none", "even", or "odd" (default: "none")
    #[serde(default = "default_parity")]
    pub parity: String,

    /// Stop bits: 1 or 2 (default: 1)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,

    /// Line silence that ends a received frame, in milliseconds.
    /// Must exceed the USB-serial adapter's latency timer (16ms on FTDI).
    #[serde(default = "default_frame_gap_ms")]
    pub frame_gap_ms: u64,

    /// Pending receive notifications before the port has to wait
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Reject responses with a bad Modbus CRC
    #[serde(default = "default_verify_crc")]
    pub verify_crc: bool,

    /// Delay after opening the port before the first query, in milliseconds
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: default_parity(),
            stop_bits: default_stop_bits(),
            frame_gap_ms: default_frame_gap_ms(),
            queue_capacity: default_queue_capacity(),
            verify_crc: default_verify_crc(),
            settle_ms: default_settle_ms(),
        }
    }
}

fn default_serial_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

fn default_frame_gap_ms() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    5
}

fn default_verify_crc() -> bool {
    true
}

fn default_settle_ms() -> u64 {
    1000
}

/// Cycle timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Pause between cycles in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// How many times to check for a sensor reply
    #[serde(default = "default_reply_wait_checks")]
    pub reply_wait_checks: u32,

    /// Spacing between reply checks in milliseconds
    #[serde(default = "default_reply_wait_interval_ms")]
    pub reply_wait_interval_ms: u64,

    /// Pause before reconnecting after a transport failure, in seconds
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            reply_wait_checks: default_reply_wait_checks(),
            reply_wait_interval_ms: default_reply_wait_interval_ms(),
            reconnect_backoff_secs: default_reconnect_backoff(),
        }
    }
}

fn default_poll_interval() -> u64 {
    30
}

fn default_reply_wait_checks() -> u32 {
    5
}

fn default_reply_wait_interval_ms() -> u64 {
    1000
}

fn default_reconnect_backoff() -> u64 {
    5
}

impl ScheduleConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn reply_wait_interval(&self) -> Duration {
        Duration::from_millis(self.reply_wait_interval_ms)
    }

    /// Upper bound on waiting for a sensor reply.
    pub fn reply_wait(&self) -> Duration {
        self.reply_wait_interval() * self.reply_wait_checks
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }
}

impl SoilBridgeConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: SoilBridgeConfig = soilink_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: SoilBridgeConfig = soilink_common::parse_config(content)?;
        config.validate()?;
        Ok(config)
    }

    /// The validated device identity.
    pub fn identity(&self) -> Result<DeviceIdentity, ConfigError> {
        Ok(self.device.identity.parse()?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.identity()?;

        if self.collector.host.is_empty() {
            return Err(ConfigError::Validation(
                "Collector host cannot be empty".to_string(),
            ));
        }

        if self.collector.port == 0 {
            return Err(ConfigError::Validation(
                "Collector port must be non-zero".to_string(),
            ));
        }

        if self.collector.connect_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "connect_timeout_secs must be non-zero".to_string(),
            ));
        }

        let sensor = &self.sensor;
        match sensor.parity.to_lowercase().as_str() {
            "none" | "even" | "odd" => {}
            _ => {
                return Err(ConfigError::Validation(format!(
                    "Invalid parity '{}' (use none, even, or odd)",
                    sensor.parity
                )));
            }
        }

        if !(5..=8).contains(&sensor.data_bits) {
            return Err(ConfigError::Validation(format!(
                "Invalid data_bits {} (use 5-8)",
                sensor.data_bits
            )));
        }

        if !(1..=2).contains(&sensor.stop_bits) {
            return Err(ConfigError::Validation(format!(
                "Invalid stop_bits {} (use 1 or 2)",
                sensor.stop_bits
            )));
        }

        if sensor.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "queue_capacity must be at least 1".to_string(),
            ));
        }

        let schedule = &self.schedule;
        if schedule.poll_interval_secs == 0
            || schedule.reply_wait_checks == 0
            || schedule.reply_wait_interval_ms == 0
            || schedule.reconnect_backoff_secs == 0
        {
            return Err(ConfigError::Validation(
                "Schedule intervals must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}
