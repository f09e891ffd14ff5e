//! Link configuration, loaded from a TOML file.
//!
//! Every field has a default, so an empty file (or no file at all) yields a working
//! configuration for a board on the default serial settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::buffer::DEFAULT_CAPACITY;
use crate::protocol::DutyScale;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("validation failed: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub serial: SerialConfig,
    pub pwm: PwmConfig,
    pub stream: StreamConfig,
    pub protocol: ProtocolConfig,
}

/// Serial port settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyACM0` or `COM3`. Empty means "pass it on the command line".
    pub port: String,
    pub baud_rate: u32,
    /// Per-read timeout.
    pub timeout_ms: u64,
    /// How long to wait after opening the port for the board to finish booting.
    pub settle_ms: u64,
}

/// PWM resolution as configured on the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PwmConfig {
    pub depth: u16,
    /// Low-side driver: 100 % effective duty is raw 0.
    pub inverting: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub buffer_capacity: usize,
    pub log_dir: PathBuf,
    /// Written into the log header when the board does not report its ADC rate.
    pub sample_rate: f32,
    pub poll_timeout_ms: u64,
}

/// Command response polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub read_retries: u32,
    pub read_delay_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 115_200,
            timeout_ms: 1000,
            settle_ms: 2000,
        }
    }
}

impl Default for PwmConfig {
    fn default() -> Self {
        Self {
            depth: 1023,
            inverting: true,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_CAPACITY,
            log_dir: PathBuf::from("stream_data"),
            sample_rate: 10_000.0,
            poll_timeout_ms: 200,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            read_retries: 10,
            read_delay_ms: 10,
        }
    }
}

/// Retry policy for reading a command response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketTiming {
    pub retries: u32,
    pub delay: Duration,
}

impl Default for PacketTiming {
    fn default() -> Self {
        ProtocolConfig::default().timing()
    }
}

/// Everything a stream session needs to know up front.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    pub buffer_capacity: usize,
    pub log_dir: PathBuf,
    pub fallback_sample_rate: f32,
    pub poll_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        StreamConfig::default().settings()
    }
}

impl ProtocolConfig {
    pub fn timing(&self) -> PacketTiming {
        PacketTiming {
            retries: self.read_retries,
            delay: Duration::from_millis(self.read_delay_ms),
        }
    }
}

impl StreamConfig {
    pub fn settings(&self) -> StreamSettings {
        StreamSettings {
            buffer_capacity: self.buffer_capacity,
            log_dir: self.log_dir.clone(),
            fallback_sample_rate: self.sample_rate,
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
        }
    }
}

impl PwmConfig {
    pub fn scale(&self) -> DutyScale {
        DutyScale::new(self.depth, self.inverting)
    }
}

impl SerialConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl LinkConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: LinkConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`load`](Self::load), but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::Validation("baud rate must be greater than 0".to_string()));
        }
        if self.serial.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "serial timeout must be greater than 0".to_string(),
            ));
        }
        if self.pwm.depth == 0 {
            return Err(ConfigError::Validation("PWM depth must be greater than 0".to_string()));
        }
        if self.stream.buffer_capacity == 0 {
            return Err(ConfigError::Validation(
                "stream buffer capacity must be greater than 0".to_string(),
            ));
        }
        if !(self.stream.sample_rate.is_finite() && self.stream.sample_rate > 0.0) {
            return Err(ConfigError::Validation(
                "stream sample rate must be a positive number".to_string(),
            ));
        }
        if self.stream.poll_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "stream poll timeout must be greater than 0".to_string(),
            ));
        }
        if self.protocol.read_retries == 0 {
            return Err(ConfigError::Validation("read retries must be at least 1".to_string()));
        }
        Ok(())
    }
}
