use std::io;
use thiserror::Error;

use crate::config::ConfigError;

/// Error codes the firmware reports in its `0xFE` error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorCode {
    InvalidPayload,
    InvalidDuty,
    UnknownCommand,
    Other(u8),
}

impl DeviceErrorCode {
    pub fn from_byte(code: u8) -> Self {
        match code {
            0xE1 => DeviceErrorCode::InvalidPayload,
            0xE2 => DeviceErrorCode::InvalidDuty,
            0xE3 => DeviceErrorCode::UnknownCommand,
            other => DeviceErrorCode::Other(other),
        }
    }
}

impl std::fmt::Display for DeviceErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceErrorCode::InvalidPayload => f.write_str("invalid payload"),
            DeviceErrorCode::InvalidDuty => f.write_str("invalid duty"),
            DeviceErrorCode::UnknownCommand => f.write_str("unknown command"),
            DeviceErrorCode::Other(code) => write!(f, "error code {code:#04x}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    /// `cmd` is `None` for operations that send nothing, such as a bare packet read.
    #[error("connection not open{}", cmd_suffix(.cmd))]
    NotConnected { cmd: Option<u8> },
    #[error("stream session active; stop streaming first{}", cmd_suffix(.cmd))]
    StreamActive { cmd: Option<u8> },
    #[error("framing error: {reason}")]
    Framing { cmd: Option<u8>, reason: String },
    #[error("checksum mismatch for cmd {cmd:#04x}: expected {expected:#04x}, got {actual:#04x}")]
    Integrity { cmd: u8, expected: u8, actual: u8 },
    #[error("protocol error (cmd {cmd:#04x}): {reason}")]
    Protocol { cmd: u8, reason: String },
    #[error("device rejected cmd {cmd:#04x}: {code}")]
    Device { cmd: u8, code: DeviceErrorCode },
    #[error("corrupt log record at offset {offset}: {reason}")]
    RecordCorruption { offset: u64, reason: String },
    #[error("invalid stream log: {0}")]
    InvalidLog(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("stream reader thread failed: {0}")]
    Thread(String),
}

impl DriverError {
    pub(crate) fn protocol(cmd: u8, reason: impl Into<String>) -> Self {
        DriverError::Protocol {
            cmd,
            reason: reason.into(),
        }
    }

    pub(crate) fn framing(cmd: Option<u8>, reason: impl Into<String>) -> Self {
        DriverError::Framing {
            cmd,
            reason: reason.into(),
        }
    }

    /// Command id the failing operation was about, when there is one.
    pub fn command_id(&self) -> Option<u8> {
        match self {
            DriverError::NotConnected { cmd } | DriverError::StreamActive { cmd } => *cmd,
            DriverError::Integrity { cmd, .. }
            | DriverError::Protocol { cmd, .. }
            | DriverError::Device { cmd, .. } => Some(*cmd),
            DriverError::Framing { cmd, .. } => *cmd,
            _ => None,
        }
    }

    /// True when the link has been (or must be) closed and the caller has to reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DriverError::Io(_)
                | DriverError::Serial(_)
                | DriverError::NotConnected { .. }
                | DriverError::Framing { .. }
                | DriverError::Integrity { .. }
                | DriverError::Protocol { .. }
                | DriverError::Device { .. }
        )
    }
}

fn cmd_suffix(cmd: &Option<u8>) -> String {
    match cmd {
        Some(cmd) => format!(" (cmd {cmd:#04x})"),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
