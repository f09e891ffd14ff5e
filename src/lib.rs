//! Host-side driver for a serial-attached PWM solenoid controller.
//!
//! The board speaks two protocols over one serial line:
//!
//! - **Commands**: `len | cmd | payload | checksum` frames, where configuration commands are
//!   answered by an ACK echoing the command id and duty updates are fire-and-forget.
//!   See [`Controller`].
//! - **Telemetry**: once streaming, the board pushes CRC8-protected packets of 8
//!   `(duty, current)` samples plus occasional time-sync packets. A background thread reads
//!   them into a [`SampleBuffer`] and a binary log (see [`binlog`]), which [`export_csv`]
//!   turns into CSV.
//!
//! # Timing
//!
//! Sample timestamps are host seconds since the stream started, taken when each packet is
//! decoded; all 8 samples of a packet share one timestamp. The board's own clock arrives as
//! [`StreamEvent::TimeSync`] events; reconciling the two clocks is left to the caller.

pub mod binlog;
pub mod buffer;
pub mod checksum;
pub mod config;
pub mod controller;
pub mod errors;
pub mod export;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod stream;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use binlog::{BinaryLogReader, BinaryLogWriter, LogHeader, LogRecord, LogSummary};
pub use buffer::{SampleBuffer, SampleSeries};
pub use config::{ConfigError, LinkConfig};
pub use controller::Controller;
pub use errors::*;
pub use export::{export_csv, ExportOutcome};
pub use logging::{init_logging, init_logging_with_level};
pub use protocol::{DutyScale, Packet, SegmentShape, SoftRelease, StatusRecord, TrajectorySegment};
pub use session::{StreamEvent, StreamSession, StreamSummary};
pub use stream::{RawSample, StreamStats};
pub use transport::{MemoryHandle, MemoryTransport, Transport};
