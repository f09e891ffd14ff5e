//! Command packet framing and payload layouts.
//!
//! Wire format of a command packet, in both directions:
//!
//! ```text
//! length (1B) | cmd_id (1B) | payload (0..=62B) | checksum (1B)
//! ```
//!
//! `length` counts `cmd_id` plus the payload and never exceeds 64. The checksum is the byte
//! sum of `cmd_id ‖ payload` modulo 256. Multi-byte payload fields are big-endian.

use crate::checksum::command_checksum;
use crate::errors::{DriverError, Result};

// ============================================================================
// Command IDs
// ============================================================================

pub const CMD_PING: u8 = 0x01;
pub const CMD_GET_STATUS: u8 = 0x02;
pub const CMD_GET_DUTY: u8 = 0x03;
pub const CMD_STOP_PWM: u8 = 0x09;
pub const CMD_SET_PWM_OUTPUT_PIN: u8 = 0x10;
pub const CMD_SET_PWM_SENSING_PIN: u8 = 0x11;
pub const CMD_SET_CURRENT_SENSING_PIN: u8 = 0x12;
pub const CMD_SET_PWM_FREQ: u8 = 0x13;
pub const CMD_SET_PWM_ADC_RATE: u8 = 0x14;
pub const CMD_SET_CURRENT_ADC_RATE: u8 = 0x15;
pub const CMD_SET_PWM_ADC_RES: u8 = 0x16;
pub const CMD_SET_CURRENT_ADC_RES: u8 = 0x17;
pub const CMD_SET_PWM_DEPTH: u8 = 0x18;
pub const CMD_SET_DUTY_ACK: u8 = 0x19;
pub const CMD_SET_DUTY: u8 = 0x20;
pub const CMD_SET_DUTY_FAST: u8 = 0x21;
pub const CMD_SAVE_SETTINGS: u8 = 0x30;
pub const CMD_SOFT_RESET: u8 = 0x31;
pub const CMD_SOFT_RESET_SAVE: u8 = 0x32;
pub const CMD_START_STREAM: u8 = 0x40;
pub const CMD_STOP_STREAM: u8 = 0x41;
pub const CMD_START_AUTOMATION: u8 = 0x50;
pub const CMD_STOP_AUTOMATION: u8 = 0x51;
pub const CMD_TRAJECTORY_SEGMENT: u8 = 0x52;
pub const CMD_SOFT_RELEASE: u8 = 0x60;
pub const CMD_ACK: u8 = 0x7F;
/// Firmware error reply; payload is `[error_code]`.
pub const CMD_ERROR: u8 = 0xFE;

/// Largest allowed value of the length byte.
pub const MAX_PACKET_LEN: usize = 64;
/// Largest payload that fits in a packet.
pub const MAX_PAYLOAD_LEN: usize = MAX_PACKET_LEN - 2;
/// Size of the status record payload.
pub const STATUS_PAYLOAD_LEN: usize = 16;

// ============================================================================
// Packet codec
// ============================================================================

/// A decoded command or response packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub cmd_id: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(cmd_id: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            cmd_id,
            payload: payload.into(),
        }
    }

    /// Frame this packet for the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_packet(self.cmd_id, &self.payload)
    }
}

/// Frame `cmd_id` and `payload` as `length | cmd_id | payload | checksum`.
pub fn encode_packet(cmd_id: u8, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(DriverError::framing(
            Some(cmd_id),
            format!(
                "payload of {} bytes exceeds {} byte limit",
                payload.len(),
                MAX_PAYLOAD_LEN
            ),
        ));
    }
    let mut frame = Vec::with_capacity(payload.len() + 3);
    frame.push((payload.len() + 1) as u8);
    frame.push(cmd_id);
    frame.extend_from_slice(payload);
    frame.push(command_checksum(cmd_id, payload));
    Ok(frame)
}

/// Decode one complete frame. The slice must hold exactly one packet.
pub fn decode_packet(frame: &[u8]) -> Result<Packet> {
    if frame.len() < 3 {
        return Err(DriverError::framing(
            None,
            format!("frame of {} bytes is shorter than 3", frame.len()),
        ));
    }
    let length = frame[0] as usize;
    let cmd_id = frame[1];
    if length == 0 || length > MAX_PACKET_LEN {
        return Err(DriverError::framing(
            Some(cmd_id),
            format!("invalid length byte {length}"),
        ));
    }
    if frame.len() != length + 2 {
        return Err(DriverError::framing(
            Some(cmd_id),
            format!("length byte {length} does not match frame of {} bytes", frame.len()),
        ));
    }
    let payload = &frame[2..frame.len() - 1];
    let received = frame[frame.len() - 1];
    verify_checksum(cmd_id, payload, received)?;
    Ok(Packet::new(cmd_id, payload))
}

pub(crate) fn verify_checksum(cmd_id: u8, payload: &[u8], received: u8) -> Result<()> {
    let expected = command_checksum(cmd_id, payload);
    if expected != received {
        return Err(DriverError::Integrity {
            cmd: cmd_id,
            expected,
            actual: received,
        });
    }
    Ok(())
}

/// The full ACK frame the board sends for `cmd_id`.
pub fn ack_frame(cmd_id: u8) -> [u8; 4] {
    [2, CMD_ACK, cmd_id, command_checksum(CMD_ACK, &[cmd_id])]
}

/// Whether a command is answered with an ACK.
pub fn expects_ack(cmd_id: u8) -> bool {
    matches!(
        cmd_id,
        CMD_PING
            | CMD_STOP_PWM
            | CMD_SET_PWM_OUTPUT_PIN
            | CMD_SET_PWM_SENSING_PIN
            | CMD_SET_CURRENT_SENSING_PIN
            | CMD_SET_PWM_FREQ
            | CMD_SET_PWM_ADC_RATE
            | CMD_SET_CURRENT_ADC_RATE
            | CMD_SET_PWM_ADC_RES
            | CMD_SET_CURRENT_ADC_RES
            | CMD_SET_PWM_DEPTH
            | CMD_SET_DUTY_ACK
            | CMD_SAVE_SETTINGS
            | CMD_SOFT_RESET_SAVE
            | CMD_START_STREAM
            | CMD_STOP_STREAM
            | CMD_SOFT_RELEASE
    )
}

// ============================================================================
// Status record
// ============================================================================

/// Device configuration as reported by `GET_STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRecord {
    pub firmware_major: u8,
    pub firmware_minor: u8,
    pub pwm_output_pin: u8,
    pub pwm_sensing_pin: u8,
    pub current_sensing_pin: u8,
    /// PWM carrier frequency in Hz.
    pub pwm_frequency: u32,
    /// Duty sense ADC rate in Hz.
    pub pwm_adc_rate: u16,
    /// Current sense ADC rate in Hz.
    pub current_adc_rate: u16,
    /// Duty sense ADC resolution in bits.
    pub pwm_adc_resolution: u8,
    /// Current sense ADC resolution in bits.
    pub current_adc_resolution: u8,
    /// PWM resolution in bits.
    pub pwm_depth: u8,
}

impl StatusRecord {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() != STATUS_PAYLOAD_LEN {
            return Err(DriverError::protocol(
                CMD_GET_STATUS,
                format!(
                    "status payload must be {STATUS_PAYLOAD_LEN} bytes, got {}",
                    payload.len()
                ),
            ));
        }
        let p = payload;
        Ok(Self {
            firmware_major: p[0],
            firmware_minor: p[1],
            pwm_output_pin: p[2],
            pwm_sensing_pin: p[3],
            current_sensing_pin: p[4],
            pwm_frequency: u32::from_be_bytes([p[5], p[6], p[7], p[8]]),
            pwm_adc_rate: u16::from_be_bytes([p[9], p[10]]),
            current_adc_rate: u16::from_be_bytes([p[11], p[12]]),
            pwm_adc_resolution: p[13],
            current_adc_resolution: p[14],
            pwm_depth: p[15],
        })
    }

    pub fn encode(&self) -> [u8; STATUS_PAYLOAD_LEN] {
        let mut out = [0u8; STATUS_PAYLOAD_LEN];
        out[0] = self.firmware_major;
        out[1] = self.firmware_minor;
        out[2] = self.pwm_output_pin;
        out[3] = self.pwm_sensing_pin;
        out[4] = self.current_sensing_pin;
        out[5..9].copy_from_slice(&self.pwm_frequency.to_be_bytes());
        out[9..11].copy_from_slice(&self.pwm_adc_rate.to_be_bytes());
        out[11..13].copy_from_slice(&self.current_adc_rate.to_be_bytes());
        out[13] = self.pwm_adc_resolution;
        out[14] = self.current_adc_resolution;
        out[15] = self.pwm_depth;
        out
    }

    /// Firmware version as `"major.minor"`.
    pub fn firmware_version(&self) -> String {
        format!("{}.{}", self.firmware_major, self.firmware_minor)
    }

    /// Largest raw duty value the configured PWM resolution accepts.
    pub fn max_duty(&self) -> u16 {
        match self.pwm_depth {
            0 => 0,
            bits if bits >= 16 => u16::MAX,
            bits => (1u16 << bits) - 1,
        }
    }
}

// ============================================================================
// Duty scaling
// ============================================================================

/// Percent to raw duty conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DutyScale {
    /// Raw value corresponding to 100 %.
    pub depth: u16,
    /// Output stage is active-low: 0 % drives the raw maximum.
    pub inverted: bool,
}

impl Default for DutyScale {
    fn default() -> Self {
        Self {
            depth: 1023,
            inverted: true,
        }
    }
}

impl DutyScale {
    pub fn new(depth: u16, inverted: bool) -> Self {
        Self { depth, inverted }
    }

    /// `round((inverted ? 100 - percent : percent) / 100 * depth)`, halves rounded up.
    ///
    /// Percentages outside `0..=100` are clamped.
    pub fn to_raw(&self, percent: f64) -> u16 {
        let percent = if percent.is_nan() { 0.0 } else { percent.clamp(0.0, 100.0) };
        let effective = if self.inverted { 100.0 - percent } else { percent };
        let scaled = (effective / 100.0 * self.depth as f64 + 0.5).floor();
        scaled.clamp(0.0, self.depth as f64) as u16
    }

    /// Inverse of [`to_raw`](Self::to_raw), for display.
    pub fn to_percent(&self, raw: u16) -> f64 {
        if self.depth == 0 {
            return 0.0;
        }
        let percent = raw.min(self.depth) as f64 / self.depth as f64 * 100.0;
        if self.inverted {
            100.0 - percent
        } else {
            percent
        }
    }
}

// ============================================================================
// Motion payloads
// ============================================================================

/// Ramp shape of a trajectory segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SegmentShape {
    /// Jump straight to the end value.
    Step = 0,
    /// Linear ramp from start to end.
    #[default]
    Linear = 1,
}

/// Longest segment the 16-bit microsecond field can express.
pub const MAX_SEGMENT_DURATION_US: u32 = u16::MAX as u32;

/// One queued trajectory segment, in raw duty units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrajectorySegment {
    pub start_raw: u16,
    pub end_raw: u16,
    pub duration_us: u16,
    pub shape: SegmentShape,
}

impl TrajectorySegment {
    /// Build a segment from percentages and a millisecond duration.
    ///
    /// Fails if the duration does not fit the 16-bit microsecond wire field.
    pub fn from_percent(
        scale: &DutyScale,
        start_percent: f64,
        end_percent: f64,
        duration_ms: f64,
        shape: SegmentShape,
    ) -> Result<Self> {
        if !duration_ms.is_finite() || duration_ms < 0.0 {
            return Err(DriverError::InvalidArgument(format!(
                "segment duration {duration_ms} ms is not a non-negative number"
            )));
        }
        let duration_us = (duration_ms * 1000.0).round();
        if duration_us > MAX_SEGMENT_DURATION_US as f64 {
            return Err(DriverError::InvalidArgument(format!(
                "segment duration {duration_ms} ms exceeds {:.3} ms",
                MAX_SEGMENT_DURATION_US as f64 / 1000.0
            )));
        }
        Ok(Self {
            start_raw: scale.to_raw(start_percent),
            end_raw: scale.to_raw(end_percent),
            duration_us: duration_us as u16,
            shape,
        })
    }

    pub fn encode(&self) -> [u8; 7] {
        let mut out = [0u8; 7];
        out[0..2].copy_from_slice(&self.start_raw.to_be_bytes());
        out[2..4].copy_from_slice(&self.end_raw.to_be_bytes());
        out[4..6].copy_from_slice(&self.duration_us.to_be_bytes());
        out[6] = self.shape as u8;
        out
    }
}

/// Soft-release request: step the duty down from `start_raw` over `n_steps` at `freq_hz`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftRelease {
    pub start_raw: u16,
    pub n_steps: u16,
    pub freq_hz: u16,
    pub power_index: u8,
}

impl SoftRelease {
    pub fn encode(&self) -> [u8; 7] {
        let mut out = [0u8; 7];
        out[0..2].copy_from_slice(&self.start_raw.to_be_bytes());
        out[2..4].copy_from_slice(&self.n_steps.to_be_bytes());
        out[4..6].copy_from_slice(&self.freq_hz.to_be_bytes());
        out[6] = self.power_index;
        out
    }
}
