//! Command side of the link: framing, ACK handling and the stream lifecycle.

use std::io::{self, Read, Write};
use std::mem;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;
use log::{debug, info, warn};

use crate::binlog::BinaryLogWriter;
use crate::buffer::SampleBuffer;
use crate::config::{LinkConfig, PacketTiming, StreamSettings};
use crate::errors::{DeviceErrorCode, DriverError, Result};
use crate::logging::{trace_rx, trace_tx};
use crate::protocol::*;
use crate::session::{StreamSession, StreamSummary};
use crate::stream::is_timeout;
use crate::transport::{open_serial, Transport};

enum Link {
    Closed,
    Idle(Box<dyn Transport>),
    Streaming(StreamSession),
}

/// Driver for the solenoid controller board.
///
/// The link is either closed, idle (commands allowed) or streaming (a background reader owns
/// the channel). Any command-protocol failure closes the link; the caller reconnects.
///
/// # Example
/// ```ignore
/// let config = LinkConfig::load_or_default(Path::new("solenoid.toml"))?;
/// let mut ctrl = Controller::open(&config)?;
///
/// println!("firmware {}", ctrl.get_status()?.firmware_version());
/// ctrl.send_duty(40.0)?;
///
/// let buffer = ctrl.start_streaming()?;
/// std::thread::sleep(Duration::from_secs(1));
/// println!("{} samples", buffer.len());
/// ctrl.stop_streaming()?;
/// ```
pub struct Controller {
    link: Link,
    scale: DutyScale,
    timing: PacketTiming,
    stream: StreamSettings,
    last_status: Option<StatusRecord>,
}

impl Controller {
    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Open the configured serial port, let the board settle, drain stale bytes and ping.
    pub fn open(config: &LinkConfig) -> Result<Self> {
        let port = config.serial.port.trim();
        if port.is_empty() {
            return Err(DriverError::InvalidArgument("no serial port configured".to_string()));
        }
        let serial = open_serial(port, config.serial.baud_rate, config.serial.timeout())?;
        thread::sleep(config.serial.settle());
        Self::connect(serial, config)
    }

    /// Handshake over an already-open transport: drain pending input, then ping.
    pub fn connect(transport: impl Transport + 'static, config: &LinkConfig) -> Result<Self> {
        let mut ctrl = Self::from_transport(transport, config);
        if let Link::Idle(t) = &mut ctrl.link {
            let pending = t.bytes_available()?;
            if pending > 0 {
                debug!("draining {} pre-connection bytes", pending);
            }
            t.clear_input()?;
        }
        ctrl.ping()?;
        info!("connected");
        Ok(ctrl)
    }

    /// Wrap a transport without any handshake.
    pub fn from_transport(transport: impl Transport + 'static, config: &LinkConfig) -> Self {
        Self {
            link: Link::Idle(Box::new(transport)),
            scale: config.pwm.scale(),
            timing: config.protocol.timing(),
            stream: config.stream.settings(),
            last_status: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self.link, Link::Closed)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.link, Link::Streaming(_))
    }

    /// Stop any stream session and release the channel.
    pub fn close(&mut self) {
        if self.is_streaming() {
            if let Err(e) = self.stop_streaming() {
                warn!("error stopping stream while closing: {}", e);
            }
        }
        if self.is_connected() {
            info!("connection closed");
        }
        self.link = Link::Closed;
    }

    pub fn duty_scale(&self) -> DutyScale {
        self.scale
    }

    pub fn set_duty_scale(&mut self, scale: DutyScale) {
        self.scale = scale;
    }

    /// Status from the most recent successful [`get_status`](Self::get_status).
    pub fn last_status(&self) -> Option<&StatusRecord> {
        self.last_status.as_ref()
    }

    /// The running stream session, if any.
    pub fn session(&self) -> Option<&StreamSession> {
        match &self.link {
            Link::Streaming(session) => Some(session),
            _ => None,
        }
    }

    // ------------------------------------------------------------------------
    // Protocol primitives
    // ------------------------------------------------------------------------

    /// Frame and send one command packet.
    pub fn send_command(&mut self, cmd_id: u8, payload: &[u8]) -> Result<()> {
        self.exchange(cmd_id, |t, _| write_packet(t, cmd_id, payload))
    }

    /// Read one command packet, polling `retries` times `delay` apart for it to start.
    ///
    /// `Ok(None)` means nothing arrived.
    pub fn read_packet(&mut self, retries: u32, delay: Duration) -> Result<Option<Packet>> {
        self.on_link(None, |t, _| read_frame(t, retries, delay))
    }

    /// Read an ACK and return the echoed command id, checking it against `expected_cmd`.
    pub fn read_ack(&mut self, expected_cmd: Option<u8>) -> Result<u8> {
        self.on_link(expected_cmd, |t, timing| read_ack_frame(t, timing, expected_cmd))
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn ping(&mut self) -> Result<()> {
        self.acked(CMD_PING, &[])?;
        debug!("PING acknowledged");
        Ok(())
    }

    /// Request and decode the device configuration.
    pub fn get_status(&mut self) -> Result<StatusRecord> {
        let payload = self.request(CMD_GET_STATUS)?;
        let status = self.exchange(CMD_GET_STATUS, |_, _| StatusRecord::decode(&payload))?;
        debug!("status: {:?}", status);
        self.last_status = Some(status);
        Ok(status)
    }

    /// Current raw duty as held by the board.
    pub fn get_duty(&mut self) -> Result<u16> {
        let payload = self.request(CMD_GET_DUTY)?;
        self.exchange(CMD_GET_DUTY, |_, _| match payload[..] {
            [hi, lo] => Ok(u16::from_be_bytes([hi, lo])),
            _ => Err(DriverError::protocol(
                CMD_GET_DUTY,
                format!("duty payload must be 2 bytes, got {}", payload.len()),
            )),
        })
    }

    // ------------------------------------------------------------------------
    // Acknowledged configuration commands
    // ------------------------------------------------------------------------

    pub fn stop_pwm(&mut self) -> Result<()> {
        self.acked(CMD_STOP_PWM, &[])?;
        info!("PWM stopped");
        Ok(())
    }

    pub fn set_pwm_output_pin(&mut self, pin: u8) -> Result<()> {
        self.acked(CMD_SET_PWM_OUTPUT_PIN, &[pin])
    }

    pub fn set_pwm_sensing_pin(&mut self, pin: u8) -> Result<()> {
        self.acked(CMD_SET_PWM_SENSING_PIN, &[pin])
    }

    pub fn set_current_sensing_pin(&mut self, pin: u8) -> Result<()> {
        self.acked(CMD_SET_CURRENT_SENSING_PIN, &[pin])
    }

    pub fn set_pwm_frequency(&mut self, frequency_hz: u32) -> Result<()> {
        self.acked(CMD_SET_PWM_FREQ, &frequency_hz.to_be_bytes())
    }

    pub fn set_pwm_adc_rate(&mut self, rate_hz: u16) -> Result<()> {
        self.acked(CMD_SET_PWM_ADC_RATE, &rate_hz.to_be_bytes())
    }

    pub fn set_current_adc_rate(&mut self, rate_hz: u16) -> Result<()> {
        self.acked(CMD_SET_CURRENT_ADC_RATE, &rate_hz.to_be_bytes())
    }

    pub fn set_pwm_adc_resolution(&mut self, bits: u8) -> Result<()> {
        self.acked(CMD_SET_PWM_ADC_RES, &[bits])
    }

    pub fn set_current_adc_resolution(&mut self, bits: u8) -> Result<()> {
        self.acked(CMD_SET_CURRENT_ADC_RES, &[bits])
    }

    /// Set the PWM resolution in bits; the local duty scale follows on success.
    pub fn set_pwm_depth(&mut self, bits: u8) -> Result<()> {
        if bits == 0 || bits > 16 {
            return Err(DriverError::InvalidArgument(format!(
                "PWM depth must be 1..=16 bits, got {bits}"
            )));
        }
        self.acked(CMD_SET_PWM_DEPTH, &[bits])?;
        self.scale.depth = if bits == 16 { u16::MAX } else { (1u16 << bits) - 1 };
        Ok(())
    }

    /// Raw duty update that waits for the board to confirm it.
    pub fn set_duty_ack(&mut self, raw: u16) -> Result<()> {
        self.check_raw(raw)?;
        self.acked(CMD_SET_DUTY_ACK, &raw.to_be_bytes())
    }

    pub fn save_settings(&mut self) -> Result<()> {
        self.acked(CMD_SAVE_SETTINGS, &[])?;
        info!("settings saved to board");
        Ok(())
    }

    pub fn soft_reset_and_save(&mut self) -> Result<()> {
        self.acked(CMD_SOFT_RESET_SAVE, &[])
    }

    pub fn soft_release(&mut self, release: &SoftRelease) -> Result<()> {
        self.acked(CMD_SOFT_RELEASE, &release.encode())
    }

    /// Soft release starting from a percentage of full duty.
    pub fn send_soft_release(
        &mut self,
        start_percent: f64,
        n_steps: u16,
        freq_hz: u16,
        power_index: u8,
    ) -> Result<()> {
        let release = SoftRelease {
            start_raw: self.scale.to_raw(start_percent),
            n_steps,
            freq_hz,
            power_index,
        };
        self.soft_release(&release)
    }

    // ------------------------------------------------------------------------
    // Fire-and-forget commands
    // ------------------------------------------------------------------------

    pub fn set_duty(&mut self, raw: u16) -> Result<()> {
        self.check_raw(raw)?;
        self.send_command(CMD_SET_DUTY, &raw.to_be_bytes())
    }

    pub fn set_duty_fast(&mut self, raw: u16) -> Result<()> {
        self.check_raw(raw)?;
        self.send_command(CMD_SET_DUTY_FAST, &raw.to_be_bytes())
    }

    /// Set duty as a percentage of full power.
    pub fn send_duty(&mut self, percent: f64) -> Result<()> {
        self.set_duty(self.scale.to_raw(percent))
    }

    pub fn send_duty_fast(&mut self, percent: f64) -> Result<()> {
        self.set_duty_fast(self.scale.to_raw(percent))
    }

    pub fn send_duty_ack(&mut self, percent: f64) -> Result<()> {
        self.set_duty_ack(self.scale.to_raw(percent))
    }

    pub fn queue_trajectory_segment(&mut self, segment: &TrajectorySegment) -> Result<()> {
        self.send_command(CMD_TRAJECTORY_SEGMENT, &segment.encode())
    }

    /// Queue a segment given in percent and milliseconds.
    ///
    /// Durations above 65.535 ms are rejected; they do not fit the wire field.
    pub fn queue_trajectory(
        &mut self,
        start_percent: f64,
        end_percent: f64,
        duration_ms: f64,
        shape: SegmentShape,
    ) -> Result<()> {
        let segment =
            TrajectorySegment::from_percent(&self.scale, start_percent, end_percent, duration_ms, shape)?;
        self.queue_trajectory_segment(&segment)
    }

    pub fn start_automation(&mut self) -> Result<()> {
        self.send_command(CMD_START_AUTOMATION, &[])
    }

    pub fn stop_automation(&mut self) -> Result<()> {
        self.send_command(CMD_STOP_AUTOMATION, &[])
    }

    /// Reboot the board without saving. The board does not acknowledge this.
    pub fn soft_reset(&mut self) -> Result<()> {
        self.send_command(CMD_SOFT_RESET, &[])
    }

    // ------------------------------------------------------------------------
    // Streaming
    // ------------------------------------------------------------------------

    /// Ask the board to stream and start the background reader.
    ///
    /// Returns the session's sample buffer. The log header's sample rate is the current ADC
    /// rate from the last status query, or the configured fallback.
    pub fn start_streaming(&mut self) -> Result<Arc<SampleBuffer>> {
        self.exchange(CMD_START_STREAM, |_, _| Ok(()))?;

        let sample_rate = match self.last_status {
            Some(status) if status.current_adc_rate > 0 => status.current_adc_rate as f32,
            _ => self.stream.fallback_sample_rate,
        };
        let log = BinaryLogWriter::create_in_dir(&self.stream.log_dir, Local::now(), sample_rate)?;

        if let Err(e) = self.acked(CMD_START_STREAM, &[]) {
            let path = log.path().to_path_buf();
            drop(log);
            if let Err(rm) = std::fs::remove_file(&path) {
                debug!("could not remove unused log {}: {}", path.display(), rm);
            }
            return Err(e);
        }

        let transport = match mem::replace(&mut self.link, Link::Closed) {
            Link::Idle(transport) => transport,
            other => {
                self.link = other;
                return Err(DriverError::protocol(CMD_START_STREAM, "link not idle after START_STREAM"));
            }
        };
        let buffer = Arc::new(SampleBuffer::new(self.stream.buffer_capacity));
        let session = StreamSession::spawn(
            transport,
            log,
            Arc::clone(&buffer),
            self.stream.poll_timeout,
            Instant::now(),
        )?;
        info!("streaming started, logging to {}", session.log_path().display());
        self.link = Link::Streaming(session);
        Ok(buffer)
    }

    /// Stop the reader, close the log, then send `STOP_STREAM` and wait for its ACK.
    ///
    /// Returns `Ok(None)` if no session was running.
    pub fn stop_streaming(&mut self) -> Result<Option<StreamSummary>> {
        let mut session = match mem::replace(&mut self.link, Link::Closed) {
            Link::Streaming(session) => session,
            other => {
                self.link = other;
                return Ok(None);
            }
        };
        let duration = session.elapsed();
        let output = session.join()?;
        let stats = session.stats();
        drop(session);

        if let Some(e) = &output.failure {
            warn!("stream session had ended early: {}", e);
        }
        let log = output.log.close();
        let mut transport = output.transport;
        stop_stream(transport.as_mut(), self.timing)?;
        self.link = Link::Idle(transport);

        if stats.has_errors() {
            warn!(
                "stream stopped: {} packets, {} CRC errors, {} resyncs, {} noise bytes",
                stats.data_packets, stats.crc_errors, stats.short_reads, stats.noise_bytes
            );
        } else {
            info!("stream stopped: {} packets", stats.data_packets);
        }

        let log = log?;
        Ok(Some(StreamSummary {
            log,
            stats,
            duration,
        }))
    }

    // ------------------------------------------------------------------------
    // Internal Methods
    // ------------------------------------------------------------------------

    /// Run `op` for command `cmd_id` on the idle transport. A fatal error closes the link.
    fn exchange<T>(
        &mut self,
        cmd_id: u8,
        op: impl FnOnce(&mut dyn Transport, PacketTiming) -> Result<T>,
    ) -> Result<T> {
        self.on_link(Some(cmd_id), op)
    }

    /// Like `exchange`, for operations that may not belong to any command.
    fn on_link<T>(
        &mut self,
        cmd: Option<u8>,
        op: impl FnOnce(&mut dyn Transport, PacketTiming) -> Result<T>,
    ) -> Result<T> {
        let timing = self.timing;
        let result = match &mut self.link {
            Link::Idle(transport) => op(transport.as_mut(), timing),
            Link::Closed => Err(DriverError::NotConnected { cmd }),
            Link::Streaming(_) => Err(DriverError::StreamActive { cmd }),
        };
        if let Err(e) = &result {
            if e.is_fatal() && matches!(self.link, Link::Idle(_)) {
                warn!("closing connection: {}", e);
                self.link = Link::Closed;
            }
        }
        result
    }

    fn acked(&mut self, cmd_id: u8, payload: &[u8]) -> Result<()> {
        self.exchange(cmd_id, |t, timing| {
            write_packet(t, cmd_id, payload)?;
            read_ack_frame(t, timing, Some(cmd_id)).map(|_| ())
        })
    }

    /// Send a query and return the payload of the matching reply.
    fn request(&mut self, cmd_id: u8) -> Result<Vec<u8>> {
        self.exchange(cmd_id, |t, timing| {
            write_packet(t, cmd_id, &[])?;
            let packet = read_frame(t, timing.retries, timing.delay)?
                .ok_or_else(|| DriverError::protocol(cmd_id, "no response"))?;
            check_error_reply(cmd_id, &packet)?;
            if packet.cmd_id != cmd_id {
                return Err(DriverError::protocol(
                    cmd_id,
                    format!("unexpected reply id {:#04x}", packet.cmd_id),
                ));
            }
            Ok(packet.payload)
        })
    }

    fn check_raw(&self, raw: u16) -> Result<()> {
        if raw > self.scale.depth {
            return Err(DriverError::InvalidArgument(format!(
                "raw duty {raw} exceeds PWM depth {}",
                self.scale.depth
            )));
        }
        Ok(())
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if self.is_streaming() {
            if let Err(e) = self.stop_streaming() {
                warn!("error stopping stream during drop: {}", e);
            }
        }
    }
}

// ============================================================================
// Wire helpers
// ============================================================================

fn write_packet(t: &mut dyn Transport, cmd_id: u8, payload: &[u8]) -> Result<()> {
    let frame = encode_packet(cmd_id, payload)?;
    t.write_all(&frame)?;
    t.flush()?;
    debug!("sent cmd {:#04x} with {} payload bytes", cmd_id, payload.len());
    trace_tx(&frame);
    Ok(())
}

fn read_exact_framed(t: &mut dyn Transport, buf: &mut [u8], cmd_id: Option<u8>) -> Result<()> {
    match t.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if is_timeout(&e) || e.kind() == io::ErrorKind::UnexpectedEof => Err(
            DriverError::framing(cmd_id, format!("short read, {} bytes expected", buf.len())),
        ),
        Err(e) => Err(e.into()),
    }
}

fn read_frame(t: &mut dyn Transport, retries: u32, delay: Duration) -> Result<Option<Packet>> {
    let mut available = t.bytes_available()?;
    let mut attempt = 0;
    while available < 3 && attempt < retries {
        thread::sleep(delay);
        attempt += 1;
        available = t.bytes_available()?;
    }
    // Fewer bytes than the smallest frame: leave them for the next read.
    if available < 3 {
        return Ok(None);
    }

    let mut header = [0u8; 2];
    read_exact_framed(t, &mut header, None)?;
    let [length, cmd_id] = header;
    if length == 0 || length as usize > MAX_PACKET_LEN {
        trace_rx(&header);
        return Err(DriverError::framing(
            Some(cmd_id),
            format!("invalid length byte {length}"),
        ));
    }

    let mut frame = Vec::with_capacity(length as usize + 2);
    frame.extend_from_slice(&header);
    frame.resize(length as usize + 2, 0);
    read_exact_framed(t, &mut frame[2..], Some(cmd_id))?;
    trace_rx(&frame);

    let packet = decode_packet(&frame)?;
    debug!(
        "received cmd {:#04x} with {} payload bytes",
        packet.cmd_id,
        packet.payload.len()
    );
    Ok(Some(packet))
}

fn check_error_reply(cmd_id: u8, packet: &Packet) -> Result<()> {
    if packet.cmd_id == CMD_ERROR {
        let code = DeviceErrorCode::from_byte(packet.payload.first().copied().unwrap_or(0));
        return Err(DriverError::Device { cmd: cmd_id, code });
    }
    Ok(())
}

fn read_ack_frame(t: &mut dyn Transport, timing: PacketTiming, expected_cmd: Option<u8>) -> Result<u8> {
    let cmd = expected_cmd.unwrap_or(CMD_ACK);
    let packet = read_frame(t, timing.retries, timing.delay)?
        .ok_or_else(|| DriverError::protocol(cmd, "no ACK received"))?;
    check_error_reply(cmd, &packet)?;
    if packet.cmd_id != CMD_ACK {
        return Err(DriverError::protocol(
            cmd,
            format!("expected ACK, got {:#04x}", packet.cmd_id),
        ));
    }
    let echoed = *packet
        .payload
        .first()
        .ok_or_else(|| DriverError::protocol(cmd, "malformed ACK: empty payload"))?;
    if let Some(expected) = expected_cmd {
        if echoed != expected {
            return Err(DriverError::protocol(
                expected,
                format!("ACK echoes {echoed:#04x}"),
            ));
        }
    }
    Ok(echoed)
}

/// Send `STOP_STREAM` and look for its ACK frame among whatever telemetry is still in flight.
fn stop_stream(t: &mut dyn Transport, timing: PacketTiming) -> Result<()> {
    t.clear_input()?;
    write_packet(t, CMD_STOP_STREAM, &[])?;

    let ack = ack_frame(CMD_STOP_STREAM);
    let window = timing.delay * timing.retries.max(1);
    let deadline = Instant::now() + window;
    // Tail of the previous chunk, so an ACK split across two reads is still found.
    let mut scan: Vec<u8> = Vec::with_capacity(ack.len() - 1 + 256);
    let mut discarded = 0usize;
    let mut chunk = [0u8; 256];
    while Instant::now() < deadline {
        let available = t.bytes_available()?;
        if available == 0 {
            thread::sleep(Duration::from_millis(1));
            continue;
        }
        let want = available.min(chunk.len());
        let n = match t.read(&mut chunk[..want]) {
            Ok(n) => n,
            Err(e) if is_timeout(&e) => continue,
            Err(e) => return Err(e.into()),
        };
        scan.extend_from_slice(&chunk[..n]);
        if let Some(pos) = scan.windows(ack.len()).position(|w| w == ack) {
            trace_rx(&ack);
            debug!("STOP_STREAM acknowledged after {} bytes", discarded + pos);
            return Ok(());
        }
        let keep = scan.len().min(ack.len() - 1);
        discarded += scan.len() - keep;
        scan.drain(..scan.len() - keep);
    }
    Err(DriverError::protocol(
        CMD_STOP_STREAM,
        format!(
            "no ACK within {:?} ({} bytes discarded)",
            window,
            discarded + scan.len()
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    fn fast_config() -> LinkConfig {
        let mut config = LinkConfig::default();
        config.protocol.read_retries = 3;
        config.protocol.read_delay_ms = 1;
        config
    }

    fn idle() -> (Controller, crate::transport::MemoryHandle) {
        let (transport, handle) = MemoryTransport::new();
        (Controller::from_transport(transport, &fast_config()), handle)
    }

    #[test]
    fn send_command_frames_payload() {
        let (mut ctrl, handle) = idle();
        ctrl.set_duty(0x0123).unwrap();
        assert_eq!(handle.take_written(), vec![3, 0x20, 0x01, 0x23, 0x44]);
    }

    #[test]
    fn read_packet_returns_none_when_quiet() {
        let (mut ctrl, _handle) = idle();
        assert_eq!(ctrl.read_packet(2, Duration::from_millis(1)).unwrap(), None);
        assert!(ctrl.is_connected());
    }

    #[test]
    fn partial_frame_is_left_for_the_next_read() {
        let (mut ctrl, handle) = idle();
        handle.push_inbound(&[0x02, CMD_ACK]);
        assert_eq!(ctrl.read_packet(2, Duration::from_millis(1)).unwrap(), None);
        assert!(ctrl.is_connected());
        assert_eq!(handle.pending_inbound(), 2);

        handle.push_inbound(&[CMD_PING, CMD_ACK.wrapping_add(CMD_PING)]);
        assert_eq!(
            ctrl.read_packet(2, Duration::from_millis(1)).unwrap(),
            Some(Packet::new(CMD_ACK, vec![CMD_PING]))
        );
    }

    #[test]
    fn reads_on_a_closed_link_name_no_command() {
        let (mut ctrl, _handle) = idle();
        ctrl.close();
        let err = ctrl.read_packet(1, Duration::from_millis(1)).unwrap_err();
        assert!(matches!(err, DriverError::NotConnected { cmd: None }));
        assert_eq!(err.command_id(), None);
        assert!(matches!(
            ctrl.read_ack(None),
            Err(DriverError::NotConnected { cmd: None })
        ));
        assert!(matches!(
            ctrl.read_ack(Some(CMD_PING)),
            Err(DriverError::NotConnected { cmd: Some(CMD_PING) })
        ));
    }

    #[test]
    fn read_ack_returns_echo() {
        let (mut ctrl, handle) = idle();
        handle.push_inbound(&ack_frame(CMD_SAVE_SETTINGS));
        assert_eq!(ctrl.read_ack(None).unwrap(), CMD_SAVE_SETTINGS);
    }

    #[test]
    fn oversized_length_is_framing_error_and_closes() {
        let (mut ctrl, handle) = idle();
        handle.push_inbound(&[65, CMD_ACK, 0, 0]);
        let err = ctrl.read_packet(2, Duration::from_millis(1)).unwrap_err();
        assert!(matches!(err, DriverError::Framing { .. }));
        assert!(!ctrl.is_connected());
    }

    #[test]
    fn truncated_payload_is_framing_error() {
        let (mut ctrl, handle) = idle();
        handle.push_inbound(&[5, CMD_GET_STATUS, 1]);
        assert!(matches!(
            ctrl.read_packet(2, Duration::from_millis(1)),
            Err(DriverError::Framing { cmd: Some(CMD_GET_STATUS), .. })
        ));
    }

    #[test]
    fn error_reply_maps_to_device_error() {
        let (mut ctrl, handle) = idle();
        handle.push_inbound(&encode_packet(CMD_ERROR, &[0xE2]).unwrap());
        let err = ctrl.set_duty_ack(10).unwrap_err();
        assert!(matches!(
            err,
            DriverError::Device {
                cmd: CMD_SET_DUTY_ACK,
                code: DeviceErrorCode::InvalidDuty
            }
        ));
        assert!(!ctrl.is_connected());
    }

    #[test]
    fn raw_duty_above_depth_is_rejected_locally() {
        let (mut ctrl, handle) = idle();
        assert!(matches!(ctrl.set_duty(1024), Err(DriverError::InvalidArgument(_))));
        assert!(handle.written().is_empty());
        assert!(ctrl.is_connected());
    }

    #[test]
    fn depth_change_updates_scale() {
        let (transport, _handle) = MemoryTransport::new();
        let transport = transport.with_responder(|w| ack_frame(w[1]).to_vec());
        let mut ctrl = Controller::from_transport(transport, &fast_config());
        ctrl.set_pwm_depth(8).unwrap();
        assert_eq!(ctrl.duty_scale().depth, 255);
        assert!(ctrl.set_pwm_depth(17).is_err());
    }

    #[test]
    fn get_duty_decodes_big_endian() {
        let (transport, _handle) = MemoryTransport::new();
        let transport =
            transport.with_responder(|_| encode_packet(CMD_GET_DUTY, &[0x02, 0x00]).unwrap());
        let mut ctrl = Controller::from_transport(transport, &fast_config());
        assert_eq!(ctrl.get_duty().unwrap(), 512);
    }

    #[test]
    fn stop_without_session_is_a_no_op() {
        let (mut ctrl, handle) = idle();
        assert!(ctrl.stop_streaming().unwrap().is_none());
        assert!(handle.written().is_empty());
    }

    #[test]
    fn stop_scan_skips_leading_telemetry() {
        let (transport, _handle) = MemoryTransport::new();
        let mut transport = transport.with_responder(|_| {
            let mut reply = vec![0xA5, 0x00, 0x11, 0x22];
            reply.extend_from_slice(&ack_frame(CMD_STOP_STREAM));
            reply
        });
        let timing = PacketTiming {
            retries: 5,
            delay: Duration::from_millis(2),
        };
        stop_stream(&mut transport, timing).unwrap();
    }

    /// Board that keeps streaming telemetry and never answers STOP_STREAM.
    struct Chatty;

    impl Read for Chatty {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            buf.fill(0xA5);
            Ok(buf.len())
        }
    }

    impl Write for Chatty {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for Chatty {
        fn bytes_available(&mut self) -> io::Result<usize> {
            Ok(35)
        }

        fn clear_input(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn stop_scan_gives_up_under_continuous_traffic() {
        let timing = PacketTiming {
            retries: 10,
            delay: Duration::from_millis(10),
        };
        let started = Instant::now();
        let err = stop_stream(&mut Chatty, timing).unwrap_err();
        assert!(matches!(err, DriverError::Protocol { cmd: CMD_STOP_STREAM, .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn stop_scan_finds_ack_split_across_reads() {
        let (mut transport, handle) = MemoryTransport::new();
        let ack = ack_frame(CMD_STOP_STREAM);
        let feeder = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            handle.push_inbound(&[0xA5, 0x01, ack[0], ack[1]]);
            thread::sleep(Duration::from_millis(5));
            handle.push_inbound(&[ack[2], ack[3], 0xA5]);
        });
        let timing = PacketTiming {
            retries: 50,
            delay: Duration::from_millis(4),
        };
        stop_stream(&mut transport, timing).unwrap();
        feeder.join().unwrap();
    }

    #[test]
    fn stop_without_ack_is_protocol_error() {
        let (mut transport, _handle) = MemoryTransport::new();
        let timing = PacketTiming {
            retries: 2,
            delay: Duration::from_millis(1),
        };
        assert!(matches!(
            stop_stream(&mut transport, timing),
            Err(DriverError::Protocol { cmd: CMD_STOP_STREAM, .. })
        ));
    }
}
