#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use solenoid_link::protocol::{ack_frame, decode_packet, encode_packet, expects_ack, CMD_GET_DUTY, CMD_GET_STATUS};
use solenoid_link::{LinkConfig, MemoryHandle, MemoryTransport, StatusRecord};

static NEXT: AtomicUsize = AtomicUsize::new(0);

pub fn scratch_dir(tag: &str) -> PathBuf {
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("solenoid_link_it_{tag}_{}_{n}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn test_config(log_dir: PathBuf) -> LinkConfig {
    let mut config = LinkConfig::default();
    config.protocol.read_retries = 20;
    config.protocol.read_delay_ms = 2;
    config.stream.poll_timeout_ms = 20;
    config.stream.log_dir = log_dir;
    config
}

pub fn board_status() -> StatusRecord {
    StatusRecord {
        firmware_major: 1,
        firmware_minor: 2,
        pwm_output_pin: 5,
        pwm_sensing_pin: 6,
        current_sensing_pin: 7,
        pwm_frequency: 20_000,
        pwm_adc_rate: 1000,
        current_adc_rate: 2000,
        pwm_adc_resolution: 10,
        current_adc_resolution: 12,
        pwm_depth: 10,
    }
}

/// A transport that answers like a healthy board.
pub fn simulated_board() -> (MemoryTransport, MemoryHandle) {
    let (transport, handle) = MemoryTransport::new();
    let transport = transport.with_responder(|frame| {
        let packet = match decode_packet(frame) {
            Ok(packet) => packet,
            Err(_) => return Vec::new(),
        };
        match packet.cmd_id {
            CMD_GET_STATUS => encode_packet(CMD_GET_STATUS, &board_status().encode()).unwrap(),
            CMD_GET_DUTY => encode_packet(CMD_GET_DUTY, &[0x01, 0xFF]).unwrap(),
            cmd if expects_ack(cmd) => ack_frame(cmd).to_vec(),
            _ => Vec::new(),
        }
    });
    (transport, handle)
}

pub fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(2));
    }
}
