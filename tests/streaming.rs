mod common;

use std::fs;

use common::{scratch_dir, simulated_board, test_config, wait_for};
use solenoid_link::protocol::{decode_packet, CMD_GET_STATUS, CMD_PING, CMD_START_STREAM, CMD_STOP_STREAM};
use solenoid_link::stream::{DataPacket, TimeSync, SAMPLES_PER_PACKET};
use solenoid_link::{
    export_csv, BinaryLogReader, Controller, DriverError, ExportOutcome, MemoryTransport, RawSample,
    StreamEvent,
};

fn data_packet(base: u16) -> [u8; 35] {
    let mut samples = [RawSample::default(); SAMPLES_PER_PACKET];
    for (i, s) in samples.iter_mut().enumerate() {
        let v = base + i as u16;
        *s = RawSample::new(v, 1000 + v);
    }
    DataPacket { flags: 0, samples }.encode()
}

#[test]
fn corrupt_packet_is_dropped_and_the_session_continues() {
    let dir = scratch_dir("stream_scenario");
    let (transport, handle) = simulated_board();
    let mut ctrl = Controller::from_transport(transport, &test_config(dir.clone()));

    let buffer = ctrl.start_streaming().unwrap();
    assert!(ctrl.is_streaming());
    handle.take_written();

    for base in [0, 8, 16] {
        handle.push_inbound(&data_packet(base));
    }
    let mut corrupt = data_packet(100);
    corrupt[34] ^= 0xFF;
    handle.push_inbound(&corrupt);
    handle.push_inbound(&data_packet(24));

    wait_for(|| buffer.len() == 32);
    let stats = ctrl.session().unwrap().stats();
    assert_eq!(stats.data_packets, 4);
    assert_eq!(stats.crc_errors, 1);

    let summary = ctrl.stop_streaming().unwrap().unwrap();
    assert!(!ctrl.is_streaming());
    assert!(ctrl.is_connected());
    assert_eq!(summary.log.records, 32);
    assert_eq!(summary.stats.crc_errors, 1);

    let stop = decode_packet(&handle.take_written()).unwrap();
    assert_eq!(stop.cmd_id, CMD_STOP_STREAM);

    let series = buffer.get_samples_by_time(f64::NEG_INFINITY, f64::INFINITY);
    let expected: Vec<u16> = (0..32).collect();
    assert_eq!(series.duty, expected);
    assert!(series.timestamps.windows(2).all(|w| w[0] <= w[1]));

    let reader = BinaryLogReader::open(&summary.log.path).unwrap();
    assert_eq!(reader.header().sample_rate, 10_000.0);
    let duties: Vec<u16> = reader.map(|r| r.unwrap().duty).collect();
    assert_eq!(duties, expected);

    // The controller is usable for commands again.
    ctrl.ping().unwrap();
}

#[test]
fn commands_are_refused_while_streaming() {
    let (transport, _handle) = simulated_board();
    let mut ctrl = Controller::from_transport(transport, &test_config(scratch_dir("stream_busy")));
    ctrl.start_streaming().unwrap();

    assert!(matches!(
        ctrl.ping(),
        Err(DriverError::StreamActive { cmd: Some(CMD_PING) })
    ));
    assert!(matches!(
        ctrl.start_streaming(),
        Err(DriverError::StreamActive { cmd: Some(CMD_START_STREAM) })
    ));
    assert!(ctrl.is_streaming());
    ctrl.stop_streaming().unwrap();
}

#[test]
fn time_sync_events_reach_the_caller() {
    let (transport, handle) = simulated_board();
    let mut ctrl = Controller::from_transport(transport, &test_config(scratch_dir("stream_sync")));
    ctrl.start_streaming().unwrap();

    handle.push_inbound(&[0x00, 0x13]);
    handle.push_inbound(&TimeSync { kind: 2, micros: 123_456 }.encode());
    wait_for(|| ctrl.session().unwrap().stats().time_sync_packets == 1);

    let session = ctrl.session().unwrap();
    let event = session.events().try_recv().unwrap();
    assert!(matches!(event, StreamEvent::TimeSync { kind: 2, micros: 123_456, .. }));
    assert_eq!(session.stats().noise_bytes, 2);
    ctrl.stop_streaming().unwrap();
}

#[test]
fn corrupt_time_sync_emits_no_event() {
    let (transport, handle) = simulated_board();
    let mut ctrl = Controller::from_transport(transport, &test_config(scratch_dir("stream_sync_crc")));
    let buffer = ctrl.start_streaming().unwrap();

    let mut sync = TimeSync { kind: 1, micros: 42 }.encode();
    sync[6] ^= 0xFF;
    handle.push_inbound(&sync);
    handle.push_inbound(&data_packet(0));
    wait_for(|| buffer.len() == 8);

    let session = ctrl.session().unwrap();
    assert!(session.events().try_recv().is_err());
    let stats = session.stats();
    assert_eq!(stats.crc_errors, 1);
    assert_eq!(stats.time_sync_packets, 0);
    ctrl.stop_streaming().unwrap();
}

#[test]
fn status_rate_goes_into_the_log_header() {
    let dir = scratch_dir("stream_rate");
    let (transport, handle) = simulated_board();
    let mut ctrl = Controller::from_transport(transport, &test_config(dir));
    assert_eq!(ctrl.get_status().unwrap().current_adc_rate, 2000);

    let buffer = ctrl.start_streaming().unwrap();
    handle.push_inbound(&data_packet(0));
    wait_for(|| buffer.len() == 8);
    let summary = ctrl.stop_streaming().unwrap().unwrap();

    let reader = BinaryLogReader::open(&summary.log.path).unwrap();
    assert_eq!(reader.header().sample_rate, 2000.0);
    assert_eq!(reader.header().version, 2);
    assert_eq!(reader.header().bit_depth, 10);
}

#[test]
fn empty_session_exports_as_empty() {
    let dir = scratch_dir("stream_empty");
    let (transport, _handle) = simulated_board();
    let mut ctrl = Controller::from_transport(transport, &test_config(dir.clone()));
    ctrl.start_streaming().unwrap();
    let summary = ctrl.stop_streaming().unwrap().unwrap();

    assert_eq!(summary.log.records, 0);
    assert_eq!(fs::metadata(&summary.log.path).unwrap().len(), 0);
    assert_eq!(
        export_csv(&summary.log.path, dir.join("empty.csv")).unwrap(),
        ExportOutcome::EmptySession
    );
}

#[test]
fn streamed_log_exports_to_csv() {
    let dir = scratch_dir("stream_export");
    let (transport, handle) = simulated_board();
    let mut ctrl = Controller::from_transport(transport, &test_config(dir.clone()));
    let buffer = ctrl.start_streaming().unwrap();
    handle.push_inbound(&data_packet(0));
    handle.push_inbound(&data_packet(8));
    wait_for(|| buffer.len() == 16);
    let summary = ctrl.stop_streaming().unwrap().unwrap();

    let csv = dir.join("out.csv");
    assert_eq!(
        export_csv(&summary.log.path, &csv).unwrap(),
        ExportOutcome::Exported {
            rows: 16,
            skipped: 0,
            trailing_bytes: 0
        }
    );
    let text = fs::read_to_string(&csv).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 17);
    assert_eq!(lines[0], "timestamp,duty,current");
    let last: Vec<&str> = lines[16].split(',').collect();
    assert_eq!(last[1], "15");
    assert_eq!(last[2], "1015");
    assert!(last[0].parse::<f64>().unwrap() >= 0.0);
}

#[test]
fn missing_stop_ack_closes_the_link() {
    let (transport, _handle) = MemoryTransport::new();
    let transport = transport.with_responder(|frame| match decode_packet(frame) {
        Ok(p) if p.cmd_id == CMD_START_STREAM => solenoid_link::protocol::ack_frame(CMD_START_STREAM).to_vec(),
        _ => Vec::new(),
    });
    let mut ctrl = Controller::from_transport(transport, &test_config(scratch_dir("stream_noack")));
    ctrl.start_streaming().unwrap();
    assert!(matches!(
        ctrl.stop_streaming(),
        Err(DriverError::Protocol { cmd: CMD_STOP_STREAM, .. })
    ));
    assert!(!ctrl.is_connected());
    assert!(matches!(
        ctrl.get_status(),
        Err(DriverError::NotConnected { cmd: Some(CMD_GET_STATUS) })
    ));
}
