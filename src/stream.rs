//! Streaming protocol reader.
//!
//! While streaming, the board interleaves two packet kinds on the serial line:
//!
//! ```text
//! data:      0xA5 | flags | 8 × (duty u16 LE, current u16 LE) | crc8
//! time sync: 0xAA | type  | micros u32 BE                     | crc8
//! ```
//!
//! The CRC covers everything between the magic byte and the CRC byte. Bytes that are not a
//! known magic are line noise and are skipped; packets with a bad CRC or a short body are
//! dropped and the reader resynchronises on the next magic byte. None of these conditions
//! is surfaced as an error; they are only counted and logged.

use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::checksum::crc8;
use crate::errors::{DriverError, Result};
use crate::transport::Transport;

pub const STREAM_DATA_MAGIC: u8 = 0xA5;
pub const STREAM_TIME_MAGIC: u8 = 0xAA;
/// Samples carried by one data packet.
pub const SAMPLES_PER_PACKET: usize = 8;
/// Bytes following the data magic: flags, samples and CRC.
pub const DATA_BODY_LEN: usize = 1 + 4 * SAMPLES_PER_PACKET + 1;
/// Bytes following the time-sync magic: type, micros and CRC.
pub const TIME_BODY_LEN: usize = 1 + 4 + 1;

/// Sleep between availability polls while the line is idle.
const IDLE_POLL: Duration = Duration::from_millis(1);

/// One duty/current pair as sampled by the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawSample {
    pub duty: u16,
    pub current: u16,
}

impl RawSample {
    pub fn new(duty: u16, current: u16) -> Self {
        Self { duty, current }
    }
}

/// Eight samples captured back to back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub flags: u8,
    pub samples: [RawSample; SAMPLES_PER_PACKET],
}

impl DataPacket {
    /// Decode the bytes that follow the `0xA5` magic.
    pub fn decode(body: &[u8; DATA_BODY_LEN]) -> Result<Self> {
        let (content, crc) = body.split_at(DATA_BODY_LEN - 1);
        check_crc(STREAM_DATA_MAGIC, content, crc[0])?;

        let flags = content[0];
        let mut samples = [RawSample::default(); SAMPLES_PER_PACKET];
        for (slot, chunk) in samples.iter_mut().zip(content[1..].chunks_exact(4)) {
            *slot = RawSample {
                duty: u16::from_le_bytes([chunk[0], chunk[1]]),
                current: u16::from_le_bytes([chunk[2], chunk[3]]),
            };
        }
        Ok(Self { flags, samples })
    }

    /// Full wire form including the magic byte.
    pub fn encode(&self) -> [u8; DATA_BODY_LEN + 1] {
        let mut out = [0u8; DATA_BODY_LEN + 1];
        out[0] = STREAM_DATA_MAGIC;
        out[1] = self.flags;
        for (i, sample) in self.samples.iter().enumerate() {
            let base = 2 + 4 * i;
            out[base..base + 2].copy_from_slice(&sample.duty.to_le_bytes());
            out[base + 2..base + 4].copy_from_slice(&sample.current.to_le_bytes());
        }
        out[DATA_BODY_LEN] = crc8(&out[1..DATA_BODY_LEN]);
        out
    }
}

/// Board clock reading used to align host and device time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSync {
    pub kind: u8,
    /// Board `micros()` counter; wraps every ~71 minutes.
    pub micros: u32,
}

impl TimeSync {
    /// Decode the bytes that follow the `0xAA` magic.
    pub fn decode(body: &[u8; TIME_BODY_LEN]) -> Result<Self> {
        let (content, crc) = body.split_at(TIME_BODY_LEN - 1);
        check_crc(STREAM_TIME_MAGIC, content, crc[0])?;
        Ok(Self {
            kind: content[0],
            micros: u32::from_be_bytes([content[1], content[2], content[3], content[4]]),
        })
    }

    /// Full wire form including the magic byte.
    pub fn encode(&self) -> [u8; TIME_BODY_LEN + 1] {
        let mut out = [0u8; TIME_BODY_LEN + 1];
        out[0] = STREAM_TIME_MAGIC;
        out[1] = self.kind;
        out[2..6].copy_from_slice(&self.micros.to_be_bytes());
        out[6] = crc8(&out[1..6]);
        out
    }
}

fn check_crc(magic: u8, content: &[u8], received: u8) -> Result<()> {
    let expected = crc8(content);
    if expected != received {
        return Err(DriverError::Integrity {
            cmd: magic,
            expected,
            actual: received,
        });
    }
    Ok(())
}

/// A validated inbound stream packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamPacket {
    Data(DataPacket),
    TimeSync(TimeSync),
}

/// Running counters for one stream session.
#[derive(Debug, Default)]
pub struct StreamCounters {
    data_packets: AtomicU64,
    time_sync_packets: AtomicU64,
    crc_errors: AtomicU64,
    short_reads: AtomicU64,
    noise_bytes: AtomicU64,
    events_dropped: AtomicU64,
}

impl StreamCounters {
    pub fn snapshot(&self) -> StreamStats {
        StreamStats {
            data_packets: self.data_packets.load(Ordering::Relaxed),
            time_sync_packets: self.time_sync_packets.load(Ordering::Relaxed),
            crc_errors: self.crc_errors.load(Ordering::Relaxed),
            short_reads: self.short_reads.load(Ordering::Relaxed),
            noise_bytes: self.noise_bytes.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`StreamCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamStats {
    pub data_packets: u64,
    pub time_sync_packets: u64,
    /// Packets dropped because their CRC did not match.
    pub crc_errors: u64,
    /// Packets dropped because their body did not arrive in time.
    pub short_reads: u64,
    /// Bytes skipped while hunting for a magic byte.
    pub noise_bytes: u64,
    /// Time-sync events the consumer was too slow to take.
    pub events_dropped: u64,
}

impl StreamStats {
    pub fn has_errors(&self) -> bool {
        self.crc_errors > 0 || self.short_reads > 0
    }
}

/// Pulls and validates stream packets from a transport.
#[derive(Debug, Default)]
pub struct StreamReader {
    counters: Arc<StreamCounters>,
}

impl StreamReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle onto this reader's counters.
    pub fn counters(&self) -> Arc<StreamCounters> {
        Arc::clone(&self.counters)
    }

    pub fn stats(&self) -> StreamStats {
        self.counters.snapshot()
    }

    /// Read the next valid packet, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when nothing valid arrived in time. Only transport failures other
    /// than a read timeout are returned as errors.
    pub fn read_packet<T>(&mut self, transport: &mut T, timeout: Duration) -> Result<Option<StreamPacket>>
    where
        T: Transport + ?Sized,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if Instant::now() >= deadline {
                return Ok(None);
            }
            if transport.bytes_available()? == 0 {
                std::thread::sleep(IDLE_POLL);
                continue;
            }

            let mut magic = [0u8; 1];
            match transport.read(&mut magic) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(e) if is_timeout(&e) => continue,
                Err(e) => return Err(e.into()),
            }

            match magic[0] {
                STREAM_DATA_MAGIC => {
                    let mut body = [0u8; DATA_BODY_LEN];
                    if !self.read_body(transport, &mut body)? {
                        continue;
                    }
                    match DataPacket::decode(&body) {
                        Ok(packet) => {
                            self.counters.data_packets.fetch_add(1, Ordering::Relaxed);
                            return Ok(Some(StreamPacket::Data(packet)));
                        }
                        Err(e) => self.record_crc_error("data", &e),
                    }
                }
                STREAM_TIME_MAGIC => {
                    let mut body = [0u8; TIME_BODY_LEN];
                    if !self.read_body(transport, &mut body)? {
                        continue;
                    }
                    match TimeSync::decode(&body) {
                        Ok(sync) => {
                            self.counters.time_sync_packets.fetch_add(1, Ordering::Relaxed);
                            return Ok(Some(StreamPacket::TimeSync(sync)));
                        }
                        Err(e) => self.record_crc_error("time sync", &e),
                    }
                }
                _ => {
                    self.counters.noise_bytes.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Fill `body`, returning `false` if the line went quiet first.
    fn read_body<T>(&mut self, transport: &mut T, body: &mut [u8]) -> Result<bool>
    where
        T: Transport + ?Sized,
    {
        match transport.read_exact(body) {
            Ok(()) => Ok(true),
            Err(e) if is_timeout(&e) || e.kind() == io::ErrorKind::UnexpectedEof => {
                self.counters.short_reads.fetch_add(1, Ordering::Relaxed);
                debug!("short stream packet body ({} bytes expected), resyncing", body.len());
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn record_crc_error(&mut self, kind: &str, err: &DriverError) {
        self.counters.crc_errors.fetch_add(1, Ordering::Relaxed);
        warn!("CRC mismatch in {} packet, dropped: {}", kind, err);
    }
}

pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}
