//! Background stream session.
//!
//! While a session runs, its reader thread owns the transport. Stopping the session joins
//! the thread and hands the transport back, so the controller can send `STOP_STREAM` on the
//! same channel.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info};

use crate::binlog::{BinaryLogWriter, LogSummary};
use crate::buffer::SampleBuffer;
use crate::errors::{DriverError, Result};
use crate::stream::{StreamCounters, StreamPacket, StreamReader, StreamStats};
use crate::transport::Transport;

/// Capacity of the time-sync event channel.
pub const EVENT_QUEUE_LEN: usize = 256;

/// Something the caller may want to react to while streaming.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamEvent {
    TimeSync {
        kind: u8,
        /// Board clock, microseconds.
        micros: u32,
        /// Host clock, seconds since the stream started.
        host_time: f64,
    },
}

/// Everything the reader thread gives back when it exits.
pub(crate) struct ReaderOutput {
    pub transport: Box<dyn Transport>,
    pub log: BinaryLogWriter,
    /// Set when the thread ended on its own rather than on request.
    pub failure: Option<DriverError>,
}

/// A running stream: reader thread, its sample buffer and its counters.
pub struct StreamSession {
    stop_signal: Arc<AtomicBool>,
    reader_thread: Option<JoinHandle<ReaderOutput>>,
    buffer: Arc<SampleBuffer>,
    counters: Arc<StreamCounters>,
    events: Receiver<StreamEvent>,
    log_path: PathBuf,
    started: Instant,
}

impl StreamSession {
    /// Start the reader thread. `started` is time zero for sample timestamps.
    pub(crate) fn spawn(
        transport: Box<dyn Transport>,
        log: BinaryLogWriter,
        buffer: Arc<SampleBuffer>,
        poll_timeout: Duration,
        started: Instant,
    ) -> Result<Self> {
        let reader = StreamReader::new();
        let counters = reader.counters();
        let (event_tx, event_rx) = bounded(EVENT_QUEUE_LEN);
        let stop_signal = Arc::new(AtomicBool::new(false));
        let log_path = log.path().to_path_buf();

        let worker = ReaderLoop {
            transport,
            log,
            reader,
            buffer: Arc::clone(&buffer),
            events: event_tx,
            stop_signal: Arc::clone(&stop_signal),
            poll_timeout,
            started,
        };
        let reader_thread = thread::Builder::new()
            .name("solenoid-stream".to_string())
            .spawn(move || worker.run())?;

        Ok(Self {
            stop_signal,
            reader_thread: Some(reader_thread),
            buffer,
            counters,
            events: event_rx,
            log_path,
            started,
        })
    }

    /// Shared handle onto the sample history.
    pub fn buffer(&self) -> Arc<SampleBuffer> {
        Arc::clone(&self.buffer)
    }

    /// Time-sync events, in arrival order.
    pub fn events(&self) -> &Receiver<StreamEvent> {
        &self.events
    }

    pub fn stats(&self) -> StreamStats {
        self.counters.snapshot()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// False once the reader thread has exited, e.g. after a log write failure.
    pub fn is_running(&self) -> bool {
        self.reader_thread
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Signal the reader thread and wait for it.
    pub(crate) fn join(&mut self) -> Result<ReaderOutput> {
        self.stop_signal.store(true, Ordering::Relaxed);
        let handle = self
            .reader_thread
            .take()
            .ok_or_else(|| DriverError::Thread("reader thread already joined".to_string()))?;
        handle
            .join()
            .map_err(|_| DriverError::Thread("reader thread panicked".to_string()))
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if self.reader_thread.is_none() {
            return;
        }
        match self.join() {
            Ok(output) => {
                if let Err(e) = output.log.close() {
                    error!("error closing stream log during drop: {}", e);
                }
            }
            Err(e) => error!("error stopping stream reader during drop: {}", e),
        }
    }
}

/// Summary of a finished session.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSummary {
    pub log: LogSummary,
    pub stats: StreamStats,
    pub duration: Duration,
}

struct ReaderLoop {
    transport: Box<dyn Transport>,
    log: BinaryLogWriter,
    reader: StreamReader,
    buffer: Arc<SampleBuffer>,
    events: Sender<StreamEvent>,
    stop_signal: Arc<AtomicBool>,
    poll_timeout: Duration,
    started: Instant,
}

impl ReaderLoop {
    fn run(mut self) -> ReaderOutput {
        info!("stream reader started, logging to {}", self.log.path().display());
        let mut failure = None;

        while !self.stop_signal.load(Ordering::Relaxed) {
            let packet = match self.reader.read_packet(self.transport.as_mut(), self.poll_timeout) {
                Ok(Some(packet)) => packet,
                Ok(None) => continue,
                Err(e) => {
                    error!("stream read failed, ending session: {}", e);
                    failure = Some(e);
                    break;
                }
            };
            let host_time = self.started.elapsed().as_secs_f64();

            match packet {
                StreamPacket::Data(data) => {
                    if let Err(e) = self.log.append(&data.samples, host_time) {
                        error!("stream log write failed, ending session: {}", e);
                        failure = Some(e);
                        break;
                    }
                    self.buffer.append(&data.samples, host_time);
                }
                StreamPacket::TimeSync(sync) => {
                    let event = StreamEvent::TimeSync {
                        kind: sync.kind,
                        micros: sync.micros,
                        host_time,
                    };
                    if self.events.try_send(event).is_err() {
                        self.reader.counters().record_event_dropped();
                    }
                }
            }
        }

        debug!("stream reader exiting: {:?}", self.reader.stats());
        ReaderOutput {
            transport: self.transport,
            log: self.log,
            failure,
        }
    }
}
