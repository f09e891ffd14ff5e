//! Byte-stream channel abstraction.
//!
//! The driver only needs a duplex byte stream with a read timeout and a way to ask how many
//! bytes are waiting. Serial ports provide this natively; [`MemoryTransport`] provides it in
//! memory for tests, demos and replay.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::debug;
use serialport::{ClearBuffer, SerialPort};

use crate::errors::Result;

/// A duplex byte channel to the controller board.
///
/// `read` must honour a bounded timeout: when nothing arrives it returns an error of kind
/// `TimedOut` or `WouldBlock` (or `Ok(0)`) instead of blocking forever.
pub trait Transport: Read + Write + Send {
    /// Number of inbound bytes that can be read without waiting.
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// Discard everything currently buffered on the inbound side.
    fn clear_input(&mut self) -> io::Result<()>;
}

impl Transport for Box<dyn SerialPort> {
    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.bytes_to_read()? as usize)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

/// Open a serial port with the given baud rate and per-read timeout.
pub fn open_serial(path: &str, baud_rate: u32, timeout: Duration) -> Result<Box<dyn SerialPort>> {
    debug!("opening serial port {} at {} baud", path, baud_rate);
    let port = serialport::new(path, baud_rate).timeout(timeout).open()?;
    Ok(port)
}

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

#[derive(Default)]
struct Shared {
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
}

/// In-memory transport.
///
/// Inbound bytes are queued through a [`MemoryHandle`]; an optional responder closure sees
/// every write and returns bytes to queue as the reply, which is enough to simulate the
/// board's command handler.
pub struct MemoryTransport {
    shared: Arc<Mutex<Shared>>,
    responder: Option<Responder>,
    read_timeout: Duration,
}

/// Test-side handle onto a [`MemoryTransport`].
#[derive(Clone)]
pub struct MemoryHandle {
    shared: Arc<Mutex<Shared>>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryTransport {
    pub fn new() -> (Self, MemoryHandle) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let transport = Self {
            shared: Arc::clone(&shared),
            responder: None,
            read_timeout: Duration::from_millis(2),
        };
        (transport, MemoryHandle { shared })
    }

    /// Reply to each write with the bytes returned by `responder`.
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    /// How long an empty read waits before reporting a timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

impl MemoryHandle {
    /// Queue bytes as if the board had sent them.
    pub fn push_inbound(&self, bytes: &[u8]) {
        lock(&self.shared).inbound.extend(bytes.iter().copied());
    }

    /// Bytes still waiting to be read by the driver.
    pub fn pending_inbound(&self) -> usize {
        lock(&self.shared).inbound.len()
    }

    /// Everything the driver has written so far.
    pub fn written(&self) -> Vec<u8> {
        lock(&self.shared).outbound.clone()
    }

    /// Drain and return everything the driver has written so far.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut lock(&self.shared).outbound)
    }
}

impl Read for MemoryTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if lock(&self.shared).inbound.is_empty() {
            std::thread::sleep(self.read_timeout);
        }
        let mut shared = lock(&self.shared);
        if shared.inbound.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
        }
        let n = buf.len().min(shared.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(shared.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MemoryTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let reply = self.responder.as_mut().map(|respond| respond(buf));
        let mut shared = lock(&self.shared);
        shared.outbound.extend_from_slice(buf);
        if let Some(reply) = reply {
            shared.inbound.extend(reply);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(lock(&self.shared).inbound.len())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        lock(&self.shared).inbound.clear();
        Ok(())
    }
}
