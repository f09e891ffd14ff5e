//! Binary stream log.
//!
//! One file per stream session. All fields little-endian:
//!
//! ```text
//! header:  "STRM" | version u32 | sample_rate f32 | bit_depth u16      (14 bytes)
//! record:  duty u16 | current u16 | timestamp f64                      (12 bytes, repeated)
//! ```
//!
//! The header is written together with the first batch of samples, so a session that
//! never received data leaves a zero-byte file behind.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Local};
use log::{debug, warn};

use crate::errors::{DriverError, Result};
use crate::stream::RawSample;

pub const LOG_MAGIC: &[u8; 4] = b"STRM";
pub const LOG_VERSION: u32 = 2;
pub const LOG_BIT_DEPTH: u16 = 10;
pub const HEADER_LEN: usize = 14;
pub const RECORD_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogHeader {
    pub version: u32,
    /// Nominal sample rate in Hz, as reported by the board when the session started.
    pub sample_rate: f32,
    pub bit_depth: u16,
}

impl LogHeader {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            version: LOG_VERSION,
            sample_rate,
            bit_depth: LOG_BIT_DEPTH,
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(LOG_MAGIC)?;
        w.write_u32::<LittleEndian>(self.version)?;
        w.write_f32::<LittleEndian>(self.sample_rate)?;
        w.write_u16::<LittleEndian>(self.bit_depth)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut raw = [0u8; HEADER_LEN];
        let n = read_full(r, &mut raw)?;
        if n < HEADER_LEN {
            return Err(DriverError::InvalidLog(format!(
                "header truncated: {n} of {HEADER_LEN} bytes"
            )));
        }
        if &raw[..4] != LOG_MAGIC {
            return Err(DriverError::InvalidLog(format!(
                "bad magic {:02X?}",
                &raw[..4]
            )));
        }
        let mut cursor = &raw[4..];
        Ok(Self {
            version: cursor.read_u32::<LittleEndian>()?,
            sample_rate: cursor.read_f32::<LittleEndian>()?,
            bit_depth: cursor.read_u16::<LittleEndian>()?,
        })
    }
}

/// One sample as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogRecord {
    pub duty: u16,
    pub current: u16,
    /// Seconds since the stream started.
    pub timestamp: f64,
}

impl LogRecord {
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[0..2].copy_from_slice(&self.duty.to_le_bytes());
        out[2..4].copy_from_slice(&self.current.to_le_bytes());
        out[4..12].copy_from_slice(&self.timestamp.to_le_bytes());
        out
    }

    /// Decode a record found at byte `offset` of the file.
    ///
    /// A timestamp that is not a finite, non-negative number cannot come from the writer
    /// and marks the record as corrupt.
    pub fn decode(raw: &[u8; RECORD_LEN], offset: u64) -> Result<Self> {
        let mut cursor = &raw[..];
        let duty = cursor.read_u16::<LittleEndian>()?;
        let current = cursor.read_u16::<LittleEndian>()?;
        let timestamp = cursor.read_f64::<LittleEndian>()?;
        if !timestamp.is_finite() || timestamp < 0.0 {
            return Err(DriverError::RecordCorruption {
                offset,
                reason: format!("invalid timestamp {timestamp}"),
            });
        }
        Ok(Self {
            duty,
            current,
            timestamp,
        })
    }
}

/// What a closed log contains.
#[derive(Debug, Clone, PartialEq)]
pub struct LogSummary {
    pub path: PathBuf,
    pub records: u64,
    pub header_written: bool,
}

/// Append-only writer for one session log.
pub struct BinaryLogWriter {
    path: PathBuf,
    file: BufWriter<File>,
    header: LogHeader,
    header_written: bool,
    records: u64,
}

impl BinaryLogWriter {
    /// Create (or truncate) the log at `path`. Nothing is written yet.
    pub fn create(path: impl AsRef<Path>, sample_rate: f32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self::from_file(path, file, sample_rate))
    }

    /// Create `stream_YYYYMMDD_HHMMSS.bin` in `dir`, named after `started`.
    ///
    /// An existing file with that name is never overwritten; a numeric suffix is added.
    pub fn create_in_dir(dir: impl AsRef<Path>, started: DateTime<Local>, sample_rate: f32) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let stem = started.format("stream_%Y%m%d_%H%M%S").to_string();
        for attempt in 0..100u32 {
            let name = if attempt == 0 {
                format!("{stem}.bin")
            } else {
                format!("{stem}_{attempt}.bin")
            };
            let path = dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    debug!("stream log created at {}", path.display());
                    return Ok(Self::from_file(path, file, sample_rate));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(DriverError::InvalidArgument(format!(
            "no free log file name for {stem} in {}",
            dir.display()
        )))
    }

    fn from_file(path: PathBuf, file: File, sample_rate: f32) -> Self {
        Self {
            path,
            file: BufWriter::new(file),
            header: LogHeader::new(sample_rate),
            header_written: false,
            records: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    /// Append a batch of samples sharing one timestamp; writes the header first if needed.
    pub fn append(&mut self, samples: &[RawSample], timestamp: f64) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        if !self.header_written {
            self.header.write_to(&mut self.file)?;
            self.header_written = true;
        }
        for sample in samples {
            let record = LogRecord {
                duty: sample.duty,
                current: sample.current,
                timestamp,
            };
            self.file.write_all(&record.encode())?;
        }
        self.records += samples.len() as u64;
        Ok(())
    }

    /// Flush everything to disk and close the file.
    pub fn close(self) -> Result<LogSummary> {
        let file = self.file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(LogSummary {
            path: self.path,
            records: self.records,
            header_written: self.header_written,
        })
    }
}

/// Sequential reader over a session log.
///
/// Yields `Err(DriverError::RecordCorruption)` for records that fail validation and keeps
/// going; a trailing partial record ends iteration and is reported by
/// [`trailing_bytes`](Self::trailing_bytes).
pub struct BinaryLogReader<R> {
    reader: R,
    header: LogHeader,
    offset: u64,
    trailing_bytes: usize,
    done: bool,
}

impl BinaryLogReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read> BinaryLogReader<R> {
    /// Read and validate the header.
    pub fn new(mut reader: R) -> Result<Self> {
        let header = LogHeader::read_from(&mut reader)?;
        Ok(Self {
            reader,
            header,
            offset: HEADER_LEN as u64,
            trailing_bytes: 0,
            done: false,
        })
    }

    pub fn header(&self) -> &LogHeader {
        &self.header
    }

    /// Bytes of an incomplete record found at end of file.
    pub fn trailing_bytes(&self) -> usize {
        self.trailing_bytes
    }
}

impl<R: Read> Iterator for BinaryLogReader<R> {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut raw = [0u8; RECORD_LEN];
        let n = match read_full(&mut self.reader, &mut raw) {
            Ok(n) => n,
            Err(e) => {
                self.done = true;
                return Some(Err(e.into()));
            }
        };
        if n == 0 {
            self.done = true;
            return None;
        }
        if n < RECORD_LEN {
            self.done = true;
            self.trailing_bytes = n;
            warn!(
                "incomplete record of {} bytes at offset {}, dropped",
                n, self.offset
            );
            return None;
        }
        let offset = self.offset;
        self.offset += RECORD_LEN as u64;
        Some(LogRecord::decode(&raw, offset))
    }
}

/// Read until `buf` is full or EOF; returns the number of bytes read.
fn read_full<R: Read + ?Sized>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
