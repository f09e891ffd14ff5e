//! Fixed-capacity sample history shared between the stream reader and the caller.

use std::sync::{Mutex, MutexGuard};

use crate::stream::RawSample;

/// Default number of samples kept in memory.
pub const DEFAULT_CAPACITY: usize = 100_000;

/// Column-oriented copy of a slice of the sample history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleSeries {
    /// Seconds since the stream started.
    pub timestamps: Vec<f64>,
    pub duty: Vec<u16>,
    pub current: Vec<u16>,
}

impl SampleSeries {
    fn with_capacity(n: usize) -> Self {
        Self {
            timestamps: Vec::with_capacity(n),
            duty: Vec::with_capacity(n),
            current: Vec::with_capacity(n),
        }
    }

    fn push(&mut self, timestamp: f64, duty: u16, current: u16) {
        self.timestamps.push(timestamp);
        self.duty.push(duty);
        self.current.push(current);
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

struct Ring {
    timestamps: Vec<f64>,
    duty: Vec<u16>,
    current: Vec<u16>,
    write_index: usize,
    sample_count: u64,
}

impl Ring {
    fn capacity(&self) -> usize {
        self.timestamps.len()
    }

    fn len(&self) -> usize {
        self.sample_count.min(self.capacity() as u64) as usize
    }

    /// Slot index of the `i`-th oldest retained sample.
    fn slot(&self, i: usize) -> usize {
        let cap = self.capacity();
        if (self.sample_count as usize) < cap {
            i
        } else {
            (self.write_index + i) % cap
        }
    }
}

/// Circular buffer of `(timestamp, duty, current)` triples.
///
/// Holds the most recent `capacity` samples. All access goes through one mutex, so a
/// `SampleBuffer` can be shared behind an `Arc` between the stream reader thread and
/// whoever is plotting or exporting.
pub struct SampleBuffer {
    inner: Mutex<Ring>,
}

impl Default for SampleBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl SampleBuffer {
    /// Create a buffer; a capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Ring {
                timestamps: vec![0.0; capacity],
                duty: vec![0; capacity],
                current: vec![0; capacity],
                write_index: 0,
                sample_count: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    /// Samples currently retained.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().sample_count == 0
    }

    /// Samples appended since creation or the last [`clear`](Self::clear), including
    /// those already overwritten.
    pub fn total_samples(&self) -> u64 {
        self.lock().sample_count
    }

    /// Append a batch of samples that share one host timestamp.
    pub fn append(&self, samples: &[RawSample], timestamp: f64) {
        let mut ring = self.lock();
        let cap = ring.capacity();
        for sample in samples {
            let idx = ring.write_index;
            ring.timestamps[idx] = timestamp;
            ring.duty[idx] = sample.duty;
            ring.current[idx] = sample.current;
            ring.write_index = (idx + 1) % cap;
            ring.sample_count += 1;
        }
    }

    /// Timestamp of the newest sample.
    pub fn get_last_timestamp(&self) -> Option<f64> {
        let ring = self.lock();
        if ring.sample_count == 0 {
            return None;
        }
        let cap = ring.capacity();
        Some(ring.timestamps[(ring.write_index + cap - 1) % cap])
    }

    /// All retained samples with `t0 <= timestamp <= t1`, oldest first.
    pub fn get_samples_by_time(&self, t0: f64, t1: f64) -> SampleSeries {
        let ring = self.lock();
        let mut out = SampleSeries::default();
        for i in 0..ring.len() {
            let idx = ring.slot(i);
            let t = ring.timestamps[idx];
            if t0 <= t && t <= t1 {
                out.push(t, ring.duty[idx], ring.current[idx]);
            }
        }
        out
    }

    /// The newest `max_points` samples (or fewer), oldest first.
    pub fn get_recent(&self, max_points: usize) -> SampleSeries {
        let ring = self.lock();
        let len = ring.len();
        let n = max_points.min(len);
        let mut out = SampleSeries::with_capacity(n);
        for i in (len - n)..len {
            let idx = ring.slot(i);
            out.push(ring.timestamps[idx], ring.duty[idx], ring.current[idx]);
        }
        out
    }

    /// Forget every sample, keeping the allocation.
    pub fn clear(&self) {
        let mut ring = self.lock();
        ring.write_index = 0;
        ring.sample_count = 0;
    }
}
