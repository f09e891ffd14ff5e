//! Binary log to CSV conversion.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use log::{info, warn};

use crate::binlog::BinaryLogReader;
use crate::errors::{DriverError, Result};

pub const CSV_HEADER: &str = "timestamp,duty,current";

/// Result of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportOutcome {
    /// The log is zero bytes: the session never received a sample. No CSV is written.
    EmptySession,
    Exported {
        rows: u64,
        /// Records skipped because they failed to decode.
        skipped: u64,
        /// Size of the incomplete record dropped at end of file, if any.
        trailing_bytes: usize,
    },
}

/// Convert the log at `bin_path` into a CSV file at `csv_path`.
///
/// Corrupt records are skipped with a warning. A log that is non-empty but has no valid
/// header fails with [`DriverError::InvalidLog`].
pub fn export_csv(bin_path: impl AsRef<Path>, csv_path: impl AsRef<Path>) -> Result<ExportOutcome> {
    let bin_path = bin_path.as_ref();
    let csv_path = csv_path.as_ref();

    if fs::metadata(bin_path)?.len() == 0 {
        info!("{} is empty (no samples streamed), nothing to export", bin_path.display());
        return Ok(ExportOutcome::EmptySession);
    }

    let mut reader = BinaryLogReader::open(bin_path)?;
    let mut out = BufWriter::new(File::create(csv_path)?);
    writeln!(out, "{CSV_HEADER}")?;

    let mut rows = 0u64;
    let mut skipped = 0u64;
    for record in reader.by_ref() {
        match record {
            Ok(r) => {
                writeln!(out, "{},{},{}", r.timestamp, r.duty, r.current)?;
                rows += 1;
            }
            Err(e @ DriverError::RecordCorruption { .. }) => {
                warn!("skipping record: {}", e);
                skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }
    out.flush()?;

    info!(
        "exported {} rows from {} to {} ({} skipped)",
        rows,
        bin_path.display(),
        csv_path.display(),
        skipped
    );
    Ok(ExportOutcome::Exported {
        rows,
        skipped,
        trailing_bytes: reader.trailing_bytes(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::{BinaryLogWriter, LogHeader, LogRecord};
    use crate::stream::RawSample;
    use crate::test_support::scratch_dir;
    use proptest::prelude::*;

    #[test]
    fn empty_log_is_an_empty_session() {
        let dir = scratch_dir("export_empty");
        let bin = dir.join("s.bin");
        BinaryLogWriter::create(&bin, 1.0).unwrap().close().unwrap();
        let csv = dir.join("s.csv");
        assert_eq!(export_csv(&bin, &csv).unwrap(), ExportOutcome::EmptySession);
        assert!(!csv.exists());
    }

    #[test]
    fn garbage_file_is_rejected() {
        let dir = scratch_dir("export_garbage");
        let bin = dir.join("g.bin");
        fs::write(&bin, b"not a stream log at all").unwrap();
        assert!(matches!(
            export_csv(&bin, dir.join("g.csv")),
            Err(DriverError::InvalidLog(_))
        ));
    }

    #[test]
    fn skips_corrupt_and_trailing_records() {
        let dir = scratch_dir("export_corrupt");
        let bin = dir.join("c.bin");
        let mut bytes = Vec::new();
        LogHeader::new(1.0).write_to(&mut bytes).unwrap();
        bytes.extend_from_slice(&LogRecord { duty: 10, current: 20, timestamp: 0.5 }.encode());
        bytes.extend_from_slice(&LogRecord { duty: 0, current: 0, timestamp: f64::INFINITY }.encode());
        bytes.extend_from_slice(&LogRecord { duty: 11, current: 21, timestamp: 0.75 }.encode());
        bytes.extend_from_slice(&[1, 2, 3]);
        fs::write(&bin, bytes).unwrap();

        let csv = dir.join("c.csv");
        let outcome = export_csv(&bin, &csv).unwrap();
        assert_eq!(
            outcome,
            ExportOutcome::Exported {
                rows: 2,
                skipped: 1,
                trailing_bytes: 3
            }
        );
        let text = fs::read_to_string(&csv).unwrap();
        assert_eq!(text, "timestamp,duty,current\n0.5,10,20\n0.75,11,21\n");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn rows_preserve_values(batches in prop::collection::vec(
            (prop::collection::vec((any::<u16>(), any::<u16>()), 1..9), 0.0f64..1.0e6),
            1..20,
        )) {
            let dir = scratch_dir("export_prop");
            let bin = dir.join("p.bin");
            let mut writer = BinaryLogWriter::create(&bin, 500.0).unwrap();
            let mut expected = Vec::new();
            for (samples, t) in &batches {
                let raw: Vec<RawSample> = samples.iter().map(|&(d, c)| RawSample::new(d, c)).collect();
                writer.append(&raw, *t).unwrap();
                expected.extend(samples.iter().map(|&(d, c)| (*t, d, c)));
            }
            writer.close().unwrap();

            let csv = dir.join("p.csv");
            let outcome = export_csv(&bin, &csv).unwrap();
            prop_assert_eq!(outcome, ExportOutcome::Exported {
                rows: expected.len() as u64,
                skipped: 0,
                trailing_bytes: 0,
            });

            let text = fs::read_to_string(&csv).unwrap();
            let mut lines = text.lines();
            prop_assert_eq!(lines.next(), Some(CSV_HEADER));
            for (line, (t, d, c)) in lines.zip(expected.iter()) {
                let fields: Vec<&str> = line.split(',').collect();
                prop_assert_eq!(fields[0].parse::<f64>().unwrap().to_bits(), t.to_bits());
                prop_assert_eq!(fields[1].parse::<u16>().unwrap(), *d);
                prop_assert_eq!(fields[2].parse::<u16>().unwrap(), *c);
            }
        }
    }
}
