//! Recording training data: live capture from the glove and conversion of
//! the firmware's human readable debug log.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use crate::csv_loader::SampleCsvWriter;
use crate::sample_parser::{parse_labeled_line, SampleParser};
use crate::source::{SampleSource, SourceError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub lines: usize,
    pub recorded: usize,
    pub skipped: usize,
}

/// Records parsed samples until `max_samples` is reached, `shutdown` fires or
/// the source disconnects. Rows are flushed as they arrive so an interrupted
/// capture keeps what it has.
pub fn capture_samples<S, W>(
    source: &mut S,
    parser: &SampleParser,
    writer: &mut SampleCsvWriter<W>,
    max_samples: Option<usize>,
    shutdown: &Receiver<()>,
) -> Result<CaptureStats>
where
    S: SampleSource + ?Sized,
    W: Write,
{
    let mut stats = CaptureStats::default();

    while max_samples.map_or(true, |max| stats.recorded < max) {
        if shutdown.try_recv().is_ok() {
            info!("capture interrupted");
            break;
        }

        let line = match source.read_line() {
            Ok(Some(line)) => line,
            Ok(None) => continue,
            Err(SourceError::Transient(e)) => {
                warn!("read error during capture: {e}");
                continue;
            }
            Err(e) => {
                warn!("capture source closed: {e}");
                break;
            }
        };
        stats.lines += 1;

        match parser.parse(&line) {
            Some(sample) => {
                writer.write(&sample)?;
                writer.flush()?;
                stats.recorded += 1;
                if stats.recorded % 100 == 0 {
                    info!(recorded = stats.recorded, "capturing");
                }
            }
            None => {
                stats.skipped += 1;
                debug!(line = %line, "no sample in line");
            }
        }
    }

    writer.flush()?;
    Ok(stats)
}

/// Converts a debug log (`Thumb:600 | Index:100 ... Gyro X:5 Y:-3 Z:2`) into a
/// training CSV with gyro columns.
pub fn convert_log(input: &Path, output: &Path) -> Result<CaptureStats> {
    let file = File::open(input).with_context(|| format!("cannot open log {:?}", input))?;
    let mut writer = SampleCsvWriter::create(output, true)?;
    let stats = convert_lines(BufReader::new(file), &mut writer)
        .with_context(|| format!("converting {:?}", input))?;
    writer.flush()?;
    Ok(stats)
}

fn convert_lines<R: BufRead, W: Write>(
    reader: R,
    writer: &mut SampleCsvWriter<W>,
) -> Result<CaptureStats> {
    let mut stats = CaptureStats::default();
    for line in reader.lines() {
        let line = line?;
        stats.lines += 1;
        match parse_labeled_line(&line) {
            Some(sample) => {
                writer.write(&sample)?;
                stats.recorded += 1;
            }
            None => stats.skipped += 1,
        }
    }
    Ok(stats)
}
