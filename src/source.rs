use std::io::{self, BufRead, BufReader, Read};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use serialport::SerialPort;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::sample_parser::LineSchema;

#[derive(Error, Debug)]
pub enum SourceError {
    /// A single bad read; the next one may succeed
    #[error("transient read error: {0}")]
    Transient(#[source] io::Error),

    #[error("sample source disconnected: {0}")]
    Disconnected(String),

    #[error("cannot open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },
}

impl SourceError {
    fn from_io(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotFound
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::UnexpectedEof => SourceError::Disconnected(e.to_string()),
            _ => SourceError::Transient(e),
        }
    }
}

/// Yields raw text lines from the glove, one reading per line.
pub trait SampleSource {
    /// `Ok(None)` means nothing arrived within the read timeout.
    fn read_line(&mut self) -> Result<Option<String>, SourceError>;
}

/// Discards everything the source produces for `duration`. The controller
/// resets when the port opens and prints boot noise before real readings.
pub fn warm_up<S: SampleSource + ?Sized>(
    source: &mut S,
    duration: Duration,
) -> Result<usize, SourceError> {
    let deadline = Instant::now() + duration;
    let mut discarded = 0;
    while Instant::now() < deadline {
        match source.read_line() {
            Ok(Some(_)) => discarded += 1,
            Ok(None) => {}
            Err(SourceError::Transient(e)) => debug!("warm-up read error ignored: {e}"),
            Err(e) => return Err(e),
        }
    }
    debug!(discarded, "warm-up finished");
    Ok(discarded)
}

/// Longest line kept; a device that stops sending newlines cannot grow the
/// buffer past this.
pub const MAX_LINE_BYTES: usize = 4096;

/// Line source over any buffered reader. Timeouts from the reader surface as
/// `Ok(None)` and keep the partial line for the next call; EOF disconnects.
/// A line longer than `MAX_LINE_BYTES` comes back empty, up to and including
/// its newline.
pub struct ReaderSource<R: BufRead> {
    reader: R,
    pending: Vec<u8>,
    discarding: bool,
}

impl<R: BufRead> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            pending: Vec::with_capacity(128),
            discarding: false,
        }
    }
}

impl<R: BufRead> SampleSource for ReaderSource<R> {
    fn read_line(&mut self) -> Result<Option<String>, SourceError> {
        let budget = MAX_LINE_BYTES.saturating_sub(self.pending.len()) as u64;
        match (&mut self.reader).take(budget).read_until(b'\n', &mut self.pending) {
            Ok(0) if self.pending.is_empty() => {
                Err(SourceError::Disconnected("end of stream".into()))
            }
            Ok(_) => {
                let complete = self.pending.last() == Some(&b'\n');
                if !complete && self.pending.len() >= MAX_LINE_BYTES {
                    if !self.discarding {
                        warn!(limit = MAX_LINE_BYTES, "line too long, dropped");
                    }
                    self.pending.clear();
                    self.discarding = true;
                    return Ok(Some(String::new()));
                }
                if self.discarding {
                    // Tail of an oversized line
                    self.pending.clear();
                    self.discarding = !complete;
                    return Ok(Some(String::new()));
                }

                // Firmware noise can contain invalid UTF-8; keep what decodes
                let line = String::from_utf8_lossy(&self.pending).trim().to_string();
                self.pending.clear();
                Ok(Some(line))
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                Ok(None)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => {
                self.pending.clear();
                self.discarding = false;
                Err(SourceError::from_io(e))
            }
        }
    }
}

/// Lines fed from another thread.
pub struct ChannelSource {
    rx: Receiver<String>,
    timeout: Duration,
}

impl ChannelSource {
    pub fn new(rx: Receiver<String>, timeout: Duration) -> Self {
        Self { rx, timeout }
    }
}

impl SampleSource for ChannelSource {
    fn read_line(&mut self) -> Result<Option<String>, SourceError> {
        match self.rx.recv_timeout(self.timeout) {
            Ok(line) => Ok(Some(line)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(SourceError::Disconnected("sender dropped".into()))
            }
        }
    }
}

/// Serial connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    /// Input discarded after connect before readings are trusted
    pub warm_up_ms: u64,
    /// Token layout of the lines the glove prints
    pub line_schema: LineSchema,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            read_timeout_ms: 1_000,
            warm_up_ms: 2_000,
            line_schema: LineSchema::FIRMWARE,
        }
    }
}

pub type SerialSource = ReaderSource<BufReader<Box<dyn SerialPort>>>;

/// Opens the port and returns the reading side plus a cloned handle for
/// writing commands back to the controller.
pub fn open_serial(config: &SerialConfig) -> Result<(SerialSource, Box<dyn SerialPort>), SourceError> {
    let open_err = |source| SourceError::Open {
        port: config.port.clone(),
        source,
    };

    let port = serialport::new(&config.port, config.baud_rate)
        .timeout(Duration::from_millis(config.read_timeout_ms))
        .open()
        .map_err(open_err)?;
    let writer = port.try_clone().map_err(open_err)?;

    info!(port = %config.port, baud = config.baud_rate, "serial port open");
    Ok((ReaderSource::new(BufReader::new(port)), writer))
}
