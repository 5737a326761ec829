use std::fmt;
use std::io::{self, Write};

use serialport::SerialPort;
use thiserror::Error;

/// Command understood by the audio player on the glove controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActuationCommand {
    /// Play clip `n` (`000n.mp3` on the player's card)
    Play(u16),
}

impl ActuationCommand {
    /// Wire form, newline terminated.
    pub fn to_line(self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for ActuationCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActuationCommand::Play(clip) => write!(f, "PLAY:{clip}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SinkError {
    /// Worth retrying on the next command
    #[error("transient sink error: {0}")]
    Transient(#[source] io::Error),

    #[error("actuation device disconnected: {0}")]
    Disconnected(#[source] io::Error),
}

impl From<io::Error> for SinkError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotFound
            | io::ErrorKind::PermissionDenied => SinkError::Disconnected(e),
            _ => SinkError::Transient(e),
        }
    }
}

/// Accepts play commands. Fire-and-forget; no acknowledgement is read back.
pub trait ActuationSink {
    fn send(&mut self, command: ActuationCommand) -> Result<(), SinkError>;
}

/// Writes commands as text lines to any writer (serial handle, socket, stdout).
pub struct WriterSink<W: Write> {
    writer: W,
}

impl<W: Write> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> ActuationSink for WriterSink<W> {
    fn send(&mut self, command: ActuationCommand) -> Result<(), SinkError> {
        self.writer.write_all(command.to_line().as_bytes())?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Serial handle sharing the port with the sample source.
pub type SerialSink = WriterSink<Box<dyn SerialPort>>;

/// Drops every command; for dry runs.
#[derive(Debug, Default)]
pub struct NullSink;

impl ActuationSink for NullSink {
    fn send(&mut self, _command: ActuationCommand) -> Result<(), SinkError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn play_command_wire_format() {
        assert_eq!(ActuationCommand::Play(3).to_line(), "PLAY:3\n");
        assert_eq!(ActuationCommand::Play(12).to_string(), "PLAY:12");
    }

    #[test]
    fn writer_sink_appends_lines() {
        let mut sink = WriterSink::new(Vec::new());
        sink.send(ActuationCommand::Play(1)).unwrap();
        sink.send(ActuationCommand::Play(6)).unwrap();
        assert_eq!(sink.into_inner(), b"PLAY:1\nPLAY:6\n");
    }

    #[test]
    fn io_errors_are_classified() {
        let e: SinkError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(e, SinkError::Disconnected(_)));
        let e: SinkError = io::Error::new(io::ErrorKind::TimedOut, "slow").into();
        assert!(matches!(e, SinkError::Transient(_)));
    }
}
