// Prefixed Log Multiplexer
// Per-step colored prefixes over a shared terminal, plus the per-stream
// log target configuration

use serde::{Deserialize, Serialize};

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;

/// ANSI foreground codes handed out round-robin to steps.
const PALETTE: [u8; 8] = [36, 33, 32, 35, 34, 91, 95, 96];

/// A display color assigned to a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color(u8);

impl Default for Color {
    fn default() -> Self {
        Color(PALETTE[0])
    }
}

impl Color {
    /// The palette color for the given allocation index; wraps once the
    /// palette is exhausted. Steps get distinct colors until then.
    pub fn from_index(index: usize) -> Self {
        Color(PALETTE[index % PALETTE.len()])
    }

    /// Style a step name as a log prefix. The writer wraps this in bold
    /// and appends the reset sequence itself.
    pub fn prefix(&self, name: &str) -> String {
        format!("\x1b[{}m{}", self.0, name)
    }
}

/// Where a step's output stream goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogHandler {
    /// The shared terminal.
    #[default]
    Stdout,
    /// A file named by `path`.
    File,
    /// Terminal and file.
    Both,
    /// Swallow the stream.
    Discard,
}

/// Per-stream log configuration for a step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub handler: LogHandler,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl LogConfig {
    /// Open the configured sink. Files are opened in append mode so the
    /// phases of a run land in one log.
    pub fn open(&self) -> io::Result<Box<dyn Write + Send>> {
        match self.handler {
            LogHandler::Stdout => Ok(Box::new(io::stdout())),
            LogHandler::Discard => Ok(Box::new(io::sink())),
            LogHandler::File => Ok(Box::new(self.open_file()?)),
            LogHandler::Both => {
                let file = self.open_file()?;
                Ok(Box::new(MultiWriter {
                    sinks: vec![Box::new(io::stdout()), Box::new(file)],
                }))
            }
        }
    }

    fn open_file(&self) -> io::Result<std::fs::File> {
        let path = self.path.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "log handler requires a path")
        })?;
        OpenOptions::new().create(true).append(true).open(path)
    }
}

/// Fans writes out to several sinks.
struct MultiWriter {
    sinks: Vec<Box<dyn Write + Send>>,
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for sink in &mut self.sinks {
            sink.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        for sink in &mut self.sinks {
            sink.flush()?;
        }
        Ok(())
    }
}

/// A writer that prepends a bold colored prefix to every line.
///
/// Partial lines stay buffered across writes; each complete line is
/// handed to the sink in a single call so concurrent steps never
/// interleave mid-line. Nothing is flushed implicitly at end-of-stream,
/// so callers flush when the step completes.
pub struct PrefixedWriter {
    prefix: String,
    sink: Box<dyn Write + Send>,
    buffer: Vec<u8>,
}

impl PrefixedWriter {
    pub fn new(prefix: String, sink: Box<dyn Write + Send>) -> Self {
        Self {
            prefix,
            sink,
            buffer: Vec::new(),
        }
    }

    /// Write one complete line through the prefix format.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        let formatted = format!("\x1b[1m{}\x1b[0m {}\x1b[0m\n", self.prefix, line);
        self.sink.write_all(formatted.as_bytes())
    }

    fn drain_complete_lines(&mut self) -> io::Result<()> {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let rest = self.buffer.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.buffer, rest);
            line.pop(); // trailing newline
            let line = String::from_utf8_lossy(&line).into_owned();
            self.write_line(&line)?;
        }
        Ok(())
    }
}

impl Write for PrefixedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        self.drain_complete_lines()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            let pending = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&pending).into_owned();
            self.write_line(&line)?;
        }
        self.sink.flush()
    }
}
