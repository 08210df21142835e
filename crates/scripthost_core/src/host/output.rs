//! Line-buffered capture of script output.
//!
//! # Responsibility
//! - Turn the byte stream a script writes into one log record per line.
//!
//! # Invariants
//! - `\n` and `\r` terminate a line; an empty buffer never emits a record.
//! - A trailing fragment is only emitted by an explicit `flush`.
//! - Each sink is guarded by its own mutex, so one `write` call is never
//!   interleaved with another thread's bytes.

use log::{error, info};
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

/// Which interpreter stream a sink captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Destination for completed output lines.
pub trait LogChannel: Send + Sync {
    fn emit(&self, stream: OutputStream, line: &str);
}

/// Default channel: stdout lines at info, stderr lines at error.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogCrateChannel;

impl LogChannel for LogCrateChannel {
    fn emit(&self, stream: OutputStream, line: &str) {
        match stream {
            OutputStream::Stdout => info!(
                "event=script_output module=script stream=stdout message={}",
                line
            ),
            OutputStream::Stderr => error!(
                "event=script_output module=script stream=stderr message={}",
                line
            ),
        }
    }
}

/// Line-buffering sink for one interpreter stream.
pub struct OutputSink {
    stream: OutputStream,
    buffer: Mutex<Vec<u8>>,
    channel: Arc<dyn LogChannel>,
}

impl OutputSink {
    pub fn new(stream: OutputStream, channel: Arc<dyn LogChannel>) -> Self {
        Self {
            stream,
            buffer: Mutex::new(Vec::new()),
            channel,
        }
    }

    /// Appends bytes, emitting one record per completed line.
    pub fn write_bytes(&self, bytes: &[u8]) {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        for &byte in bytes {
            if byte == b'\n' || byte == b'\r' {
                self.emit_buffered(&mut buffer);
            } else {
                buffer.push(byte);
            }
        }
    }

    /// Writes `text` followed by a line terminator in one locked step.
    pub fn write_line(&self, text: &str) {
        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(b'\n');
        self.write_bytes(&line);
    }

    /// Emits any pending fragment.
    pub fn flush(&self) {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        self.emit_buffered(&mut buffer);
    }

    fn emit_buffered(&self, buffer: &mut Vec<u8>) {
        if buffer.is_empty() {
            return;
        }
        self.channel
            .emit(self.stream, &String::from_utf8_lossy(buffer));
        buffer.clear();
    }
}

impl io::Write for &OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        OutputSink::flush(*self);
        Ok(())
    }
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSink")
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}
