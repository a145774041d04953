//! Line-atomic event emitter shared by concurrently running tasks.
//!
//! Every call writes exactly one newline-terminated record and flushes it, so
//! the controlling side sees activity as it happens and lines from different
//! tasks never interleave mid-record.

use crate::event::StreamEvent;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Cloneable handle writing stream records to one underlying writer.
#[derive(Clone)]
pub struct EventEmitter {
    writer: SharedWriter,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter").finish_non_exhaustive()
    }
}

impl EventEmitter {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Emitter writing to the process's standard output.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Emitter writing into an in-memory buffer, for tests and replays.
    pub fn memory() -> (Self, MemorySink) {
        let sink = MemorySink::default();
        (Self::new(sink.clone()), sink)
    }

    /// Serializes and writes one event.
    pub fn emit(&self, event: &StreamEvent) -> io::Result<()> {
        let json = serde_json::to_string(event)?;
        self.emit_raw(&json)
    }

    /// Writes a raw line verbatim (used to forward agent output).
    pub fn emit_raw(&self, line: &str) -> io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()
    }
}

/// Shared in-memory byte buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MemorySink {
    /// Everything written so far, split into lines.
    pub fn lines(&self) -> Vec<String> {
        let buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&buffer)
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
