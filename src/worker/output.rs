//! Buffered capture of one child output stream
//!
//! Each stream (stdout, stderr) grows a byte buffer that is flushed to the
//! execution's log file when the first of these fires: 1 s since the last
//! flush, 10 KiB buffered, 100 buffered lines, or process exit (`finish`).
//!
//! Writes stop at the inline cap: output up to and including exactly the
//! cap is preserved verbatim and not flagged; the first byte past the cap
//! sets the truncated flag and everything beyond it is discarded.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const FLUSH_BYTES: usize = 10 * 1024;
const FLUSH_LINES: usize = 100;

/// Totals reported back into the execution row.
#[derive(Debug, Clone, Copy)]
pub struct OutputSummary {
    pub bytes_written: u64,
    pub truncated: bool,
}

pub struct OutputBuffer {
    file: File,
    buf: Vec<u8>,
    buffered_lines: usize,
    last_flush: Instant,
    written: u64,
    cap: u64,
    truncated: bool,
}

impl OutputBuffer {
    pub fn create(path: &Path, cap: u64) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file,
            buf: Vec::with_capacity(FLUSH_BYTES),
            buffered_lines: 0,
            last_flush: Instant::now(),
            written: 0,
            cap,
            truncated: false,
        })
    }

    /// Append a chunk, flushing when the policy fires.
    pub fn push(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        if self.truncated {
            // Past the cap: discard instead of growing the buffer.
            return Ok(());
        }
        self.buf.extend_from_slice(bytes);
        self.buffered_lines += bytes.iter().filter(|b| **b == b'\n').count();

        if self.buf.len() >= FLUSH_BYTES
            || self.buffered_lines >= FLUSH_LINES
            || self.last_flush.elapsed() >= FLUSH_INTERVAL
        {
            self.flush()?;
        }
        Ok(())
    }

    /// Write the buffer out, respecting the inline cap.
    pub fn flush(&mut self) -> std::io::Result<()> {
        if !self.buf.is_empty() && !self.truncated {
            let room = (self.cap - self.written) as usize;
            let take = room.min(self.buf.len());
            self.file.write_all(&self.buf[..take])?;
            self.written += take as u64;
            if self.buf.len() > take {
                self.truncated = true;
            }
        }
        self.buf.clear();
        self.buffered_lines = 0;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Final flush on process exit.
    pub fn finish(mut self) -> std::io::Result<OutputSummary> {
        self.flush()?;
        self.file.flush()?;
        Ok(OutputSummary {
            bytes_written: self.written,
            truncated: self.truncated,
        })
    }
}
