//! Buffering Backend - pluggable intermediate storage for flat records.
//!
//! Two interchangeable backings selected by configuration: file-backed
//! (anonymous temp files, reclaimed by the OS on every exit path) and
//! memory-backed (growable byte buffers). The choice changes the resource
//! footprint, never the observable output.
//!
//! The engine works with pairs of buffers through [`DoubleBuffer`]: the
//! buffer just written becomes the next pass's input and a cleared one
//! becomes the new output ("role swap"). Readers opened after a swap
//! observe exactly what the prior writer produced; `open_reader` flushes
//! before reading.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Cursor, Seek, SeekFrom, Write};

use crate::error::{BufferError, BufferResult};

// =============================================================================
// Buffer Mode
// =============================================================================

/// Storage backing for intermediate records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferMode {
    /// Anonymous temp files on disk. Bounded memory, survives large jobs.
    #[default]
    File,
    /// Growable in-memory byte buffers. Faster, memory-proportional.
    Memory,
}

// =============================================================================
// Record Buffer
// =============================================================================

enum Backing {
    File(BufWriter<File>),
    Memory(Vec<u8>),
}

/// A single spill buffer holding newline-terminated records.
pub struct RecordBuffer {
    backing: Option<Backing>,
    lines: u64,
}

impl RecordBuffer {
    /// Create an empty buffer. File mode uses `tempfile::tempfile()`,
    /// which unlinks immediately: the OS reclaims the file whenever the
    /// handle drops, success or failure.
    pub fn create(mode: BufferMode, phase: &'static str) -> BufferResult<Self> {
        let backing = match mode {
            BufferMode::File => {
                let file = tempfile::tempfile().map_err(|e| BufferError::io(phase, e))?;
                Backing::File(BufWriter::new(file))
            }
            BufferMode::Memory => Backing::Memory(Vec::new()),
        };
        Ok(Self { backing: Some(backing), lines: 0 })
    }

    /// Append one record line (terminator added here).
    pub fn write_line(&mut self, line: &str, phase: &'static str) -> BufferResult<()> {
        match self.backing.as_mut() {
            None => Err(BufferError::Disposed(phase)),
            Some(Backing::File(writer)) => {
                writer
                    .write_all(line.as_bytes())
                    .and_then(|_| writer.write_all(b"\n"))
                    .map_err(|e| BufferError::io(phase, e))?;
                self.lines += 1;
                Ok(())
            }
            Some(Backing::Memory(buf)) => {
                buf.extend_from_slice(line.as_bytes());
                buf.push(b'\n');
                self.lines += 1;
                Ok(())
            }
        }
    }

    /// Number of lines written since creation or the last `clear`.
    pub fn line_count(&self) -> u64 {
        self.lines
    }

    /// Open a reader over everything written so far. Flushes first, so the
    /// reader observes exactly what the writer produced.
    pub fn open_reader(&mut self, phase: &'static str) -> BufferResult<BufferReader<'_>> {
        let inner = match self.backing.as_mut() {
            None => return Err(BufferError::Disposed(phase)),
            Some(Backing::File(writer)) => {
                writer.flush().map_err(|e| BufferError::io(phase, e))?;
                let file = writer.get_mut();
                file.seek(SeekFrom::Start(0)).map_err(|e| BufferError::io(phase, e))?;
                ReaderInner::File(BufReader::new(file))
            }
            Some(Backing::Memory(buf)) => ReaderInner::Memory(Cursor::new(buf.as_slice())),
        };
        Ok(BufferReader { inner, phase })
    }

    /// Truncate for reuse as a fresh output buffer.
    pub fn clear(&mut self, phase: &'static str) -> BufferResult<()> {
        match self.backing.as_mut() {
            None => return Err(BufferError::Disposed(phase)),
            Some(Backing::File(writer)) => {
                writer.flush().map_err(|e| BufferError::io(phase, e))?;
                let file = writer.get_mut();
                file.set_len(0).map_err(|e| BufferError::io(phase, e))?;
                file.seek(SeekFrom::Start(0)).map_err(|e| BufferError::io(phase, e))?;
            }
            Some(Backing::Memory(buf)) => buf.clear(),
        }
        self.lines = 0;
        Ok(())
    }

    /// Release the backing storage. Safe to call multiple times; also runs
    /// on drop, so a half-built pass never leaks a temp file.
    pub fn dispose(&mut self) {
        self.backing = None;
        self.lines = 0;
    }
}

impl Drop for RecordBuffer {
    fn drop(&mut self) {
        self.dispose();
    }
}

// =============================================================================
// Reader
// =============================================================================

enum ReaderInner<'a> {
    File(BufReader<&'a mut File>),
    Memory(Cursor<&'a [u8]>),
}

/// Line iterator over a buffer's contents.
pub struct BufferReader<'a> {
    inner: ReaderInner<'a>,
    phase: &'static str,
}

impl Iterator for BufferReader<'_> {
    type Item = BufferResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut line = String::new();
        let read = match &mut self.inner {
            ReaderInner::File(reader) => reader.read_line(&mut line),
            ReaderInner::Memory(cursor) => cursor.read_line(&mut line),
        };
        match read {
            Err(e) => Some(Err(BufferError::io(self.phase, e))),
            Ok(0) => None,
            Ok(_) => {
                if line.ends_with('\n') {
                    line.pop();
                }
                Some(Ok(line))
            }
        }
    }
}

// =============================================================================
// Double Buffer
// =============================================================================

/// The double-buffering pattern used by every multi-pass phase: read from
/// `current`, spill to `next`, then [`DoubleBuffer::swap`] roles.
pub struct DoubleBuffer {
    current: RecordBuffer,
    next: RecordBuffer,
}

impl DoubleBuffer {
    pub fn create(mode: BufferMode, phase: &'static str) -> BufferResult<Self> {
        Ok(Self {
            current: RecordBuffer::create(mode, phase)?,
            next: RecordBuffer::create(mode, phase)?,
        })
    }

    /// The buffer holding the current pass's input.
    pub fn current(&mut self) -> &mut RecordBuffer {
        &mut self.current
    }

    /// The buffer collecting spilled lines for the next pass.
    pub fn next_mut(&mut self) -> &mut RecordBuffer {
        &mut self.next
    }

    /// Disjoint read/write sides for a single streaming pass.
    pub fn split(&mut self) -> (&mut RecordBuffer, &mut RecordBuffer) {
        (&mut self.current, &mut self.next)
    }

    /// Swap roles: what was just written becomes the input of the next
    /// pass; the consumed input is truncated and becomes the new output.
    pub fn swap(&mut self, phase: &'static str) -> BufferResult<()> {
        std::mem::swap(&mut self.current, &mut self.next);
        self.next.clear(phase)
    }

    /// Throw away a partially-written next side (memory-pressure retry
    /// rewinds to the start of the current pass).
    pub fn reset_next(&mut self, phase: &'static str) -> BufferResult<()> {
        self.next.clear(phase)
    }

    /// Release both sides. Idempotent.
    pub fn dispose(&mut self) {
        self.current.dispose();
        self.next.dispose();
    }
}
