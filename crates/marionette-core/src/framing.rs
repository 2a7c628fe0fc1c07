//! Newline-delimited JSON frame reassembly.
//!
//! The peer writes one JSON value per line. Reads from a pipe return
//! arbitrary chunks, so bytes are buffered until a `\n` shows up and only
//! then parsed. A line that fails to parse is dropped and the framer picks
//! up again at the next terminator.
//!
//! # Frame Boundaries
//!
//! Boundaries are found by scanning for the raw `\n` byte without tracking
//! JSON string state. A conforming encoder must escape control characters
//! inside strings, so a raw newline can only ever end a frame. A line broken
//! by an unescaped newline is invalid JSON on both sides of the break and is
//! reported as [`FramingAnomaly::Malformed`] twice.

use serde_json::Value;
use thiserror::Error;

/// Longest line accepted before the buffer is discarded (64MB).
///
/// Screenshots arrive base64-encoded inside a single frame, so this has to
/// be far larger than any control message.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// A recoverable problem found while reassembling frames.
///
/// These never reach a caller as an error. The framer resynchronizes on the
/// next terminator and the driver logs the anomaly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingAnomaly {
    /// A complete line that is not valid JSON.
    #[error("discarded malformed frame ({len} bytes): {reason}")]
    Malformed { len: usize, reason: String },

    /// A line grew past the size limit before its terminator arrived.
    #[error("discarded oversized frame (over {limit} bytes)")]
    Oversized { limit: usize },
}

/// Incremental line framer.
///
/// Feed it raw bytes with [`LineFramer::feed`], then drain complete frames
/// with [`LineFramer::next_frame`]. Bytes that do not yet form a complete
/// line stay buffered across calls.
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    /// Bytes before this offset are known to contain no terminator.
    scanned: usize,
    max_frame: usize,
    /// Dropping bytes until the next terminator after an oversized line.
    skipping: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFramer {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_frame,
            skipping: false,
        }
    }

    /// Append raw bytes read from the stream.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete frame out of the buffer.
    ///
    /// Returns `None` when no full line is buffered. Blank lines are skipped
    /// silently. A trailing `\r` before the terminator is tolerated.
    pub fn next_frame(&mut self) -> Option<Result<Value, FramingAnomaly>> {
        loop {
            let Some(offset) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') else {
                self.scanned = self.buf.len();
                return self.check_overflow().map(Err);
            };

            let end = self.scanned + offset;
            let line: Vec<u8> = self.buf.drain(..=end).collect();
            self.scanned = 0;

            if self.skipping {
                // Tail of a line that was already reported as oversized.
                self.skipping = false;
                continue;
            }

            let body = trim_line(&line[..line.len() - 1]);
            if body.is_empty() {
                continue;
            }

            return Some(
                serde_json::from_slice::<Value>(body).map_err(|e| FramingAnomaly::Malformed {
                    len: body.len(),
                    reason: e.to_string(),
                }),
            );
        }
    }

    /// Drop the buffer once it holds more than one frame's worth of bytes
    /// without a terminator.
    fn check_overflow(&mut self) -> Option<FramingAnomaly> {
        if self.buf.len() <= self.max_frame {
            return None;
        }
        self.buf.clear();
        self.scanned = 0;
        if self.skipping {
            return None;
        }
        self.skipping = true;
        Some(FramingAnomaly::Oversized {
            limit: self.max_frame,
        })
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &line[start..end]
}

/// Serialize a value as a single frame, terminator included.
pub fn encode_frame<T: serde::Serialize>(value: &T) -> serde_json::Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}
