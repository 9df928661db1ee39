//! Newline-delimited JSON framing for engine stdout
//!
//! The engine writes one JSON value per line. Reads from the pipe arrive in
//! arbitrary chunks, so `LineFramer` buffers bytes and hands out complete
//! lines as they become available. A trailing partial line stays buffered
//! until the rest of it arrives.

use crate::config::DEFAULT_MAX_LINE_BYTES;
use crate::error::FramingError;
use serde_json::Value;

/// Maximum number of bytes quoted from a malformed line in errors and logs
const SNIPPET_LEN: usize = 200;

/// Stateful splitter turning a byte stream into decoded JSON values
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    /// Start of the first unconsumed byte in `buf`
    start: usize,
    /// Everything in `buf[start..scanned]` is known to contain no newline
    scanned: usize,
    max_line_bytes: usize,
    /// Dropping the remainder of an oversized line
    discarding: bool,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            start: 0,
            scanned: 0,
            max_line_bytes: max_line_bytes.max(1),
            discarding: false,
        }
    }

    /// Append freshly read bytes and iterate over the messages completed by them.
    ///
    /// The iterator is lazy: frames not pulled before it is dropped stay
    /// buffered and are yielded by the next call.
    pub fn push(&mut self, bytes: &[u8]) -> Frames<'_> {
        self.compact();
        self.buf.extend_from_slice(bytes);
        Frames { framer: self }
    }

    /// Number of buffered bytes not yet yielded as a frame
    pub fn pending(&self) -> usize {
        self.buf.len() - self.start
    }

    /// Signal end of stream. Reports a partial line left in the buffer, if any.
    pub fn finish(&mut self) -> Option<FramingError> {
        let leftover = &self.buf[self.start..];
        let truncated = !self.discarding && leftover.iter().any(|b| !b.is_ascii_whitespace());
        let pending = leftover.len();

        self.buf.clear();
        self.start = 0;
        self.scanned = 0;
        self.discarding = false;

        truncated.then_some(FramingError::Truncated(pending))
    }

    fn compact(&mut self) {
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.scanned -= self.start;
            self.start = 0;
        }
    }

    fn next_frame(&mut self) -> Option<Result<Value, FramingError>> {
        loop {
            let search_from = self.scanned.max(self.start);
            let newline = self.buf[search_from..].iter().position(|&b| b == b'\n');

            let Some(offset) = newline else {
                self.scanned = self.buf.len();
                if self.discarding {
                    self.start = self.buf.len();
                    self.scanned = self.start;
                } else if self.buf.len() - self.start > self.max_line_bytes {
                    self.discarding = true;
                    self.start = self.buf.len();
                    self.scanned = self.start;
                    return Some(Err(FramingError::LineTooLong {
                        limit: self.max_line_bytes,
                    }));
                }
                return None;
            };

            let end = search_from + offset;
            let line_start = self.start;
            self.start = end + 1;
            self.scanned = self.start;

            if self.discarding {
                self.discarding = false;
                continue;
            }

            if end - line_start > self.max_line_bytes {
                return Some(Err(FramingError::LineTooLong {
                    limit: self.max_line_bytes,
                }));
            }

            let line = &self.buf[line_start..end];
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return Some(serde_json::from_slice(line).map_err(|e| FramingError::InvalidJson {
                reason: e.to_string(),
                snippet: snippet(line),
            }));
        }
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

/// Frames completed by one `push`
#[derive(Debug)]
pub struct Frames<'a> {
    framer: &'a mut LineFramer,
}

impl Iterator for Frames<'_> {
    type Item = Result<Value, FramingError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.framer.next_frame()
    }
}

fn snippet(line: &[u8]) -> String {
    let cut = line.len().min(SNIPPET_LEN);
    String::from_utf8_lossy(&line[..cut]).trim_end().to_string()
}
