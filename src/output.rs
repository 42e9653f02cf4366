//! Output handling and buffering for process logs.
//!
//! This module provides the per-project `LogBuffer` and the decoding step that turns
//! raw chunks read from a child's stdout/stderr into displayable text lines.

use std::collections::VecDeque;

use strip_ansi_escapes::strip;

/// Default number of lines kept per project.
pub const DEFAULT_MAX_LINES: usize = 1000;

/// A fixed-capacity ring buffer of output lines, oldest first.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<String>,
}

impl LogBuffer {
    /// Creates a new `LogBuffer` with the specified maximum capacity.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(max_lines: usize) -> Self {
        let max_lines = max_lines.max(1);
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Appends a line, then drops however many of the oldest lines exceed capacity.
    ///
    /// Returns the number of lines dropped.
    pub fn append(&mut self, line: impl Into<String>) -> usize {
        self.lines.push_back(line.into());
        let excess = self.lines.len().saturating_sub(self.max_lines);
        if excess > 0 {
            self.lines.drain(..excess);
        }
        excess
    }

    /// Returns a copy of the current contents in insertion order.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

/// Decodes one raw output chunk (a single line including its terminator) into text.
///
/// Invalid UTF-8 is replaced, the trailing `\n`/`\r\n` is removed, and ANSI escape
/// codes are stripped when `strip_ansi` is set.
pub fn decode_chunk(raw: &[u8], strip_ansi: bool) -> String {
    let mut end = raw.len();
    while end > 0 && matches!(raw[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    let raw = &raw[..end];
    if strip_ansi {
        String::from_utf8_lossy(&strip(raw)).into_owned()
    } else {
        String::from_utf8_lossy(raw).into_owned()
    }
}
