//! Bounded per-session debug log.
//!
//! Lines are prefixed with milliseconds since the session started and
//! forwarded to the process-wide logging sink as they are written.

use crate::global;
use std::collections::VecDeque;
use std::fmt;
use tokio::time::Instant;

/// Ring of the most recent debug lines of one session.
#[derive(Debug)]
pub struct DebugLog {
    started: Instant,
    lines: VecDeque<String>,
    capacity: usize,
    dropped: u64,
}

impl DebugLog {
    /// Create a log keeping at most `capacity` lines
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            started: Instant::now(),
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Append a line.
    pub fn push(&mut self, message: impl fmt::Display) {
        let line = format!("[{}] {}", self.started.elapsed().as_millis(), message);
        tracing::debug!(target: "duplex::session", "{}", line);
        global::emit_log(&line);

        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line);
    }

    /// Lines currently held
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// True if nothing was logged
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines evicted to respect the capacity
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// All held lines joined with newlines
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.dropped > 0 {
            out.push_str(&format!("... {} earlier line(s) dropped\n", self.dropped));
        }
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}
