//! Process handles
//!
//! An [`AutodetectProcess`] owns the streams and the liveness of one analysis
//! process. Two implementations exist:
//! - [`NativeProcess`] spawns the real binary
//! - [`BlackHoleProcess`] runs in-process and acknowledges flushes, for tests
//!
//! The communicator takes the input and output streams once, at
//! construction. Whoever holds the input signals end-of-input by shutting it
//! down; `close` drops any input the handle still holds.

pub mod black_hole;
pub mod command;
pub mod native;

pub use black_hole::BlackHoleProcess;
pub use native::NativeProcess;

use crate::error::AppResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Type-erased process input stream.
pub type ProcessInput = Box<dyn AsyncWrite + Unpin + Send>;

/// Type-erased process output stream.
pub type ProcessOutput = Box<dyn AsyncRead + Unpin + Send>;

/// A running (or finished) analysis process.
#[async_trait]
pub trait AutodetectProcess: Send + Sync {
    /// Take the input stream. Returns `None` once taken.
    fn take_input(&self) -> Option<ProcessInput>;

    /// Take the output stream. Returns `None` once taken.
    fn take_output(&self) -> Option<ProcessOutput>;

    /// True until the process has exited. Never fails: a failed check counts
    /// as not alive.
    fn is_alive(&self) -> bool;

    /// Most recent diagnostic text from the error stream; may be empty.
    fn read_error(&self) -> String;

    /// Shut the process down, waiting at most `timeout` for it to exit.
    ///
    /// Idempotent.
    async fn close(&self, timeout: Duration) -> AppResult<()>;
}

/// Bounded buffer of the last lines written to an error stream.
#[derive(Debug)]
pub struct ErrorBuffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl ErrorBuffer {
    /// Buffer keeping at most `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Append a line, dropping the oldest once full.
    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// Buffered lines joined with newlines, oldest first.
    pub fn contents(&self) -> String {
        let lines = self.lines.lock();
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    /// Drop every buffered line.
    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_buffer_keeps_latest_lines() {
        let buffer = ErrorBuffer::new(2);
        buffer.push("first");
        buffer.push("second");
        buffer.push("third");
        assert_eq!(buffer.contents(), "second\nthird");

        buffer.clear();
        assert_eq!(buffer.contents(), "");
    }
}
