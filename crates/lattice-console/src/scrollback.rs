use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub const DEFAULT_SCROLLBACK_LINES: usize = 2000;

/// Where a session renders output. Chunks arrive in order and are never reordered.
pub trait RenderSink: Send {
    fn write(&mut self, chunk: &str);
    /// Called once when the owning session is disposed.
    fn release(&mut self);
}

impl<T: RenderSink> RenderSink for Arc<Mutex<T>> {
    fn write(&mut self, chunk: &str) {
        if let Ok(mut inner) = self.lock() {
            inner.write(chunk);
        }
    }

    fn release(&mut self) {
        if let Ok(mut inner) = self.lock() {
            inner.release();
        }
    }
}

/// Bounded line buffer. `\r\n` and lone `\r` both end a line, even when the
/// pair is split across two chunks.
#[derive(Debug)]
pub struct Scrollback {
    lines: VecDeque<String>,
    partial: String,
    pending_cr: bool,
    capacity: usize,
    released: bool,
}

impl Scrollback {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            partial: String::new(),
            pending_cr: false,
            capacity: capacity.max(1),
            released: false,
        }
    }

    pub fn push_chunk(&mut self, chunk: &str) {
        if self.released {
            return;
        }
        for ch in chunk.chars() {
            match ch {
                '\r' => {
                    if self.pending_cr {
                        self.end_line();
                    }
                    self.pending_cr = true;
                }
                '\n' => {
                    self.pending_cr = false;
                    self.end_line();
                }
                other => {
                    if self.pending_cr {
                        self.pending_cr = false;
                        self.end_line();
                    }
                    self.partial.push(other);
                }
            }
        }
    }

    /// Completed lines, oldest first.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn partial(&self) -> &str {
        &self.partial
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Completed lines plus the unterminated tail, joined with `\n`.
    pub fn contents(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(&self.partial);
        out
    }

    fn end_line(&mut self) {
        let line = std::mem::take(&mut self.partial);
        self.lines.push_back(line);
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
    }
}

impl Default for Scrollback {
    fn default() -> Self {
        Self::new(DEFAULT_SCROLLBACK_LINES)
    }
}

impl RenderSink for Scrollback {
    fn write(&mut self, chunk: &str) {
        self.push_chunk(chunk);
    }

    fn release(&mut self) {
        if self.pending_cr {
            self.pending_cr = false;
            self.end_line();
        }
        self.released = true;
    }
}
