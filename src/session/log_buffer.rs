//! Bounded capture of dev-server output.

use std::collections::VecDeque;

/// Default number of output lines kept per session.
pub const DEFAULT_LOG_CAPACITY: usize = 200;

/// Most-recent-N ring of captured stdout/stderr lines.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    capacity: usize,
    lines: VecDeque<String>,
    /// Lines evicted since the session started.
    dropped: u64,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            lines: VecDeque::with_capacity(capacity.min(1024)),
            dropped: 0,
        }
    }

    pub fn push_line(&mut self, line: impl Into<String>) {
        self.lines.push_back(line.into());
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
            self.dropped = self.dropped.saturating_add(1);
        }
    }

    /// All retained lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// The last `n` retained lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let start = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_first() {
        let mut buf = LogBuffer::new(3);
        for i in 0..5 {
            buf.push_line(format!("line {i}"));
        }
        assert_eq!(buf.lines(), vec!["line 2", "line 3", "line 4"]);
        assert_eq!(buf.dropped(), 2);
    }

    #[test]
    fn tail_returns_most_recent() {
        let mut buf = LogBuffer::new(10);
        buf.push_line("a");
        buf.push_line("b");
        buf.push_line("c");
        assert_eq!(buf.tail(2), vec!["b", "c"]);
        assert_eq!(buf.tail(10), vec!["a", "b", "c"]);
    }

    #[test]
    fn zero_capacity_keeps_one_line() {
        let mut buf = LogBuffer::new(0);
        buf.push_line("first");
        buf.push_line("second");
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.lines(), vec!["second"]);
    }
}
