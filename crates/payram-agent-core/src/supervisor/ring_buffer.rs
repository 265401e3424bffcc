//! Fixed-capacity line buffer for child process output.

use std::sync::Mutex;

const DEFAULT_CAPACITY: usize = 200;

/// A circular buffer of log lines.
///
/// Append and tail are both O(capacity); the buffer is serialized by an
/// internal mutex so pipe-reader tasks and admin queries never block each
/// other for long.
#[derive(Debug)]
pub struct RingBuffer {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    lines: Vec<String>,
    next: usize,
    count: usize,
}

impl RingBuffer {
    /// Creates a buffer holding up to `capacity` lines; a zero capacity
    /// falls back to the default of 200.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            capacity
        };
        Self {
            inner: Mutex::new(Inner {
                lines: vec![String::new(); capacity],
                next: 0,
                count: 0,
            }),
        }
    }

    /// Appends a line, evicting the oldest when full.
    pub fn append(&self, line: String) {
        let mut inner = self.inner.lock().expect("ring buffer lock poisoned");
        let capacity = inner.lines.len();
        let next = inner.next;
        inner.lines[next] = line;
        inner.next = (next + 1) % capacity;
        if inner.count < capacity {
            inner.count += 1;
        }
    }

    /// Returns the last `n` lines in insertion order, oldest first.
    ///
    /// `tail(0)` returns an empty vector.
    #[must_use]
    pub fn tail(&self, n: usize) -> Vec<String> {
        let inner = self.inner.lock().expect("ring buffer lock poisoned");
        if n == 0 || inner.count == 0 {
            return Vec::new();
        }

        let n = n.min(inner.count);
        let capacity = inner.lines.len();
        let start = (inner.next + capacity - n) % capacity;

        (0..n)
            .map(|i| inner.lines[(start + i) % capacity].clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_returns_lines_in_insertion_order() {
        let buf = RingBuffer::new(4);
        for i in 1..=3 {
            buf.append(format!("line-{i}"));
        }

        assert_eq!(buf.tail(2), vec!["line-2", "line-3"]);
        assert_eq!(buf.tail(10), vec!["line-1", "line-2", "line-3"]);
    }

    #[test]
    fn oldest_lines_are_evicted_at_capacity() {
        let buf = RingBuffer::new(3);
        for i in 1..=5 {
            buf.append(format!("line-{i}"));
        }

        assert_eq!(buf.tail(3), vec!["line-3", "line-4", "line-5"]);
    }

    #[test]
    fn tail_zero_is_empty() {
        let buf = RingBuffer::new(3);
        buf.append("line".to_string());
        assert!(buf.tail(0).is_empty());
    }

    #[test]
    fn empty_buffer_tails_empty() {
        let buf = RingBuffer::new(3);
        assert!(buf.tail(5).is_empty());
    }

    #[test]
    fn zero_capacity_falls_back_to_default() {
        let buf = RingBuffer::new(0);
        for i in 0..250 {
            buf.append(format!("line-{i}"));
        }
        assert_eq!(buf.tail(1000).len(), 200);
        assert_eq!(buf.tail(1)[0], "line-249");
    }
}
