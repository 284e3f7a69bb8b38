//! Bounded per-server log buffers.
//!
//! Subprocess stderr is captured line by line. Each server keeps only the
//! newest [`LOG_BUFFER_CAPACITY`] lines; older lines are evicted first.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Maximum lines retained per server.
pub const LOG_BUFFER_CAPACITY: usize = 500;

/// Ring of recent log lines for one server.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_capacity(LOG_BUFFER_CAPACITY)
    }
}

impl LogBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// Append a line, evicting the oldest when full.
    pub fn push(&mut self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        while self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    /// Oldest-first copy of the retained lines.
    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// The newest `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Shared map of server id to log buffer.
///
/// Cloning shares the same buffers. Buffers outlive connections so the last
/// output of a crashed server stays readable.
#[derive(Debug, Clone, Default)]
pub struct LogStore {
    buffers: Arc<Mutex<HashMap<String, LogBuffer>>>,
}

impl LogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one chunk of output. Multi-line chunks are split into lines.
    pub fn append(&self, server_id: &str, chunk: &str) {
        let mut buffers = self.lock();
        let buffer = buffers.entry(server_id.to_string()).or_default();
        for line in chunk.lines() {
            buffer.push(line);
        }
    }

    /// Copy of the buffered lines for a server; empty if none.
    pub fn lines(&self, server_id: &str) -> Vec<String> {
        self.lock()
            .get(server_id)
            .map(LogBuffer::lines)
            .unwrap_or_default()
    }

    /// The newest `n` lines for a server.
    pub fn tail(&self, server_id: &str, n: usize) -> Vec<String> {
        self.lock()
            .get(server_id)
            .map(|b| b.tail(n))
            .unwrap_or_default()
    }

    /// Drop a server's buffer.
    pub fn clear(&self, server_id: &str) {
        self.lock().remove(server_id);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, LogBuffer>> {
        self.buffers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_evicts_oldest() {
        let mut buf = LogBuffer::with_capacity(3);
        for i in 0..5 {
            buf.push(format!("line {i}"));
        }
        assert_eq!(buf.lines(), vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_default_capacity_is_bounded() {
        let mut buf = LogBuffer::default();
        for i in 0..(LOG_BUFFER_CAPACITY + 25) {
            buf.push(i.to_string());
        }
        assert_eq!(buf.len(), LOG_BUFFER_CAPACITY);
        assert_eq!(buf.lines()[0], "25");
    }

    #[test]
    fn test_tail() {
        let mut buf = LogBuffer::with_capacity(10);
        for s in ["a", "b", "c"] {
            buf.push(s);
        }
        assert_eq!(buf.tail(2), vec!["b", "c"]);
        assert_eq!(buf.tail(10), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_store_splits_chunks_and_isolates_servers() {
        let store = LogStore::new();
        store.append("fs", "first\nsecond\n");
        store.append("git", "other");
        assert_eq!(store.lines("fs"), vec!["first", "second"]);
        assert_eq!(store.lines("git"), vec!["other"]);
        assert!(store.lines("missing").is_empty());
    }

    #[test]
    fn test_store_clones_share_buffers() {
        let store = LogStore::new();
        let clone = store.clone();
        clone.append("fs", "hello");
        assert_eq!(store.lines("fs"), vec!["hello"]);
        store.clear("fs");
        assert!(clone.lines("fs").is_empty());
    }
}
