//! Bounded, stream-tagged log capture for child processes.
//!
//! Each child gets one ring. Push is O(1); reads take a snapshot so they
//! never block the reader tasks feeding the ring.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub stream: Stream,
    pub line: String,
}

/// Fixed-capacity circular buffer, bounded by line count and total bytes,
/// whichever trips first.
pub struct LogRing {
    inner: Mutex<RingInner>,
    max_lines: usize,
    max_bytes: usize,
}

struct RingInner {
    records: VecDeque<LogRecord>,
    bytes: usize,
}

impl LogRing {
    pub fn new(max_lines: usize, max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(RingInner {
                records: VecDeque::with_capacity(max_lines.min(1024)),
                bytes: 0,
            }),
            max_lines,
            max_bytes,
        }
    }

    pub fn push(&self, stream: Stream, line: String) {
        let record = LogRecord {
            timestamp: Utc::now(),
            stream,
            line,
        };
        let record_bytes = record.line.len();

        let mut inner = self.inner.lock();
        inner.records.push_back(record);
        inner.bytes += record_bytes;

        while inner.records.len() > self.max_lines
            || (inner.bytes > self.max_bytes && inner.records.len() > 1)
        {
            if let Some(evicted) = inner.records.pop_front() {
                inner.bytes -= evicted.line.len();
            }
        }
    }

    /// Snapshot of the last `n` records, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogRecord> {
        let inner = self.inner.lock();
        let skip = inner.records.len().saturating_sub(n);
        inner.records.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_evicts_oldest_beyond_line_cap() {
        let ring = LogRing::new(3, usize::MAX);
        for i in 0..5 {
            ring.push(Stream::Stdout, format!("line {i}"));
        }
        let tail = ring.tail(10);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].line, "line 2");
        assert_eq!(tail[2].line, "line 4");
    }

    #[test]
    fn byte_cap_evicts_before_line_cap() {
        let ring = LogRing::new(1000, 10);
        ring.push(Stream::Stderr, "aaaaa".into());
        ring.push(Stream::Stderr, "bbbbb".into());
        ring.push(Stream::Stderr, "ccccc".into());
        let tail = ring.tail(10);
        // 15 bytes exceeds the 10 byte cap, so the oldest record goes.
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].line, "bbbbb");
    }

    #[test]
    fn tail_returns_newest_records() {
        let ring = LogRing::new(100, usize::MAX);
        for i in 0..10 {
            ring.push(Stream::Stdout, format!("{i}"));
        }
        let tail = ring.tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].line, "8");
        assert_eq!(tail[1].line, "9");
    }

    #[test]
    fn oversize_single_record_is_kept() {
        let ring = LogRing::new(10, 4);
        ring.push(Stream::Stdout, "oversized line".into());
        assert_eq!(ring.len(), 1);
    }
}
