//! Bounded scrollback buffer: ordered byte chunks with a running
//! total, oldest-chunk eviction once the cap is exceeded.

use std::collections::VecDeque;

/// Default scrollback cap per session: 1 MiB.
pub const DEFAULT_MAX_BYTES: usize = 1024 * 1024;

/// Ordered list of byte chunks with a byte-count total. Not thread-safe
/// by itself — callers serialize access the way the owning session does
/// (one writer: the PTY reader thread; reads happen on attach/replay).
pub struct RingBuffer {
    chunks: VecDeque<Vec<u8>>,
    total: usize,
    max_bytes: usize,
}

impl RingBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total: 0,
            max_bytes,
        }
    }

    /// Append a chunk. While the running total exceeds `max_bytes` and
    /// more than one chunk remains, drop the head chunk. A single chunk
    /// larger than `max_bytes` is kept whole (the buffer never empties
    /// while the producer is active).
    pub fn push(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.chunks.push_back(bytes.to_vec());
        self.total += bytes.len();
        while self.total > self.max_bytes && self.chunks.len() > 1 {
            if let Some(front) = self.chunks.pop_front() {
                self.total -= front.len();
            }
        }
    }

    /// Concatenation of remaining chunks in order.
    pub fn get_all(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total = 0;
    }

    pub fn size(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn under_cap_preserves_order() {
        let mut rb = RingBuffer::new(1024);
        rb.push(b"hello ");
        rb.push(b"world");
        assert_eq!(rb.get_all(), b"hello world");
        assert_eq!(rb.size(), 11);
    }

    #[test]
    fn over_cap_evicts_whole_chunks_and_keeps_suffix() {
        let mut rb = RingBuffer::new(10);
        rb.push(b"0123456789"); // exactly at cap
        rb.push(b"abcde"); // pushes total to 15, evicts first chunk (10 bytes)
        assert!(rb.size() <= 10 || rb.chunks.len() == 1);
        let all = rb.get_all();
        assert!(b"0123456789abcde".ends_with(&all[..]));
    }

    #[test]
    fn single_oversized_push_is_kept_whole() {
        let mut rb = RingBuffer::new(4);
        let big = vec![b'x'; 100];
        rb.push(&big);
        assert_eq!(rb.size(), 100);
        assert_eq!(rb.get_all(), big);
    }

    #[test]
    fn never_drops_sole_remaining_chunk() {
        let mut rb = RingBuffer::new(4);
        rb.push(b"aaaaaaaaaa"); // 10 bytes, only chunk, over cap but kept
        assert!(!rb.is_empty());
        rb.push(b"b"); // now two chunks, total 11 > 4, evicts the 10-byte head
        assert_eq!(rb.get_all(), b"b");
    }

    #[test]
    fn clear_empties_buffer() {
        let mut rb = RingBuffer::new(1024);
        rb.push(b"data");
        rb.clear();
        assert!(rb.is_empty());
        assert_eq!(rb.get_all(), Vec::<u8>::new());
    }
}
