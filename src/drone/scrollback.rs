use std::collections::VecDeque;

use bytes::Bytes;

use crate::protocol::ScrollbackSlice;

/// Bounded history of a process's output, kept as the chunks the pipes
/// produced.
///
/// Eviction is chunk-granular and never drops the newest chunk, so the
/// retained bytes are always a suffix of everything pushed and the total
/// stays below `max_bytes + newest_chunk_len`.
#[derive(Debug, Clone)]
pub struct ScrollbackBuffer {
    chunks: VecDeque<Bytes>,
    total: usize,
    max_bytes: usize,
}

impl ScrollbackBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total: 0,
            max_bytes,
        }
    }

    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.total += chunk.len();
        self.chunks.push_back(chunk);
        while self.total > self.max_bytes && self.chunks.len() > 1 {
            if let Some(oldest) = self.chunks.pop_front() {
                self.total -= oldest.len();
            }
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.total
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Retained output as one contiguous buffer.
    pub fn contents(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Up to `limit` chunks starting at `offset` (oldest first).
    pub fn slice(&self, offset: usize, limit: usize) -> ScrollbackSlice {
        let chunks = self
            .chunks
            .iter()
            .skip(offset)
            .take(limit)
            .map(|c| c.to_vec())
            .collect();
        ScrollbackSlice {
            total_chunks: self.chunks.len(),
            total_bytes: self.total,
            offset,
            chunks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_everything_under_the_bound() {
        let mut buf = ScrollbackBuffer::new(16);
        buf.push(Bytes::from_static(b"abc"));
        buf.push(Bytes::from_static(b"def"));
        assert_eq!(buf.contents(), b"abcdef");
        assert_eq!(buf.total_bytes(), 6);
    }

    #[test]
    fn evicts_oldest_whole_chunks() {
        let mut buf = ScrollbackBuffer::new(8);
        buf.push(Bytes::from_static(b"aaaa"));
        buf.push(Bytes::from_static(b"bbbb"));
        buf.push(Bytes::from_static(b"cc"));
        assert_eq!(buf.contents(), b"bbbbcc");
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn oversized_chunk_is_kept_alone() {
        let mut buf = ScrollbackBuffer::new(4);
        buf.push(Bytes::from_static(b"ab"));
        buf.push(Bytes::from_static(b"0123456789"));
        assert_eq!(buf.contents(), b"0123456789");
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn bound_and_suffix_hold_over_many_pushes() {
        let max = 32;
        let mut buf = ScrollbackBuffer::new(max);
        let mut history = Vec::new();
        for i in 0..200usize {
            let chunk = vec![b'a' + (i % 26) as u8; 1 + (i * 7) % 13];
            history.extend_from_slice(&chunk);
            let last_len = chunk.len();
            buf.push(Bytes::from(chunk));
            assert!(buf.total_bytes() <= max + last_len - 1 || buf.len() == 1);
            assert!(history.ends_with(&buf.contents()));
        }
    }

    #[test]
    fn slice_windows_chunks() {
        let mut buf = ScrollbackBuffer::new(100);
        for word in ["one", "two", "three", "four"] {
            buf.push(Bytes::from(word));
        }
        let slice = buf.slice(1, 2);
        assert_eq!(slice.total_chunks, 4);
        assert_eq!(slice.offset, 1);
        assert_eq!(slice.chunks, vec![b"two".to_vec(), b"three".to_vec()]);

        let past_end = buf.slice(10, 5);
        assert!(past_end.chunks.is_empty());
    }

    #[test]
    fn empty_chunks_are_ignored() {
        let mut buf = ScrollbackBuffer::new(4);
        buf.push(Bytes::new());
        assert!(buf.is_empty());
    }
}
