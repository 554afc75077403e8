//! In-memory chunk list.

use std::collections::VecDeque;

use bytes::{Buf, Bytes};

/// An ordered sequence of owned byte chunks.
///
/// Chunks are appended at the tail and drained from the head, preserving
/// FIFO byte order across chunk boundaries. The head chunk can be consumed
/// partially; the unconsumed tail stays at the head for re-presentation.
#[derive(Default)]
pub(crate) struct ChunkList {
    chunks: VecDeque<Bytes>,
    len: u64,
}

impl ChunkList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Total buffered bytes across all chunks.
    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends a chunk at the tail. Empty chunks are ignored.
    pub(crate) fn push_back(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len() as u64;
        self.chunks.push_back(chunk);
    }

    /// Inserts a chunk at the head, ahead of everything buffered.
    ///
    /// Used for data read back from the spill file, which is always older
    /// than anything currently held in memory.
    pub(crate) fn push_front(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len() as u64;
        self.chunks.push_front(chunk);
    }

    /// Returns a cheap clone of the head chunk, if any.
    pub(crate) fn front(&self) -> Option<Bytes> {
        self.chunks.front().cloned()
    }

    /// Drops up to `n` bytes from the head, advancing within the head chunk.
    ///
    /// Returns the number of bytes actually dropped, which is less than `n`
    /// only when the list runs out of data.
    pub(crate) fn drop_front(&mut self, n: u64) -> u64 {
        let mut remaining = n;
        while remaining > 0 {
            let Some(head) = self.chunks.front_mut() else {
                break;
            };
            let take = remaining.min(head.len() as u64);
            if take == head.len() as u64 {
                self.chunks.pop_front();
            } else {
                head.advance(take as usize);
            }
            self.len -= take;
            remaining -= take;
        }
        n - remaining
    }

    /// Removes and returns every chunk, emptying the list.
    pub(crate) fn take_all(&mut self) -> Vec<Bytes> {
        self.len = 0;
        self.chunks.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_len() {
        let mut list = ChunkList::new();
        assert!(list.is_empty());

        list.push_back(Bytes::from_static(b"hello"));
        list.push_back(Bytes::from_static(b"world"));
        assert_eq!(list.len(), 10);

        list.push_back(Bytes::new());
        assert_eq!(list.len(), 10);
    }

    #[test]
    fn test_drop_front_within_head() {
        let mut list = ChunkList::new();
        list.push_back(Bytes::from_static(b"hello"));

        assert_eq!(list.drop_front(3), 3);
        assert_eq!(list.len(), 2);
        assert_eq!(list.front().unwrap().as_ref(), b"lo");
    }

    #[test]
    fn test_drop_front_across_chunks() {
        let mut list = ChunkList::new();
        list.push_back(Bytes::from_static(b"ab"));
        list.push_back(Bytes::from_static(b"cdef"));

        assert_eq!(list.drop_front(3), 3);
        assert_eq!(list.len(), 3);
        assert_eq!(list.front().unwrap().as_ref(), b"def");
    }

    #[test]
    fn test_drop_front_past_end() {
        let mut list = ChunkList::new();
        list.push_back(Bytes::from_static(b"abc"));

        assert_eq!(list.drop_front(10), 3);
        assert!(list.is_empty());
        assert!(list.front().is_none());
    }

    #[test]
    fn test_push_front_orders_ahead() {
        let mut list = ChunkList::new();
        list.push_back(Bytes::from_static(b"newer"));
        list.push_front(Bytes::from_static(b"older"));

        assert_eq!(list.front().unwrap().as_ref(), b"older");
        assert_eq!(list.len(), 10);
    }

    #[test]
    fn test_take_all() {
        let mut list = ChunkList::new();
        list.push_back(Bytes::from_static(b"ab"));
        list.push_back(Bytes::from_static(b"cd"));

        let all = list.take_all();
        assert_eq!(all.len(), 2);
        assert!(list.is_empty());
    }
}
