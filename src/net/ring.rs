//! Chunked byte queue backing a connection's send and receive buffers.

use std::collections::VecDeque;

/// One pushed chunk plus a cursor marking how much of its head has been
/// consumed.
#[derive(Debug, Clone)]
struct Chunk {
    data: Vec<u8>,
    off: usize,
}

impl Chunk {
    fn remaining(&self) -> usize {
        self.data.len() - self.off
    }

    fn unread(&self) -> &[u8] {
        &self.data[self.off..]
    }
}

/// An append/consume byte queue built from a sequence of owned chunks.
///
/// `push` takes ownership of a whole chunk in O(1); `pop` removes an
/// arbitrary-length prefix, copying only at the moment of consumption.
/// Partially consumed chunks stay in place with an advanced cursor, so
/// arbitrary chunk boundaries cost nothing until the bytes are actually
/// taken out.
///
/// Cloning duplicates all chunk data and cursors; [`take`](Self::take)
/// transfers ownership and leaves the source empty (this is what
/// [`Conn::move_send_buffer`](crate::net::Conn::move_send_buffer) relies on).
#[derive(Debug, Clone, Default)]
pub struct ByteRing {
    chunks: VecDeque<Chunk>,
    size: usize,
}

impl ByteRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an owned chunk to the back of the ring.
    pub fn push(&mut self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        self.size += data.len();
        self.chunks.push_back(Chunk { data, off: 0 });
    }

    /// Removes and returns up to `len` bytes from the front, in order, as one
    /// contiguous buffer. Returns fewer bytes (possibly none) if fewer are
    /// available; never an error.
    pub fn pop(&mut self, len: usize) -> Vec<u8> {
        let take = len.min(self.size);
        let mut out = Vec::with_capacity(take);
        while out.len() < take {
            let Some(chunk) = self.chunks.front_mut() else {
                break;
            };
            let copy_len = chunk.remaining().min(take - out.len());
            out.extend_from_slice(&chunk.unread()[..copy_len]);
            chunk.off += copy_len;
            if chunk.remaining() == 0 {
                self.chunks.pop_front();
            }
        }
        self.size -= out.len();
        out
    }

    /// Unread remainder of the front chunk, without consuming it. Used by the
    /// socket write path to drain without an intermediate copy.
    pub fn front(&self) -> Option<&[u8]> {
        self.chunks.front().map(Chunk::unread)
    }

    /// Advances the front cursor by `n` bytes (which must have been observed
    /// via [`front`](Self::front)), evicting exhausted chunks.
    pub fn advance(&mut self, mut n: usize) {
        debug_assert!(n <= self.size);
        self.size -= n;
        while n > 0 {
            let Some(chunk) = self.chunks.front_mut() else {
                break;
            };
            let step = chunk.remaining().min(n);
            chunk.off += step;
            n -= step;
            if chunk.remaining() == 0 {
                self.chunks.pop_front();
            }
        }
    }

    /// Current unread byte count; maintained incrementally, O(1).
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Drops all chunks and resets the size to zero.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.size = 0;
    }

    /// Moves the entire contents out, leaving `self` empty.
    pub fn take(&mut self) -> ByteRing {
        std::mem::take(self)
    }
}
