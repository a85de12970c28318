use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, OnceLock};

use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;

use crate::constants::{
    BLOCK_SIZE, LARGE_BUFFER_COUNT, SMALL_BUFFER_COUNT, SMALL_BUFFER_SIZE,
};

static SHARED: OnceLock<Arc<BufferPool>> = OnceLock::new();

/// A pool of reusable byte buffers.
///
/// Buffers are handed out as [`PooledBuffer`]s which go back to the pool when
/// dropped, so every exit path of a caller returns what it rented. Rent and
/// return are lock-free and safe from any number of sessions at once.
pub struct BufferPool {
    small: ArrayQueue<BytesMut>,
    large: ArrayQueue<BytesMut>,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            small: ArrayQueue::new(SMALL_BUFFER_COUNT),
            large: ArrayQueue::new(LARGE_BUFFER_COUNT),
        })
    }

    /// The process-wide pool.
    pub fn shared() -> Arc<Self> {
        SHARED.get_or_init(Self::new).clone()
    }

    /// Rents a zero-filled buffer of exactly `len` bytes.
    pub fn rent(self: &Arc<Self>, len: usize) -> PooledBuffer {
        let queue = self.queue_for(len);
        let mut buf = queue.pop().unwrap_or_else(|| {
            let capacity = if len <= SMALL_BUFFER_SIZE {
                SMALL_BUFFER_SIZE
            } else {
                len.max(BLOCK_SIZE)
            };
            BytesMut::with_capacity(capacity)
        });
        buf.clear();
        buf.resize(len, 0);

        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    /// Rents a buffer holding a copy of `data`.
    pub fn rent_copy(self: &Arc<Self>, data: &[u8]) -> PooledBuffer {
        let mut buf = self.rent(data.len());
        buf.copy_from_slice(data);
        buf
    }

    fn queue_for(&self, len: usize) -> &ArrayQueue<BytesMut> {
        if len <= SMALL_BUFFER_SIZE {
            &self.small
        } else {
            &self.large
        }
    }

    fn give_back(&self, mut buf: BytesMut) {
        buf.clear();
        let queue = if buf.capacity() <= SMALL_BUFFER_SIZE {
            &self.small
        } else {
            &self.large
        };
        // A full pool simply lets the buffer drop.
        let _ = queue.push(buf);
    }

    /// Buffers currently parked in the pool.
    pub fn available(&self) -> usize {
        self.small.len() + self.large.len()
    }
}

/// A buffer on loan from a [`BufferPool`].
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Shortens the visible length, keeping the allocation.
    pub fn truncate(&mut self, len: usize) {
        if let Some(buf) = self.buf.as_mut() {
            buf.truncate(len);
        }
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer").field("len", &self.len()).finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(buf);
        }
    }
}
