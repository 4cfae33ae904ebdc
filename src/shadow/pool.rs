//! Reusable byte buffers for request tees and captured response bodies.
//!
//! # Responsibilities
//! - Hand out cleared buffers to a single request at a time
//! - Take buffers back when the borrowing request is finished with them
//!
//! # Design Decisions
//! - Return happens in `Drop`, so every exit path (error, timeout, panic) gives the buffer back
//! - Oversized buffers are dropped instead of retained to keep idle memory bounded
//! - Pool size is capped; surplus buffers are simply freed

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::BytesMut;

/// Initial capacity of a freshly allocated buffer.
const INITIAL_CAPACITY: usize = 4 * 1024;

/// Buffers that grew beyond this are not retained.
const MAX_RETAINED_CAPACITY: usize = 1024 * 1024;

/// Maximum number of idle buffers kept.
const MAX_IDLE: usize = 256;

/// A pool of byte buffers shared across concurrent requests.
#[derive(Debug, Clone, Default)]
pub struct BufferPool {
    idle: Arc<Mutex<Vec<BytesMut>>>,
}

impl BufferPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow a buffer. It is always empty when handed out.
    pub fn get(&self) -> PooledBuf {
        let buf = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(INITIAL_CAPACITY));

        PooledBuf {
            buf: Some(buf),
            pool: self.clone(),
        }
    }

    /// Number of idle buffers currently held.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn put(&self, mut buf: BytesMut) {
        if buf.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        buf.clear();

        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE {
            idle.push(buf);
        }
    }
}

/// A buffer borrowed from a [`BufferPool`], returned on drop.
#[derive(Debug)]
pub struct PooledBuf {
    buf: Option<BytesMut>,
    pool: BufferPool,
}

impl Deref for PooledBuf {
    type Target = BytesMut;

    fn deref(&self) -> &Self::Target {
        // Only taken in Drop.
        self.buf.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}
