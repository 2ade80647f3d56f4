//! Reusable byte buffers shared by the verifier and extractor.
//!
//! Hashing and extraction churn through fixed-size scratch buffers; the pool
//! hands them out behind a guard that returns the allocation on drop, so
//! every exit path, including errors, recycles.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Maximum buffers retained per pool; extras are dropped on return.
const MAX_POOLED: usize = 8;

#[derive(Clone)]
pub struct BufferPool {
    buffer_size: usize,
    free: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            free: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take a zero-initialised buffer of the pool's size.
    pub fn acquire(&self) -> PooledBuffer {
        let buffer = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size]);
        PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(&self.free),
        }
    }

    #[cfg(test)]
    fn pooled_count(&self) -> usize {
        self.free.lock().len()
    }
}

/// A buffer on loan from a [`BufferPool`]; returned on drop.
pub struct PooledBuffer {
    buffer: Option<Vec<u8>>,
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            let mut free = self.pool.lock();
            if free.len() < MAX_POOLED {
                free.push(buffer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_returns_sized_buffer() {
        let pool = BufferPool::new(1024);
        let buf = pool.acquire();
        assert_eq!(buf.len(), 1024);
    }

    #[test]
    fn test_buffer_recycled_on_drop() {
        let pool = BufferPool::new(64);
        assert_eq!(pool.pooled_count(), 0);
        {
            let _a = pool.acquire();
            let _b = pool.acquire();
        }
        assert_eq!(pool.pooled_count(), 2);
        {
            let _c = pool.acquire();
            assert_eq!(pool.pooled_count(), 1);
        }
        assert_eq!(pool.pooled_count(), 2);
    }

    #[test]
    fn test_pool_bounded() {
        let pool = BufferPool::new(16);
        let held: Vec<_> = (0..MAX_POOLED + 4).map(|_| pool.acquire()).collect();
        drop(held);
        assert_eq!(pool.pooled_count(), MAX_POOLED);
    }
}
