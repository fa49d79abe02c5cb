//! Look-aside pool of fixed-size payload blocks

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::chunking::ITEM_BLOCK_LENGTH;

/// A pool of reusable byte blocks shared by every connection of a store.
///
/// Only blocks whose capacity covers the common block size are kept; odd-sized
/// tail blocks are dropped on release.
#[derive(Clone)]
pub struct BlockPool {
    inner: Arc<Inner>,
}

struct Inner {
    blocks: Mutex<Vec<Vec<u8>>>,
    // Approximate count readable without the lock
    len: AtomicUsize,
    max_capacity: usize,
    block_size: usize,
}

impl BlockPool {
    /// Create a new block pool
    ///
    /// # Arguments
    /// * `max_capacity` - Maximum number of blocks kept for reuse
    /// * `block_size` - Capacity of newly allocated blocks
    pub fn new(max_capacity: usize, block_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                blocks: Mutex::new(Vec::with_capacity(max_capacity.min(1024))),
                len: AtomicUsize::new(0),
                max_capacity,
                block_size,
            }),
        }
    }

    /// Take an empty block from the pool, or allocate one if the pool is empty
    pub fn acquire(&self) -> Vec<u8> {
        let block = {
            let mut blocks = self.lock();
            let block = blocks.pop();
            self.inner.len.store(blocks.len(), Ordering::Relaxed);
            block
        };
        block.unwrap_or_else(|| Vec::with_capacity(self.inner.block_size))
    }

    /// Return a block for reuse
    pub fn release(&self, mut block: Vec<u8>) {
        if block.capacity() < self.inner.block_size {
            return;
        }
        block.clear();

        let mut blocks = self.lock();
        if blocks.len() < self.inner.max_capacity {
            blocks.push(block);
        }
        self.inner.len.store(blocks.len(), Ordering::Relaxed);
    }

    /// Number of blocks currently pooled
    pub fn len(&self) -> usize {
        self.inner.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    /// Drop every pooled block
    pub fn clear(&self) {
        let mut blocks = self.lock();
        if !blocks.is_empty() {
            tracing::debug!("Dropping {} pooled payload blocks", blocks.len());
        }
        blocks.clear();
        blocks.shrink_to_fit();
        self.inner.len.store(0, Ordering::Relaxed);
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        // A panic while holding the lock cannot leave the Vec half-updated
        self.inner
            .blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for BlockPool {
    fn default() -> Self {
        Self::new(1024, ITEM_BLOCK_LENGTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_pool_acquire_and_release() {
        let pool = BlockPool::new(10, 1024);

        let block = pool.acquire();
        assert!(block.capacity() >= 1024);
        assert!(block.is_empty());
        assert_eq!(pool.len(), 0);

        pool.release(block);
        assert_eq!(pool.len(), 1);

        let block = pool.acquire();
        assert!(block.capacity() >= 1024);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_block_pool_max_capacity() {
        let pool = BlockPool::new(3, 1024);

        for _ in 0..5 {
            pool.release(Vec::with_capacity(1024));
        }

        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_block_pool_drops_undersized_blocks() {
        let pool = BlockPool::new(10, 1024);
        pool.release(Vec::with_capacity(16));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_block_pool_clears_contents() {
        let pool = BlockPool::new(10, 1024);

        let mut block = pool.acquire();
        block.extend_from_slice(b"stale bytes");
        pool.release(block);

        let block = pool.acquire();
        assert!(block.is_empty());
    }

    #[test]
    fn test_block_pool_default_uses_item_block_length() {
        let pool = BlockPool::default();
        assert_eq!(pool.block_size(), ITEM_BLOCK_LENGTH);
        assert_eq!(pool.inner.max_capacity, 1024);
    }

    #[test]
    fn test_block_pool_clear() {
        let pool = BlockPool::new(10, 1024);
        pool.release(Vec::with_capacity(1024));
        pool.release(Vec::with_capacity(1024));
        assert_eq!(pool.len(), 2);

        pool.clear();
        assert!(pool.is_empty());
    }

    #[test]
    fn test_block_pool_concurrent_access() {
        use std::thread;

        let pool = BlockPool::new(10, 1024);
        let mut handles = vec![];

        for _ in 0..5 {
            let pool_clone = pool.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..10 {
                    let block = pool_clone.acquire();
                    pool_clone.release(block);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.len() <= 10);
    }
}
