use std::cell::UnsafeCell;
use std::sync::Arc;
use std::{fmt, ops, slice};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// A fixed arena of equally sized blocks, backing the transient buffers that
/// read operations attach to their completions when the caller did not supply
/// one. The arena is allocated once at construction and never grows.
///
/// Allocation hands out the first contiguous run of free blocks covering the
/// requested length; exhaustion is reported as [`Error::NoMem`] and leaves the
/// pool untouched.
#[derive(Clone)]
pub struct Mempool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    arena: Box<[UnsafeCell<u8>]>,
    block_size: usize,
    // one flag per block; runs are found with a first-fit scan. the pool is
    // small and allocation happens on the dispatch path only, so a scan under
    // a short critical section beats a fancier structure here.
    used: Mutex<Box<[bool]>>,
}

unsafe impl Send for PoolInner {}
unsafe impl Sync for PoolInner {}

impl Mempool {
    /// Create a pool of `block_count` blocks of `block_size` bytes each.
    ///
    /// # Panics
    /// Panics if either dimension is zero.
    pub fn new(block_count: usize, block_size: usize) -> Self {
        assert!(block_count > 0, "mempool needs at least one block");
        assert!(block_size > 0, "mempool blocks cannot be empty");

        let mut arena = Vec::with_capacity(block_count * block_size);
        arena.resize_with(block_count * block_size, || UnsafeCell::new(0));

        Self {
            inner: Arc::new(PoolInner {
                arena: arena.into_boxed_slice(),
                block_size,
                used: Mutex::new(vec![false; block_count].into_boxed_slice()),
            }),
        }
    }

    /// Allocate a buffer of at least `len` bytes, rounded up to whole
    /// blocks. A zero-length request succeeds without claiming any block.
    pub fn alloc(&self, len: usize) -> Result<PoolBuf> {
        if len == 0 {
            return Ok(PoolBuf {
                pool: Arc::clone(&self.inner),
                first: 0,
                blocks: 0,
                len: 0,
            });
        }
        let blocks = (len + self.inner.block_size - 1) / self.inner.block_size;

        let mut used = self.inner.used.lock();
        let total = used.len();
        if blocks > total {
            return Err(Error::NoMem);
        }

        let mut run_start = 0;
        let mut run_len = 0;
        for i in 0..total {
            if used[i] {
                run_start = i + 1;
                run_len = 0;
                continue;
            }
            run_len += 1;
            if run_len == blocks {
                for flag in used[run_start..=i].iter_mut() {
                    *flag = true;
                }
                log::trace!(
                    "mempool: allocated {} block(s) at {} for {} byte(s)",
                    blocks,
                    run_start,
                    len
                );
                return Ok(PoolBuf {
                    pool: Arc::clone(&self.inner),
                    first: run_start,
                    blocks,
                    len,
                });
            }
        }
        log::debug!("mempool: no run of {} free block(s)", blocks);
        Err(Error::NoMem)
    }

    /// Number of currently free blocks.
    pub fn free_blocks(&self) -> usize {
        self.inner.used.lock().iter().filter(|used| !**used).count()
    }

    /// The configured block size in bytes.
    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }
}

impl fmt::Debug for Mempool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mempool")
            .field("block_size", &self.inner.block_size)
            .field("block_count", &self.inner.used.lock().len())
            .field("free_blocks", &self.free_blocks())
            .finish()
    }
}

/// A pool-backed byte buffer. Dereferences to its byte slice, and returns its
/// block run to the pool exactly once, on drop, so a leak-free release is
/// structural rather than a call-site obligation.
pub struct PoolBuf {
    pool: Arc<PoolInner>,
    first: usize,
    blocks: usize,
    len: usize,
}

unsafe impl Send for PoolBuf {}
unsafe impl Sync for PoolBuf {}

impl PoolBuf {
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Shrink the visible length, keeping the block run. Used when a device
    /// completes a read with fewer bytes than were reserved.
    pub(crate) fn set_len(&mut self, len: usize) {
        assert!(
            len <= self.blocks * self.pool.block_size,
            "cannot grow a pool buffer past its block run"
        );
        self.len = len;
    }

    fn base(&self) -> *mut u8 {
        self.pool.arena[self.first * self.pool.block_size].get()
    }
}

impl ops::Deref for PoolBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        unsafe { slice::from_raw_parts(self.base(), self.len) }
    }
}

impl ops::DerefMut for PoolBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        if self.len == 0 {
            return &mut [];
        }
        unsafe { slice::from_raw_parts_mut(self.base(), self.len) }
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        if self.blocks == 0 {
            return;
        }
        let mut used = self.pool.used.lock();
        for flag in used[self.first..self.first + self.blocks].iter_mut() {
            debug_assert!(*flag, "pool buffer block was already free");
            *flag = false;
        }
    }
}

impl fmt::Debug for PoolBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuf")
            .field("first", &self.first)
            .field("blocks", &self.blocks)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::Mempool;
    use crate::error::Error;

    #[test]
    fn alloc_and_release() {
        let pool = Mempool::new(4, 16);
        assert_eq!(pool.free_blocks(), 4);

        let mut buf = pool.alloc(20).unwrap();
        assert_eq!(buf.len(), 20);
        assert_eq!(pool.free_blocks(), 2);
        buf[..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);

        drop(buf);
        assert_eq!(pool.free_blocks(), 4);
    }

    #[test]
    fn exhaustion_is_clean() {
        let pool = Mempool::new(2, 8);
        let a = pool.alloc(8).unwrap();
        let b = pool.alloc(8).unwrap();
        assert_eq!(pool.alloc(1).unwrap_err(), Error::NoMem);

        // failure must not have corrupted the bookkeeping
        drop(a);
        let c = pool.alloc(8).unwrap();
        drop(b);
        drop(c);
        assert_eq!(pool.free_blocks(), 2);
    }

    #[test]
    fn contiguous_run_required() {
        let pool = Mempool::new(4, 8);
        let a = pool.alloc(8).unwrap();
        let b = pool.alloc(8).unwrap();
        let c = pool.alloc(8).unwrap();
        drop(b);
        // two blocks are free but not adjacent
        let _d = pool.alloc(8).unwrap();
        assert_eq!(pool.alloc(16).unwrap_err(), Error::NoMem);
        drop(a);
        drop(c);
    }

    #[test]
    fn zero_len_claims_nothing() {
        let pool = Mempool::new(1, 8);
        let buf = pool.alloc(0).unwrap();
        assert!(buf.is_empty());
        assert_eq!(pool.free_blocks(), 1);
        let _whole = pool.alloc(8).unwrap();
    }
}
