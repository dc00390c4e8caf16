//! Size-keyed buffer pools.
//!
//! Frames within one command share a handful of distinct buffer lengths
//! (light frames, binned frames, background grids), so recycling by exact
//! length amortizes allocation across batches. Buffers come back
//! uninitialized from the caller's point of view: `acquire` fills nothing.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Pool of constant-sized buffers of a single element type, keyed by length.
///
/// The lock guards only the free-list map; acquire/release hold it briefly.
/// Callers must not retain references into a buffer after releasing it.
#[derive(Debug, Default)]
pub struct SizedPool<T> {
    lists: RwLock<HashMap<usize, Vec<Vec<T>>>>,
}

impl<T: Default + Clone> SizedPool<T> {
    pub fn new() -> Self {
        Self {
            lists: RwLock::new(HashMap::new()),
        }
    }

    /// Get a buffer of exactly `len` elements. Contents are unspecified.
    pub fn acquire(&self, len: usize) -> Vec<T> {
        {
            let mut lists = self.lists.write();
            if let Some(free) = lists.get_mut(&len)
                && let Some(buf) = free.pop()
            {
                debug_assert_eq!(buf.len(), len);
                return buf;
            }
        }
        vec![T::default(); len]
    }

    /// Return a buffer to the free-list keyed by its current length.
    pub fn release(&self, buf: Vec<T>) {
        if buf.is_empty() {
            return;
        }
        let mut lists = self.lists.write();
        lists.entry(buf.len()).or_default().push(buf);
    }

    /// Drop all pooled buffers, returning memory to the allocator.
    pub fn clear(&self) {
        self.lists.write().clear();
    }

    /// Number of buffers currently parked in the pool.
    pub fn pooled_count(&self) -> usize {
        self.lists.read().values().map(Vec::len).sum()
    }
}

/// The pools a pipeline run carries: pixel data and index scratch.
///
/// Passed explicitly through the pipeline rather than living in a global,
/// so tests can run side by side with independent pools.
#[derive(Debug, Default)]
pub struct BufferPool {
    pub f32s: SizedPool<f32>,
    pub i32s: SizedPool<i32>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            f32s: SizedPool::new(),
            i32s: SizedPool::new(),
        }
    }

    /// Release everything in both pools.
    pub fn clear(&self) {
        self.f32s.clear();
        self.i32s.clear();
    }
}
