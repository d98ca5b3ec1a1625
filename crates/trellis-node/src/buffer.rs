//! Pooled byte buffers backing every received packet.
//!
//! Buffers are handed out by a [`BufferCache`] pooled by size class and
//! return their storage on last drop. Packet buffers are shared between
//! the receiver, the dispatcher and handlers through `Arc<Buffer>`;
//! commands never reference other commands, so cycles are impossible.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, Weak};

/// Smallest size class handed out.
const MIN_CLASS: usize = 256;

/// Free-list cap per size class.
const MAX_POOLED: usize = 64;

#[derive(Clone)]
pub struct BufferCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    pools: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
}

impl BufferCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CacheInner { pools: Mutex::new(HashMap::new()) }),
        }
    }

    /// Hand out a buffer with capacity >= `min_size` and length exactly
    /// `min_size`, refcount 1.
    pub fn alloc(&self, min_size: usize) -> Buffer {
        let class = size_class(min_size);
        let mut storage = {
            let mut pools = self.inner.pools.lock().unwrap();
            pools.get_mut(&class).and_then(Vec::pop).unwrap_or_default()
        };
        storage.clear();
        storage.reserve(class);
        storage.resize(min_size, 0);
        Buffer {
            data: storage,
            cache: Arc::downgrade(&self.inner),
        }
    }

    /// Drop all pooled storage.
    pub fn flush(&self) {
        self.inner.pools.lock().unwrap().clear();
    }

    /// Number of buffers currently pooled (for tests and diagnostics).
    pub fn pooled(&self) -> usize {
        self.inner.pools.lock().unwrap().values().map(Vec::len).sum()
    }
}

impl Default for BufferCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheInner {
    fn recycle(&self, storage: Vec<u8>) {
        let class = storage.capacity();
        let mut pools = self.pools.lock().unwrap();
        let pool = pools.entry(class).or_default();
        if pool.len() < MAX_POOLED {
            pool.push(storage);
        }
    }
}

fn size_class(min_size: usize) -> usize {
    min_size.next_power_of_two().max(MIN_CLASS)
}

/// An owned byte region; storage returns to its cache on drop.
pub struct Buffer {
    data: Vec<u8>,
    cache: Weak<CacheInner>,
}

impl Buffer {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Deref for Buffer {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.upgrade() {
            cache.recycle(std::mem::take(&mut self.data));
        }
    }
}

/// A buffer shared between receiver, dispatcher and handlers.
pub type SharedBuffer = Arc<Buffer>;

/// Refcount-1 check: true while no clone of the handle is outstanding.
/// Debugging invariant only.
pub fn is_free(buffer: &SharedBuffer) -> bool {
    Arc::strong_count(buffer) == 1
}
