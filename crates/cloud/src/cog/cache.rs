//! LRU cache of decoded chunks.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Decoded samples of one strip or tile, keyed by chunk index.
pub struct ChunkCache {
    inner: LruCache<usize, Arc<Vec<f64>>>,
}

impl ChunkCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: LruCache::new(capacity),
        }
    }

    pub fn get(&mut self, index: usize) -> Option<Arc<Vec<f64>>> {
        self.inner.get(&index).cloned()
    }

    pub fn insert(&mut self, index: usize, samples: Arc<Vec<f64>>) {
        self.inner.put(index, samples);
    }

}
