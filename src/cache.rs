//! Caches owned by a fetcher instance
//!
//! [`BlockCache`] keeps decoded source blocks under a byte budget, [`HeaderCache`]
//! keeps opened COGs so repeated tiles of one scene skip the IFD walk. Both lock a
//! plain mutex for the map operation only; no guard is ever held across `.await`.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lru::LruCache;

use crate::cog_reader::CogReader;

/// Lower bound on the block cache budget
const MIN_BLOCK_CACHE_BYTES: usize = 16 * 1024 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Entries stay consistent even if a holder panicked
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct BlockKey {
    uri: Arc<str>,
    level: usize,
    index: usize,
}

impl BlockKey {
    #[must_use]
    pub fn new(uri: &str, level: usize, index: usize) -> Self {
        Self { uri: Arc::from(uri), level, index }
    }
}

struct BlockEntry {
    data: Arc<Vec<f32>>,
    size_bytes: usize,
}

struct BlockLru {
    current_bytes: usize,
    capacity_bytes: usize,
    entries: LruCache<BlockKey, BlockEntry>,
}

impl BlockLru {
    fn insert(&mut self, key: BlockKey, data: Arc<Vec<f32>>) {
        let size_bytes = data.len() * std::mem::size_of::<f32>();
        if size_bytes > self.capacity_bytes {
            return;
        }

        if let Some(old) = self.entries.pop(&key) {
            self.current_bytes = self.current_bytes.saturating_sub(old.size_bytes);
        }

        while self.current_bytes + size_bytes > self.capacity_bytes {
            match self.entries.pop_lru() {
                Some((_, evicted)) => {
                    self.current_bytes = self.current_bytes.saturating_sub(evicted.size_bytes);
                }
                None => break,
            }
        }

        self.current_bytes += size_bytes;
        self.entries.put(key, BlockEntry { data, size_bytes });
    }
}

/// Byte-bounded LRU of decoded blocks
pub struct BlockCache {
    inner: Mutex<BlockLru>,
}

impl BlockCache {
    #[must_use]
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(BlockLru {
                current_bytes: 0,
                capacity_bytes: capacity_bytes.max(MIN_BLOCK_CACHE_BYTES),
                entries: LruCache::unbounded(),
            }),
        }
    }

    #[must_use]
    pub fn get(&self, key: &BlockKey) -> Option<Arc<Vec<f32>>> {
        lock(&self.inner).entries.get(key).map(|entry| Arc::clone(&entry.data))
    }

    pub fn insert(&self, key: BlockKey, data: Arc<Vec<f32>>) {
        lock(&self.inner).insert(key, data);
    }

    /// Bytes currently held
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        lock(&self.inner).current_bytes
    }
}

/// Opened COGs by asset URI
pub struct HeaderCache {
    inner: Mutex<LruCache<String, Arc<CogReader>>>,
}

impl HeaderCache {
    #[must_use]
    pub fn new(entries: usize) -> Self {
        let capacity = NonZeroUsize::new(entries).unwrap_or(NonZeroUsize::MIN);
        Self { inner: Mutex::new(LruCache::new(capacity)) }
    }

    #[must_use]
    pub fn get(&self, uri: &str) -> Option<Arc<CogReader>> {
        lock(&self.inner).get(uri).cloned()
    }

    pub fn insert(&self, uri: &str, reader: Arc<CogReader>) {
        lock(&self.inner).put(uri.to_string(), reader);
    }
}
