//! Cache bookkeeping
//!
//! Byte-accounted LRU state, manipulated only under the engine mutex.
//! The list holds weak back-references keyed by a monotone clock; the
//! chunk map stays the sole owner of every chunk, and "evicting" a chunk
//! only drops its data buffer. Chunks with a non-zero pin depth are
//! never on the list.

use crate::chunkmap::PersistentChunk;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// LRU and byte accounting for the chunk cache.
pub struct ChunkCache {
    /// Bytes of resident, accounted chunk data.
    pub used: u64,
    /// Byte budget.
    pub size: u64,
    /// True while some thread waits on the overflow condvar.
    pub overflow_flag: bool,
    clock: u64,
    lru: BTreeMap<u64, Weak<PersistentChunk>>,
}

impl ChunkCache {
    /// Cache with the given byte budget.
    pub fn new(size: u64) -> Self {
        ChunkCache {
            used: 0,
            size,
            overflow_flag: false,
            clock: 1,
            lru: BTreeMap::new(),
        }
    }

    /// Advance the access clock.
    pub fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Current clock value.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Link an unpinned chunk at the warm end of the list.
    pub fn link(&mut self, chunk: &Arc<PersistentChunk>) {
        debug_assert_eq!(chunk.access_count(), 0);
        debug_assert_eq!(chunk.lru_key(), 0);
        let key = self.tick();
        chunk.set_lru_key(key);
        chunk.set_timestamp(key);
        self.lru.insert(key, Arc::downgrade(chunk));
    }

    /// Remove a chunk from the list, if linked.
    pub fn unlink(&mut self, chunk: &PersistentChunk) {
        let key = chunk.lru_key();
        if key != 0 {
            self.lru.remove(&key);
            chunk.set_lru_key(0);
        }
    }

    /// Pop the coldest linked chunk. Dead weak entries (chunks whose map
    /// entry vanished) are discarded on the way.
    pub fn pop_coldest(&mut self) -> Option<Arc<PersistentChunk>> {
        while let Some((_, weak)) = self.lru.pop_first() {
            if let Some(chunk) = weak.upgrade() {
                chunk.set_lru_key(0);
                return Some(chunk);
            }
        }
        None
    }

    /// True when nothing is evictable.
    pub fn lru_is_empty(&self) -> bool {
        self.lru.is_empty()
    }

    /// Number of linked chunks.
    pub fn lru_len(&self) -> usize {
        self.lru.len()
    }
}
