//! Chunk map types
//!
//! The map is two-level: `ArrayUAID -> InnerChunkMap`, and
//! `InnerChunkMap: StorageAddress -> InnerChunkMapEntry`. The address
//! ordering (attribute, coordinates, version descending) makes
//! `range(addr..)` the MVCC lookup primitive: probing with `arr_id = V`
//! lands on the newest entry at or below `V` for that coordinate.
//!
//! Ownership: the map holds the only strong handle on a
//! [`PersistentChunk`]; the cache's LRU keeps weak back-references and
//! eviction drops only the data buffer, never the handle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;
use tessera_core::{ArrayUAID, ChunkHeader, StorageAddress};

/// Per-array map from address to entry.
pub type InnerChunkMap = BTreeMap<StorageAddress, InnerChunkMapEntry>;

/// One slot of the inner map: a resident chunk or a deletion marker.
#[derive(Clone)]
pub enum InnerChunkMapEntry {
    /// Live chunk (its data may or may not be resident).
    Chunk(Arc<PersistentChunk>),
    /// Tombstone; carries only its descriptor-slot offset.
    Tombstone {
        /// Offset of the tombstone's slot in the descriptor file.
        hdr_pos: u64,
    },
}

impl InnerChunkMapEntry {
    /// The chunk, unless this is a tombstone.
    pub fn chunk(&self) -> Option<&Arc<PersistentChunk>> {
        match self {
            InnerChunkMapEntry::Chunk(c) => Some(c),
            InnerChunkMapEntry::Tombstone { .. } => None,
        }
    }

    /// True for deletion markers.
    pub fn is_tombstone(&self) -> bool {
        matches!(self, InnerChunkMapEntry::Tombstone { .. })
    }

    /// Descriptor-slot offset of the entry.
    pub fn hdr_pos(&self) -> u64 {
        match self {
            InnerChunkMapEntry::Chunk(c) => c.header().pos.hdr_pos,
            InnerChunkMapEntry::Tombstone { hdr_pos } => *hdr_pos,
        }
    }
}

/// In-memory image of one persistent chunk.
///
/// Mutable state is updated only under the engine mutex; the atomics let
/// diagnostic reads happen without it. The data buffer is shared out as
/// an `Arc` so readers keep a loaded buffer alive across eviction.
pub struct PersistentChunk {
    uaid: ArrayUAID,
    addr: StorageAddress,
    hdr: Mutex<ChunkHeader>,
    data: Mutex<Option<Arc<Vec<u8>>>>,
    access_count: AtomicU32,
    raw: AtomicBool,
    waiting: AtomicBool,
    timestamp: AtomicU64,
    lru_key: AtomicU64,
}

impl PersistentChunk {
    /// A chunk being created by the write path: born raw (no data yet)
    /// and about to be pinned by its creator.
    pub fn new_for_write(uaid: ArrayUAID, addr: StorageAddress, hdr: ChunkHeader) -> Self {
        PersistentChunk {
            uaid,
            addr,
            hdr: Mutex::new(hdr),
            data: Mutex::new(None),
            access_count: AtomicU32::new(0),
            raw: AtomicBool::new(true),
            waiting: AtomicBool::new(false),
            timestamp: AtomicU64::new(0),
            lru_key: AtomicU64::new(0),
        }
    }

    /// A chunk reconstructed from its descriptor at recovery: not raw,
    /// data loaded on first read.
    pub fn from_descriptor(uaid: ArrayUAID, addr: StorageAddress, hdr: ChunkHeader) -> Self {
        PersistentChunk {
            uaid,
            addr,
            hdr: Mutex::new(hdr),
            data: Mutex::new(None),
            access_count: AtomicU32::new(0),
            raw: AtomicBool::new(false),
            waiting: AtomicBool::new(false),
            timestamp: AtomicU64::new(0),
            lru_key: AtomicU64::new(0),
        }
    }

    /// Owning array UAID.
    pub fn uaid(&self) -> ArrayUAID {
        self.uaid
    }

    /// Chunk address.
    pub fn address(&self) -> &StorageAddress {
        &self.addr
    }

    /// Copy of the header.
    pub fn header(&self) -> ChunkHeader {
        *self.hdr.lock()
    }

    /// Replace the header (write path fills in sizes and positions).
    pub fn set_header(&self, hdr: ChunkHeader) {
        *self.hdr.lock() = hdr;
    }

    /// Update the header in place.
    pub fn update_header(&self, f: impl FnOnce(&mut ChunkHeader)) {
        f(&mut self.hdr.lock());
    }

    /// Uncompressed size; the unit of cache accounting.
    pub fn size(&self) -> u64 {
        self.hdr.lock().size
    }

    /// Shared handle on the data buffer, if resident.
    pub fn data(&self) -> Option<Arc<Vec<u8>>> {
        self.data.lock().clone()
    }

    /// True when a data buffer is resident.
    pub fn has_data(&self) -> bool {
        self.data.lock().is_some()
    }

    /// Install the data buffer.
    pub fn set_data(&self, data: Arc<Vec<u8>>) {
        *self.data.lock() = Some(data);
    }

    /// Drop the data buffer (cache eviction, error cleanup).
    pub fn free_data(&self) {
        *self.data.lock() = None;
    }

    /// Pin depth.
    pub fn access_count(&self) -> u32 {
        self.access_count.load(Ordering::Acquire)
    }

    /// Increment the pin depth; returns the new value.
    pub fn begin_access(&self) -> u32 {
        self.access_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement the pin depth; returns the new value.
    pub fn end_access(&self) -> u32 {
        let prev = self.access_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin of an unpinned chunk");
        prev - 1
    }

    /// Load in progress (or data intentionally absent during a write).
    pub fn is_raw(&self) -> bool {
        self.raw.load(Ordering::Acquire)
    }

    /// Set or clear the load-in-progress flag.
    pub fn set_raw(&self, raw: bool) {
        self.raw.store(raw, Ordering::Release);
    }

    /// True when some thread waits for this chunk's load.
    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::Acquire)
    }

    /// Mark or clear the waiter flag.
    pub fn set_waiting(&self, waiting: bool) {
        self.waiting.store(waiting, Ordering::Release);
    }

    /// LRU clock value of the last access.
    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    /// Record an access at clock `ts`.
    pub fn set_timestamp(&self, ts: u64) {
        self.timestamp.store(ts, Ordering::Release);
    }

    /// LRU list key; 0 when not linked.
    pub fn lru_key(&self) -> u64 {
        self.lru_key.load(Ordering::Acquire)
    }

    /// Set the LRU list key (0 unlinks).
    pub fn set_lru_key(&self, key: u64) {
        self.lru_key.store(key, Ordering::Release);
    }
}

impl std::fmt::Debug for PersistentChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentChunk")
            .field("uaid", &self.uaid)
            .field("addr", &self.addr)
            .field("access_count", &self.access_count())
            .field("raw", &self.is_raw())
            .field("resident", &self.has_data())
            .finish()
    }
}
