//! The storage engine
//!
//! One engine instance owns the descriptor file, the transaction log,
//! the data-store pool, the chunk map and the cache of one cluster
//! instance. A single mutex protects all metadata state; two condition
//! variables coordinate loads (`load_event`) and strict-limit cache
//! admission (`cache_overflow_event`); a fixed array of reader/writer
//! latches serializes access to individual chunk buffers during
//! encode/decode. Replication waits always happen outside the mutex.

use crate::array::ArrayDesc;
use crate::cache::ChunkCache;
use crate::catalog::SystemCatalog;
use crate::chunkmap::{InnerChunkMap, InnerChunkMapEntry, PersistentChunk};
use crate::query::QueryContext;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tessera_core::{
    ArrayUAID, ArrayVersionId, ChunkDescriptor, ChunkFlags, ChunkHeader, Coordinates, InstanceId,
    QueryId, Result, StorageAddress, StorageConfig, StorageError, VersionId,
    CHUNK_DESCRIPTOR_SIZE,
};
use tessera_notify::Notification;
use tessera_replication::distribution::ReplicaPlacement;
use tessera_replication::manager::{ReplicationItem, ReplicationManager};
use tessera_replication::messages::{ChunkRecord, ReplicaMessage};
use tessera_rle::{EmptyBitmap, Payload};
use tessera_storage::codec::compressor_for;
use tessera_storage::datastore::{DataStore, DataStores};
use tessera_storage::descriptor::{DescriptorFile, FreeHeaderSet, StorageHeader};
use tessera_storage::translog::{TransLog, TransLogRecord};
use tracing::{debug, error, trace, warn};

/// Number of chunk latches; a chunk hashes to one by data offset.
pub const N_LATCHES: usize = 64;

/// Notification published when an inbound replica cannot be applied; the
/// error belongs to the *sender's* query, not any local one.
pub struct ReplicaApplyError {
    /// Query the replica belonged to.
    pub query_id: QueryId,
    /// Instance that sent the replica.
    pub source_instance: InstanceId,
    /// Human-readable failure.
    pub message: String,
}

/// Aggregate disk usage across this instance's data stores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskInfo {
    /// Bytes held by live chunk blocks.
    pub used_bytes: u64,
    /// Bytes sitting on data-store free lists.
    pub free_bytes: u64,
    /// Number of open data-store files.
    pub n_data_stores: usize,
}

/// Diagnostic snapshot of one chunk-map entry.
#[derive(Debug, Clone)]
pub struct ChunkMapEntryInfo {
    /// Owning array UAID.
    pub uaid: ArrayUAID,
    /// Entry address.
    pub address: StorageAddress,
    /// True for tombstones.
    pub tombstone: bool,
    /// Descriptor-slot offset.
    pub hdr_pos: u64,
    /// True when the data buffer is resident.
    pub resident: bool,
    /// Uncompressed chunk size (the cache-accounting unit).
    pub size: u64,
    /// Pin depth at snapshot time.
    pub access_count: u32,
    /// LRU clock of the last access.
    pub timestamp: u64,
}

pub(crate) struct EngineInner {
    pub(crate) hdr: StorageHeader,
    pub(crate) free_headers: FreeHeaderSet,
    pub(crate) chunk_map: FxHashMap<ArrayUAID, InnerChunkMap>,
    pub(crate) cache: ChunkCache,
    pub(crate) translog: TransLog,
}

/// The persistent storage engine of one cluster instance.
pub struct StorageEngine {
    pub(crate) config: StorageConfig,
    pub(crate) desc_file: DescriptorFile,
    pub(crate) datastores: DataStores,
    pub(crate) inner: Mutex<EngineInner>,
    pub(crate) load_event: Condvar,
    pub(crate) cache_overflow_event: Condvar,
    latches: Vec<RwLock<()>>,
    pub(crate) placement: ReplicaPlacement,
    pub(crate) catalog: Arc<dyn SystemCatalog>,
    replication: Mutex<Option<Arc<ReplicationManager>>>,
    instance_id: AtomicU64,
}

impl StorageEngine {
    pub(crate) fn assemble(
        config: StorageConfig,
        desc_file: DescriptorFile,
        datastores: DataStores,
        translog: TransLog,
        hdr: StorageHeader,
        placement: ReplicaPlacement,
        catalog: Arc<dyn SystemCatalog>,
    ) -> Self {
        let cache = ChunkCache::new(config.cache_size);
        let instance_id = AtomicU64::new(hdr.instance_id);
        StorageEngine {
            config,
            desc_file,
            datastores,
            inner: Mutex::new(EngineInner {
                hdr,
                free_headers: FreeHeaderSet::new(),
                chunk_map: FxHashMap::default(),
                cache,
                translog,
            }),
            load_event: Condvar::new(),
            cache_overflow_event: Condvar::new(),
            latches: (0..N_LATCHES).map(|_| RwLock::new(())).collect(),
            placement,
            catalog,
            replication: Mutex::new(None),
            instance_id,
        }
    }

    /// This instance's id.
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id.load(Ordering::Acquire)
    }

    /// Record this instance's id in the super-header.
    pub fn set_instance_id(&self, id: InstanceId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.hdr.instance_id = id;
        self.instance_id.store(id, Ordering::Release);
        self.desc_file.write_super_header(&inner.hdr)
    }

    /// Replica placement for this cluster.
    pub fn placement(&self) -> &ReplicaPlacement {
        &self.placement
    }

    /// Attach the replication manager. Recovery runs before this, so
    /// rollback never fans out to peers.
    pub fn attach_replication(&self, rm: Arc<ReplicationManager>) {
        *self.replication.lock() = Some(rm);
    }

    /// Bytes of chunk data currently accounted in the cache.
    pub fn used_mem_size(&self) -> u64 {
        self.inner.lock().cache.used
    }

    /// Primary instance for the chunk at `coords`.
    pub fn primary_instance_id(&self, desc: &ArrayDesc, coords: &Coordinates) -> InstanceId {
        self.placement.primary(desc.hashed_chunk_number(coords))
    }

    /// True when this instance originated the chunk.
    pub fn is_primary_replica(&self, chunk: &PersistentChunk) -> bool {
        chunk.header().instance_id == self.instance_id()
    }

    fn responsible_for(
        &self,
        desc: &ArrayDesc,
        chunk: &PersistentChunk,
        query: &QueryContext,
    ) -> bool {
        self.placement.is_responsible_for(
            self.instance_id(),
            chunk.header().instance_id,
            desc.hashed_chunk_number(&chunk.address().coords),
            query.liveness(),
        )
    }

    /// Latch guarding the chunk's data buffer during encode/decode.
    pub fn chunk_latch(&self, chunk: &PersistentChunk) -> &RwLock<()> {
        &self.latches[(chunk.header().pos.offs % N_LATCHES as u64) as usize]
    }

    // ------------------------------------------------------------------
    // Pinning and cache internals
    // ------------------------------------------------------------------

    /// Pin a chunk: keep it resident until the matching unpin.
    pub fn pin_chunk(&self, chunk: &Arc<PersistentChunk>) {
        let mut inner = self.inner.lock();
        inner.cache.unlink(chunk);
        chunk.begin_access();
        let ts = inner.cache.tick();
        chunk.set_timestamp(ts);
        trace!(addr = %chunk.address(), count = chunk.access_count(), "pin chunk");
    }

    /// Unpin a chunk; at depth zero it becomes evictable.
    pub fn unpin_chunk(&self, chunk: &Arc<PersistentChunk>) -> Result<()> {
        let mut inner = self.inner.lock();
        if chunk.access_count() == 0 {
            return Err(StorageError::PinUnpinDisbalance);
        }
        if chunk.end_access() == 0 {
            inner.cache.link(chunk);
            // A strict-limit waiter can now evict this chunk.
            if inner.cache.overflow_flag {
                inner.cache.overflow_flag = false;
                self.cache_overflow_event.notify_all();
            }
        }
        trace!(addr = %chunk.address(), count = chunk.access_count(), "unpin chunk");
        Ok(())
    }

    /// Evict from the cold end until `chunk` fits the budget, then
    /// account it. Under the strict limit an empty LRU blocks on the
    /// overflow condvar; otherwise the budget is overrun with a warning.
    fn add_chunk_to_cache(
        &self,
        inner: &mut MutexGuard<'_, EngineInner>,
        chunk: &Arc<PersistentChunk>,
    ) {
        let size = chunk.size();
        loop {
            if inner.cache.used + size <= inner.cache.size {
                break;
            }
            if let Some(victim) = inner.cache.pop_coldest() {
                debug_assert!(!Arc::ptr_eq(&victim, chunk));
                self.internal_free_chunk(inner, &victim);
            } else if self.config.strict_cache_limit && inner.cache.used != 0 {
                inner.cache.overflow_flag = true;
                self.cache_overflow_event.wait(inner);
            } else {
                warn!(
                    used = inner.cache.used,
                    budget = inner.cache.size,
                    incoming = size,
                    "cache budget overrun"
                );
                break;
            }
        }
        inner.cache.used += size;
        trace!(addr = %chunk.address(), size, used = inner.cache.used, "cached chunk");
    }

    /// Drop a chunk's buffer and fix the byte accounting; wakes a
    /// strict-limit waiter when one exists. The chunk handle stays in
    /// the map.
    fn internal_free_chunk(
        &self,
        inner: &mut MutexGuard<'_, EngineInner>,
        victim: &Arc<PersistentChunk>,
    ) {
        if victim.has_data() && victim.header().pos.hdr_pos != 0 {
            inner.cache.used = inner.cache.used.saturating_sub(victim.size());
            if inner.cache.overflow_flag {
                inner.cache.overflow_flag = false;
                self.cache_overflow_event.notify_all();
            }
        }
        inner.cache.unlink(victim);
        victim.free_data();
    }

    fn notify_chunk_ready(&self, chunk: &PersistentChunk) {
        // Caller holds the engine mutex.
        chunk.set_raw(false);
        if chunk.is_waiting() {
            chunk.set_waiting(false);
            self.load_event.notify_all();
        }
    }

    // ------------------------------------------------------------------
    // Chunk creation and the primary write path
    // ------------------------------------------------------------------

    /// Create a chunk at `addr` for the write path. The chunk is born
    /// pinned and raw; there must be no entry at the address yet.
    pub fn create_chunk(
        &self,
        desc: &ArrayDesc,
        addr: StorageAddress,
        compression_method: i16,
        query: &QueryContext,
    ) -> Result<Arc<PersistentChunk>> {
        if compression_method < 0 {
            return Err(StorageError::CompressMethodUndefined);
        }
        let mut inner = self.inner.lock();
        query.validate()?;
        let map = inner.chunk_map.entry(desc.uaid()).or_default();
        if map.contains_key(&addr) {
            return Err(StorageError::ChunkAlreadyExists(addr.to_string()));
        }
        let hdr = ChunkHeader {
            arr_id: addr.arr_id,
            att_id: addr.att_id,
            n_coordinates: addr.coords.len() as u16,
            compression_method,
            instance_id: self.instance_id(),
            pos: tessera_core::DiskPos {
                ds_guid: desc.uaid(),
                ..Default::default()
            },
            ..ChunkHeader::default()
        };
        let chunk = Arc::new(PersistentChunk::new_for_write(desc.uaid(), addr.clone(), hdr));
        chunk.begin_access();
        map.insert(addr, InnerChunkMapEntry::Chunk(Arc::clone(&chunk)));
        let ts = inner.cache.tick();
        chunk.set_timestamp(ts);
        trace!(addr = %chunk.address(), "created chunk");
        Ok(chunk)
    }

    /// Install the encoded payload (or empty-bitmap) bytes of a chunk
    /// under construction.
    pub fn stage_chunk_payload(&self, chunk: &Arc<PersistentChunk>, bytes: Vec<u8>) {
        debug_assert!(chunk.is_raw());
        chunk.update_header(|h| h.size = bytes.len() as u64);
        chunk.set_data(Arc::new(bytes));
    }

    /// Remove a chunk's map entry (failed writes, aborts).
    pub fn delete_chunk(&self, desc: &ArrayDesc, chunk: &PersistentChunk) {
        let mut inner = self.inner.lock();
        if let Some(map) = inner.chunk_map.get_mut(&desc.uaid()) {
            map.remove(chunk.address());
        }
    }

    /// Write a staged chunk: count elements, compress, replicate,
    /// persist, cache, unpin. On failure the chunk is cleaned up and the
    /// replicas aborted.
    pub fn write_chunk(
        &self,
        desc: &ArrayDesc,
        chunk: &Arc<PersistentChunk>,
        query: &QueryContext,
    ) -> Result<()> {
        let mut replicas: Vec<Arc<ReplicationItem>> = Vec::new();
        let result = self.write_chunk_impl(desc, chunk, query, &mut replicas);
        match result {
            Ok(()) => {
                self.wait_for_replicas(&replicas)?;
                Ok(())
            }
            Err(e) => {
                self.abort_replicas(&replicas);
                self.clean_failed_chunk(desc, chunk);
                Err(e)
            }
        }
    }

    fn write_chunk_impl(
        &self,
        desc: &ArrayDesc,
        chunk: &Arc<PersistentChunk>,
        query: &QueryContext,
        replicas: &mut Vec<Arc<ReplicationItem>>,
    ) -> Result<()> {
        query.validate()?;
        let data = chunk
            .data()
            .ok_or(StorageError::AccessToRawChunk(desc.uaid()))?;

        // Element count comes from the encoded form.
        let n_elems = if desc.is_empty_bitmap_attribute(chunk.address().att_id) {
            EmptyBitmap::peek_count(&data)?
        } else {
            Payload::peek_count(&data)?
        };
        chunk.update_header(|h| {
            h.n_elems = n_elems;
            h.size = data.len() as u64;
            h.flags.set(ChunkFlags::RLE_CHUNK, true);
        });

        // Compress; equal or larger output means "store raw".
        let codec = compressor_for(chunk.header().compression_method)?;
        let compressed = codec.compress(&data);
        let deflated: Arc<Vec<u8>> = if compressed.len() >= data.len() {
            Arc::clone(&data)
        } else {
            Arc::new(compressed)
        };
        chunk.update_header(|h| h.compressed_size = deflated.len() as u64);

        // Fan out to replicas before taking the engine mutex.
        *replicas = self.replicate(desc, chunk.address().clone(), Some((chunk, &deflated)), query)?;

        let mut inner = self.inner.lock();
        query.validate()?;
        debug_assert!(chunk.is_raw());

        let ds = self.datastores.get_or_create(desc.uaid())?;
        let (offs, allocated) = ds.lock().allocate_space(deflated.len() as u64)?;
        chunk.update_header(|h| {
            h.pos.ds_guid = desc.uaid();
            h.pos.offs = offs;
            h.allocated_size = allocated;
        });

        {
            let EngineInner {
                hdr, free_headers, ..
            } = &mut *inner;
            let hdr_pos = Self::alloc_header_slot(hdr, free_headers);
            chunk.update_header(|h| h.pos.hdr_pos = hdr_pos);
        }

        // Undo log first; the log files are synchronous, so the record
        // is durable when append returns. The first version of an array
        // needs no record: rolling it back unlinks the whole data store.
        if desc.version() > 1 {
            let rec = TransLogRecord::new(
                desc.uaid(),
                chunk.address().arr_id,
                desc.version(),
                chunk.header(),
            );
            inner.translog.append(&rec)?;
        }

        self.write_data_timed(&ds, offs, &deflated, allocated)?;

        let cdesc = ChunkDescriptor::new(chunk.header(), &chunk.address().coords)?;
        self.desc_file.write_descriptor(chunk.header().pos.hdr_pos, &cdesc)?;
        self.desc_file.write_super_header(&inner.hdr)?;

        self.notify_chunk_ready(chunk);
        self.add_chunk_to_cache(&mut inner, chunk);
        if chunk.end_access() == 0 {
            inner.cache.link(chunk);
        }
        Ok(())
    }

    /// Unpin and free a chunk whose write failed, dropping its map
    /// entry. Accounting is untouched: the chunk never made it into the
    /// cache.
    fn clean_failed_chunk(&self, desc: &ArrayDesc, chunk: &Arc<PersistentChunk>) {
        let mut inner = self.inner.lock();
        if chunk.access_count() > 0 {
            chunk.end_access();
        }
        inner.cache.unlink(chunk);
        chunk.free_data();
        self.notify_chunk_ready(chunk);
        if let Some(map) = inner.chunk_map.get_mut(&desc.uaid()) {
            map.remove(chunk.address());
        }
    }

    fn alloc_header_slot(hdr: &mut StorageHeader, free_headers: &mut FreeHeaderSet) -> u64 {
        if let Some(pos) = free_headers.pop() {
            pos
        } else {
            let pos = hdr.curr_pos;
            hdr.curr_pos += CHUNK_DESCRIPTOR_SIZE as u64;
            hdr.n_chunks += 1;
            pos
        }
    }

    fn write_data_timed(
        &self,
        ds: &Arc<Mutex<DataStore>>,
        offs: u64,
        data: &[u8],
        allocated: u64,
    ) -> Result<()> {
        let started = self.config.io_log_threshold_ms.map(|_| Instant::now());
        ds.lock().write_data(offs, data, allocated)?;
        if let (Some(threshold), Some(started)) = (self.config.io_log_threshold_ms, started) {
            let elapsed = started.elapsed().as_millis() as u64;
            if elapsed > threshold {
                debug!(offs, len = data.len(), elapsed_ms = elapsed, "slow data-store write");
            }
        }
        Ok(())
    }

    fn read_data_timed(
        &self,
        ds: &Arc<Mutex<DataStore>>,
        offs: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let started = self.config.io_log_threshold_ms.map(|_| Instant::now());
        ds.lock().read_data(offs, buf)?;
        if let (Some(threshold), Some(started)) = (self.config.io_log_threshold_ms, started) {
            let elapsed = started.elapsed().as_millis() as u64;
            if elapsed > threshold {
                debug!(offs, len = buf.len(), elapsed_ms = elapsed, "slow data-store read");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Replication fan-out
    // ------------------------------------------------------------------

    fn replicate(
        &self,
        desc: &ArrayDesc,
        addr: StorageAddress,
        chunk_data: Option<(&Arc<PersistentChunk>, &Arc<Vec<u8>>)>,
        query: &QueryContext,
    ) -> Result<Vec<Arc<ReplicationItem>>> {
        let rm = self.replication.lock().clone();
        let Some(rm) = rm else {
            return Ok(Vec::new());
        };
        if self.placement.redundancy() == 0 {
            return Ok(Vec::new());
        }
        if let Some((chunk, _)) = chunk_data {
            if !self.is_primary_replica(chunk) {
                return Ok(Vec::new());
            }
        }
        query.validate()?;

        let replicas = self.placement.replicas(desc.hashed_chunk_number(&addr.coords));
        let mut items = Vec::with_capacity(self.placement.redundancy());
        for &target in replicas.iter().skip(1) {
            let msg = match chunk_data {
                Some((chunk, bytes)) => {
                    let hdr = chunk.header();
                    ReplicaMessage::chunk(
                        query.id(),
                        self.instance_id(),
                        ChunkRecord {
                            address: addr.clone(),
                            compression_method: hdr.compression_method,
                            decompressed_size: hdr.size,
                            count: 0,
                            tombstone: false,
                        },
                        (**bytes).clone(),
                    )
                }
                None => ReplicaMessage::tombstone(query.id(), self.instance_id(), addr.clone()),
            };
            match rm.send(target, msg) {
                Ok(item) => items.push(item),
                Err(e) => {
                    rm.abort_all(&items);
                    return Err(e);
                }
            }
        }
        Ok(items)
    }

    fn wait_for_replicas(&self, items: &[Arc<ReplicationItem>]) -> Result<()> {
        if items.is_empty() || self.config.async_replication {
            return Ok(());
        }
        let rm = self.replication.lock().clone();
        match rm {
            Some(rm) => rm.wait_all(items),
            None => Ok(()),
        }
    }

    fn abort_replicas(&self, items: &[Arc<ReplicationItem>]) {
        if items.is_empty() {
            return;
        }
        if let Some(rm) = self.replication.lock().clone() {
            rm.abort_all(items);
        }
    }

    /// Apply a replica message from a peer. Replica writes never pass
    /// through the primary write path: no re-replication, no cache
    /// admission, no pinning.
    pub fn apply_replica_chunk(
        &self,
        desc: &ArrayDesc,
        msg: &ReplicaMessage,
        query: &QueryContext,
    ) -> Result<()> {
        if msg.record.tombstone {
            return self.remove_local_chunk_version(desc, &msg.record.address.coords, query);
        }
        let payload = msg
            .payload
            .as_ref()
            .ok_or_else(|| StorageError::corrupted("replica chunk without payload"))?;
        query.validate()?;

        let mut inner = self.inner.lock();
        let addr = msg.record.address.clone();
        if inner
            .chunk_map
            .get(&desc.uaid())
            .map_or(false, |m| m.contains_key(&addr))
        {
            return Err(StorageError::ChunkAlreadyExists(addr.to_string()));
        }

        let ds = self.datastores.get_or_create(desc.uaid())?;
        let (offs, allocated) = ds.lock().allocate_space(payload.len() as u64)?;
        let hdr_pos = {
            let EngineInner {
                hdr, free_headers, ..
            } = &mut *inner;
            Self::alloc_header_slot(hdr, free_headers)
        };
        let mut hdr = ChunkHeader {
            arr_id: addr.arr_id,
            att_id: addr.att_id,
            n_coordinates: addr.coords.len() as u16,
            compression_method: msg.record.compression_method,
            instance_id: msg.source_instance,
            allocated_size: allocated,
            compressed_size: payload.len() as u64,
            size: msg.record.decompressed_size,
            n_elems: msg.record.count,
            pos: tessera_core::DiskPos {
                ds_guid: desc.uaid(),
                offs,
                hdr_pos,
            },
            ..ChunkHeader::default()
        };
        hdr.flags.set(ChunkFlags::RLE_CHUNK, true);

        if desc.version() > 1 {
            let rec = TransLogRecord::new(desc.uaid(), addr.arr_id, desc.version(), hdr);
            inner.translog.append(&rec)?;
        }
        self.write_data_timed(&ds, offs, payload, allocated)?;
        let cdesc = ChunkDescriptor::new(hdr, &addr.coords)?;
        self.desc_file.write_descriptor(hdr_pos, &cdesc)?;
        self.desc_file.write_super_header(&inner.hdr)?;

        let chunk = Arc::new(PersistentChunk::from_descriptor(desc.uaid(), addr.clone(), hdr));
        inner
            .chunk_map
            .entry(desc.uaid())
            .or_default()
            .insert(addr, InnerChunkMapEntry::Chunk(chunk));
        Ok(())
    }

    /// Apply a replica message, reporting failures to the sender's query
    /// via notification instead of the local caller.
    pub fn handle_replica_message(
        &self,
        desc: &ArrayDesc,
        msg: &ReplicaMessage,
        query: &QueryContext,
    ) {
        if let Err(e) = self.apply_replica_chunk(desc, msg, query) {
            error!(
                query = msg.query_id,
                source = msg.source_instance,
                error = %e,
                "failed to apply replica chunk"
            );
            Notification::new(ReplicaApplyError {
                query_id: msg.query_id,
                source_instance: msg.source_instance,
                message: e.to_string(),
            })
            .publish();
        }
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Find the chunk at exactly `addr` and pin it.
    pub fn lookup_chunk(
        &self,
        desc: &ArrayDesc,
        addr: &StorageAddress,
    ) -> Option<Arc<PersistentChunk>> {
        let mut inner = self.inner.lock();
        let chunk = inner
            .chunk_map
            .get(&desc.uaid())
            .and_then(|m| m.get(addr))
            .and_then(|e| e.chunk())
            .cloned()?;
        inner.cache.unlink(&chunk);
        chunk.begin_access();
        let ts = inner.cache.tick();
        chunk.set_timestamp(ts);
        Some(chunk)
    }

    /// Read a chunk: look it up, pin it, and make its data resident.
    pub fn read_chunk(
        &self,
        desc: &ArrayDesc,
        addr: &StorageAddress,
        query: &QueryContext,
    ) -> Result<Arc<PersistentChunk>> {
        let chunk = self
            .lookup_chunk(desc, addr)
            .ok_or(StorageError::ChunkNotFound)?;
        if let Err(e) = self.load_chunk(desc, &chunk, query) {
            let _ = self.unpin_chunk(&chunk);
            return Err(e);
        }
        Ok(chunk)
    }

    /// Make a pinned chunk's data resident.
    ///
    /// Fast-paths when the buffer is already loaded. When another thread
    /// is loading the same chunk, waits on the process-wide load event
    /// and re-checks the chunk's raw flag (spurious wakes are harmless).
    pub fn load_chunk(
        &self,
        desc: &ArrayDesc,
        chunk: &Arc<PersistentChunk>,
        query: &QueryContext,
    ) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if chunk.is_raw() {
                // Someone else is loading this chunk.
                while chunk.is_raw() {
                    chunk.set_waiting(true);
                    self.load_event.wait(&mut inner);
                    query.validate()?;
                }
                if !chunk.has_data() {
                    // The previous loader failed; take over.
                    chunk.set_raw(true);
                    self.add_chunk_to_cache(&mut inner, chunk);
                }
            } else if !chunk.has_data() {
                chunk.set_raw(true);
                self.add_chunk_to_cache(&mut inner, chunk);
            }
        }
        if chunk.is_raw() {
            self.fetch_chunk(desc, chunk)?;
        }
        Ok(())
    }

    fn fetch_chunk(&self, desc: &ArrayDesc, chunk: &Arc<PersistentChunk>) -> Result<()> {
        let result = self.fetch_chunk_impl(desc, chunk);
        let mut inner = self.inner.lock();
        if result.is_err() {
            // Give back the bytes reserved at admission.
            inner.cache.used = inner.cache.used.saturating_sub(chunk.size());
            if inner.cache.overflow_flag {
                inner.cache.overflow_flag = false;
                self.cache_overflow_event.notify_all();
            }
        }
        self.notify_chunk_ready(chunk);
        result
    }

    fn fetch_chunk_impl(&self, desc: &ArrayDesc, chunk: &Arc<PersistentChunk>) -> Result<()> {
        let hdr = chunk.header();
        if hdr.pos.hdr_pos == 0 {
            return Err(StorageError::AccessToRawChunk(desc.uaid()));
        }
        let ds = self.datastores.get_or_create(hdr.pos.ds_guid)?;
        let _latch = self.chunk_latch(chunk).write();
        let mut compressed = vec![0u8; hdr.compressed_size as usize];
        self.read_data_timed(&ds, hdr.pos.offs, &mut compressed)?;
        let data = if hdr.compressed_size != hdr.size {
            let codec = compressor_for(hdr.compression_method)?;
            codec.decompress(&compressed, hdr.size as usize)?
        } else {
            compressed
        };
        chunk.set_data(Arc::new(data));
        Ok(())
    }

    /// Logical element count of a loaded chunk.
    ///
    /// The on-disk `n_elems` includes overlap cells; for arrays with
    /// overlap the count is re-derived from the encoded form.
    pub fn element_count(&self, desc: &ArrayDesc, chunk: &Arc<PersistentChunk>) -> Result<u64> {
        let hdr = chunk.header();
        if !desc.has_overlap() {
            return Ok(hdr.n_elems);
        }
        let data = chunk
            .data()
            .ok_or(StorageError::AccessToRawChunk(desc.uaid()))?;
        if desc.is_empty_bitmap_attribute(chunk.address().att_id) {
            Ok(EmptyBitmap::unpack(&data)?.count())
        } else {
            Ok(Payload::unpack(&data)?.count() as u64)
        }
    }

    // ------------------------------------------------------------------
    // MVCC lookups
    // ------------------------------------------------------------------

    /// Resolve `address` to the newest version at or below `desc.id()`
    /// for its `(attribute, coordinates)`.
    ///
    /// On success `address.arr_id` is set to the found version. Returns
    /// false (clearing the coordinates) when no visible chunk exists:
    /// nothing stored there, a tombstone hides it, or this instance is
    /// not responsible for it.
    pub fn find_chunk(
        &self,
        desc: &ArrayDesc,
        query: &QueryContext,
        address: &mut StorageAddress,
    ) -> Result<bool> {
        let inner = self.inner.lock();
        query.validate()?;
        let Some(map) = inner.chunk_map.get(&desc.uaid()) else {
            address.coords.clear();
            return Ok(false);
        };
        address.arr_id = desc.id();
        let Some((key, entry)) = map.range(address.clone()..).next() else {
            address.coords.clear();
            return Ok(false);
        };
        if key.att_id != address.att_id || key.coords != address.coords {
            address.coords.clear();
            return Ok(false);
        }
        debug_assert!(key.arr_id <= address.arr_id);
        if let Some(chunk) = entry.chunk() {
            if self.responsible_for(desc, chunk, query) {
                address.arr_id = key.arr_id;
                return Ok(true);
            }
        }
        address.coords.clear();
        Ok(false)
    }

    /// Advance `address` to the next chunk of the same attribute in
    /// stride-major order, skipping tombstoned coordinates and chunks
    /// this instance is not responsible for.
    ///
    /// Empty coordinates mean "start of attribute" on entry and "end of
    /// array" on exit.
    pub fn find_next_chunk(
        &self,
        desc: &ArrayDesc,
        query: &QueryContext,
        address: &mut StorageAddress,
    ) -> Result<bool> {
        let inner = self.inner.lock();
        query.validate()?;
        debug_assert!(address.arr_id <= desc.id());
        let Some(map) = inner.chunk_map.get(&desc.uaid()) else {
            address.coords.clear();
            return Ok(false);
        };

        let mut probe = address.clone();
        probe.arr_id = desc.id();
        if !probe.coords.is_empty() {
            let last = probe.coords.len() - 1;
            probe.coords[last] += desc.last_chunk_interval();
        }
        loop {
            let Some((key, entry)) = map.range(probe.clone()..).next() else {
                address.coords.clear();
                return Ok(false);
            };
            if key.att_id != probe.att_id {
                address.coords.clear();
                return Ok(false);
            }
            if key.arr_id > desc.id() {
                // Entries newer than the requested version; re-probe at
                // this coordinate for the newest visible one.
                probe.coords = key.coords.clone();
                continue;
            }
            let visible = entry
                .chunk()
                .map(|c| self.responsible_for(desc, c, query))
                .unwrap_or(false);
            if visible {
                address.arr_id = key.arr_id;
                address.coords = key.coords.clone();
                return Ok(true);
            }
            // Tombstone or foreign chunk: step past this coordinate.
            probe.coords = key.coords.clone();
            let last = probe.coords.len() - 1;
            probe.coords[last] += desc.last_chunk_interval();
        }
    }

    /// Coordinates of every chunk of `desc` visible to this instance.
    pub fn chunk_positions(
        &self,
        desc: &ArrayDesc,
        query: &QueryContext,
    ) -> Result<BTreeSet<Coordinates>> {
        let mut positions = BTreeSet::new();
        let mut addr = StorageAddress::attribute_start(desc.id(), 0);
        while self.find_next_chunk(desc, query, &mut addr)? {
            positions.insert(addr.coords.clone());
        }
        Ok(positions)
    }

    // ------------------------------------------------------------------
    // Tombstones and version removal
    // ------------------------------------------------------------------

    /// Write tombstone entries for every attribute of `desc` at
    /// `coords`, locally only.
    pub fn remove_local_chunk_version(
        &self,
        desc: &ArrayDesc,
        coords: &Coordinates,
        query: &QueryContext,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        query.validate()?;
        if !inner.chunk_map.contains_key(&desc.uaid()) {
            return Err(StorageError::ArrayDoesntExist(desc.uaid()));
        }

        let mut tombstone_hdr = ChunkHeader {
            arr_id: desc.id(),
            n_coordinates: coords.len() as u16,
            instance_id: self.placement.primary(desc.hashed_chunk_number(coords)),
            pos: tessera_core::DiskPos {
                ds_guid: desc.uaid(),
                ..Default::default()
            },
            ..ChunkHeader::default()
        };
        tombstone_hdr.flags.set(ChunkFlags::TOMBSTONE, true);

        for att in 0..desc.n_attributes() {
            query.validate()?;
            let addr = StorageAddress::new(desc.id(), att, coords.clone());
            match inner.chunk_map.get(&desc.uaid()).and_then(|m| m.get(&addr)) {
                Some(entry) if !entry.is_tombstone() => {
                    return Err(StorageError::ChunkAlreadyExists(addr.to_string()));
                }
                Some(_) => continue, // already tombstoned
                None => {}
            }
            tombstone_hdr.att_id = att;
            let hdr_pos = {
                let EngineInner {
                    hdr, free_headers, ..
                } = &mut *inner;
                Self::alloc_header_slot(hdr, free_headers)
            };
            tombstone_hdr.pos.hdr_pos = hdr_pos;
            if let Some(map) = inner.chunk_map.get_mut(&desc.uaid()) {
                map.insert(addr, InnerChunkMapEntry::Tombstone { hdr_pos });
            }

            let rec = TransLogRecord::new(desc.uaid(), desc.id(), desc.version(), tombstone_hdr);
            inner.translog.append(&rec)?;

            let cdesc = ChunkDescriptor::new(tombstone_hdr, coords)?;
            self.desc_file.write_descriptor(hdr_pos, &cdesc)?;
            trace!(pos = hdr_pos, att, "wrote tombstone descriptor");
        }
        self.desc_file.write_super_header(&inner.hdr)?;
        Ok(())
    }

    /// Delete the chunk at `coords` in version `desc.id()` cluster-wide:
    /// replicate the tombstone, apply it locally, wait for the replicas.
    pub fn remove_chunk_version(
        &self,
        desc: &ArrayDesc,
        coords: &Coordinates,
        query: &QueryContext,
    ) -> Result<()> {
        let addr = StorageAddress::new(desc.id(), 0, coords.clone());
        let replicas = self.replicate(desc, addr, None, query)?;
        match self.remove_local_chunk_version(desc, coords, query) {
            Ok(()) => self.wait_for_replicas(&replicas),
            Err(e) => {
                self.abort_replicas(&replicas);
                Err(e)
            }
        }
    }

    /// Tombstone every chunk this instance is primary for whose
    /// coordinates are absent from `live_chunks`; the cleanup pass of
    /// overwriting store operators.
    pub fn remove_dead_chunks(
        &self,
        desc: &ArrayDesc,
        live_chunks: &BTreeSet<Coordinates>,
        query: &QueryContext,
    ) -> Result<()> {
        let mut dead = Vec::new();
        {
            let mut addr = StorageAddress::attribute_start(desc.id(), 0);
            while self.find_next_chunk(desc, query, &mut addr)? {
                if !live_chunks.contains(&addr.coords)
                    && self.primary_instance_id(desc, &addr.coords) == self.instance_id()
                {
                    dead.push(addr.coords.clone());
                }
            }
        }
        // Replication inside remove_chunk_version runs without the
        // engine mutex.
        for coords in dead {
            self.remove_chunk_version(desc, &coords, query)?;
        }
        Ok(())
    }

    /// Reclaim descriptor slot and data-store block of `entry`.
    pub(crate) fn mark_chunk_as_free(
        &self,
        free_headers: &mut FreeHeaderSet,
        entry: &InnerChunkMapEntry,
        ds: Option<&Arc<Mutex<DataStore>>>,
    ) -> Result<()> {
        let mut header = match entry {
            InnerChunkMapEntry::Chunk(chunk) => {
                let h = chunk.header();
                if let Some(ds) = ds {
                    ds.lock().free_chunk(h.pos.offs, h.allocated_size);
                }
                h
            }
            InnerChunkMapEntry::Tombstone { hdr_pos } => self.desc_file.read_header(*hdr_pos)?,
        };
        header.arr_id = 0;
        trace!(pos = header.pos.hdr_pos, "freeing chunk descriptor");
        self.desc_file.write_header(header.pos.hdr_pos, &header)?;
        free_headers.insert(header.pos.hdr_pos);
        Ok(())
    }

    /// Remove all versions of `uaid` older than `last_live_arr_id`;
    /// with `last_live_arr_id == 0`, remove the array entirely,
    /// including its data-store file.
    pub fn remove_versions(
        &self,
        _query_id: QueryId,
        uaid: ArrayUAID,
        last_live_arr_id: ArrayVersionId,
    ) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if !inner.chunk_map.contains_key(&uaid) {
                return Ok(());
            }
            let ds = self.datastores.get_or_create(uaid)?;

            // Walk per coordinate, newest first; the first entry at or
            // below the cut keeps that coordinate alive, everything
            // older dies.
            let mut victims: Vec<(StorageAddress, InnerChunkMapEntry)> = Vec::new();
            {
                let map = &inner.chunk_map[&uaid];
                let mut current_base: Option<StorageAddress> = None;
                let mut current_live = true;
                for (address, entry) in map.iter() {
                    if last_live_arr_id != 0 {
                        if current_base
                            .as_ref()
                            .map_or(true, |base| !address.same_base(base))
                        {
                            current_base = Some(address.clone());
                            current_live = true;
                        }
                        if address.arr_id > last_live_arr_id {
                            continue;
                        } else if address.arr_id == last_live_arr_id {
                            current_live = false;
                            continue;
                        } else if current_live {
                            current_live = false;
                            continue;
                        }
                    }
                    victims.push((address.clone(), entry.clone()));
                }
            }

            {
                let EngineInner {
                    chunk_map,
                    free_headers,
                    cache,
                    ..
                } = &mut *inner;
                let map = chunk_map.get_mut(&uaid).expect("checked above");
                for (address, entry) in &victims {
                    self.mark_chunk_as_free(free_headers, entry, Some(&ds))?;
                    if let Some(chunk) = entry.chunk() {
                        if chunk.has_data() && chunk.header().pos.hdr_pos != 0 {
                            cache.used = cache.used.saturating_sub(chunk.size());
                        }
                        cache.unlink(chunk);
                        chunk.free_data();
                    }
                    map.remove(address);
                }
            }
            self.desc_file.write_super_header(&inner.hdr)?;
            debug!(uaid, last_live_arr_id, removed = victims.len(), "removed versions");
        }
        self.flush(Some(uaid))?;
        if last_live_arr_id == 0 {
            let mut inner = self.inner.lock();
            debug_assert!(inner
                .chunk_map
                .get(&uaid)
                .map_or(true, |m| m.is_empty()));
            inner.chunk_map.remove(&uaid);
            drop(inner);
            self.datastores.close_data_store(uaid, true)?;
        }
        Ok(())
    }

    /// Forget a rolled-back version's entries; in-memory only.
    pub fn remove_version_from_memory(&self, uaid: ArrayUAID, arr_id: ArrayVersionId) {
        let mut inner = self.inner.lock();
        let EngineInner {
            chunk_map, cache, ..
        } = &mut *inner;
        let Some(map) = chunk_map.get_mut(&uaid) else {
            return;
        };
        let victims: Vec<StorageAddress> = map
            .keys()
            .filter(|a| a.arr_id == arr_id)
            .cloned()
            .collect();
        for address in &victims {
            if let Some(InnerChunkMapEntry::Chunk(chunk)) = map.get(address) {
                if chunk.has_data() && chunk.header().pos.hdr_pos != 0 {
                    cache.used = cache.used.saturating_sub(chunk.size());
                }
                cache.unlink(chunk);
                chunk.free_data();
            }
            map.remove(address);
        }
        if map.is_empty() {
            chunk_map.remove(&uaid);
        }
    }

    // ------------------------------------------------------------------
    // Rollback
    // ------------------------------------------------------------------

    /// Undo uncommitted versions per the transaction log.
    ///
    /// For every record of an array in `undo`, with a version newer than
    /// the recorded last live version: free its descriptor slot and,
    /// unless it is a tombstone or the array's first version, return its
    /// data block. Arrays rolled back to nothing lose their data-store
    /// file.
    pub fn rollback(&self, undo: &BTreeMap<ArrayUAID, VersionId>) -> Result<()> {
        debug!(arrays = undo.len(), "performing rollback");
        {
            let mut inner = self.inner.lock();
            for log in 0..2 {
                let records = inner.translog.records(log)?;
                for rec in records {
                    let Some(&last_live) = undo.get(&rec.array_uaid) else {
                        continue;
                    };
                    if rec.version <= last_live {
                        continue;
                    }
                    debug_assert_eq!(rec.old_size, 0);
                    debug_assert!(rec.hdr.pos.hdr_pos != 0);
                    let mut hdr = rec.hdr;
                    hdr.arr_id = 0;
                    trace!(pos = hdr.pos.hdr_pos, "undoing chunk descriptor");
                    self.desc_file.write_header(hdr.pos.hdr_pos, &hdr)?;
                    inner.free_headers.insert(hdr.pos.hdr_pos);
                    if !rec.hdr.is_tombstone() && last_live > 0 {
                        let ds = self.datastores.get_or_create(rec.hdr.pos.ds_guid)?;
                        ds.lock().free_chunk(rec.hdr.pos.offs, rec.hdr.allocated_size);
                    }
                }
            }
        }
        self.flush(None)?;
        for (&uaid, &last_live) in undo {
            if last_live == 0 {
                self.datastores.close_data_store(uaid, true)?;
            }
            debug!(uaid, last_live, "rolled back array");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Flush and close
    // ------------------------------------------------------------------

    /// Fsync the descriptor file and the data store(s): one array's, or
    /// all of them.
    pub fn flush(&self, uaid: Option<ArrayUAID>) -> Result<()> {
        self.desc_file.sync()?;
        match uaid {
            Some(uaid) => {
                let ds = self.datastores.get_or_create(uaid)?;
                let result = ds.lock().flush();
                result
            }
            None => self.datastores.flush_all(),
        }
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Walk every descriptor slot; returns each descriptor plus whether
    /// the slot is free. The backing store of the `list_chunk_descriptors`
    /// administration query.
    pub fn list_chunk_descriptors(&self) -> Result<Vec<(ChunkDescriptor, bool)>> {
        let inner = self.inner.lock();
        let mut out = Vec::with_capacity(inner.hdr.n_chunks as usize);
        let mut pos = tessera_storage::descriptor::STORAGE_HEADER_SIZE as u64;
        for _ in 0..inner.hdr.n_chunks {
            let Some(desc) = self.desc_file.read_descriptor(pos)? else {
                break;
            };
            let free = desc.hdr.arr_id == 0 || inner.free_headers.contains(pos);
            out.push((desc, free));
            pos += CHUNK_DESCRIPTOR_SIZE as u64;
        }
        Ok(out)
    }

    /// Snapshot of every in-memory chunk-map entry.
    pub fn list_chunk_map(&self) -> Vec<ChunkMapEntryInfo> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        for (&uaid, map) in inner.chunk_map.iter() {
            for (address, entry) in map.iter() {
                let info = match entry {
                    InnerChunkMapEntry::Chunk(chunk) => ChunkMapEntryInfo {
                        uaid,
                        address: address.clone(),
                        tombstone: false,
                        hdr_pos: chunk.header().pos.hdr_pos,
                        resident: chunk.has_data(),
                        size: chunk.size(),
                        access_count: chunk.access_count(),
                        timestamp: chunk.timestamp(),
                    },
                    InnerChunkMapEntry::Tombstone { hdr_pos } => ChunkMapEntryInfo {
                        uaid,
                        address: address.clone(),
                        tombstone: true,
                        hdr_pos: *hdr_pos,
                        resident: false,
                        size: 0,
                        access_count: 0,
                        timestamp: 0,
                    },
                };
                out.push(info);
            }
        }
        out.sort_by(|a, b| (a.uaid, &a.address).cmp(&(b.uaid, &b.address)));
        out
    }

    /// Aggregate allocation accounting over all open data stores.
    pub fn disk_info(&self) -> Result<DiskInfo> {
        let mut info = DiskInfo::default();
        for guid in self.datastores.open_guids() {
            let ds = self.datastores.get_or_create(guid)?;
            let ds = ds.lock();
            let free = ds.free_bytes();
            info.used_bytes += ds.file_size() - free;
            info.free_bytes += free;
            info.n_data_stores += 1;
        }
        Ok(info)
    }

    /// Current value of the cache access clock.
    pub fn current_timestamp(&self) -> u64 {
        self.inner.lock().cache.clock()
    }

    /// Close the engine; every chunk must be unpinned.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        for map in inner.chunk_map.values() {
            for entry in map.values() {
                if let Some(chunk) = entry.chunk() {
                    if chunk.access_count() != 0 {
                        return Err(StorageError::PinUnpinDisbalance);
                    }
                }
            }
        }
        inner.chunk_map.clear();
        Ok(())
    }
}
