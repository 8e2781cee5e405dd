//! Startup and recovery
//!
//! Opening storage runs a fixed sequence: parse (or create) the storage
//! description file, lock and validate the descriptor file, roll back
//! whatever the catalog's leftover array locks say was in flight, then
//! walk every descriptor slot to rebuild the chunk map, garbage
//! collecting chunks that no retained version can see and chunks of
//! arrays the catalog no longer knows. Data stores are flushed at the
//! end so reclaimed blocks stay reclaimed.

use crate::catalog::{LockMode, SystemCatalog};
use crate::chunkmap::{InnerChunkMapEntry, PersistentChunk};
use crate::engine::{EngineInner, StorageEngine};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tessera_core::{
    ArrayUAID, Result, StorageAddress, StorageConfig, StorageError, VersionId,
    CHUNK_DESCRIPTOR_SIZE,
};
use tessera_replication::distribution::ReplicaPlacement;
use tessera_storage::datastore::DataStores;
use tessera_storage::descriptor::{DescriptorFile, StorageHeader, STORAGE_HEADER_SIZE};
use tessera_storage::translog::TransLog;
use tracing::{debug, error, info, warn};

/// Default transaction-log size limit in mebibytes, used when creating a
/// fresh storage description file.
pub const DEFAULT_TRANS_LOG_LIMIT_MB: u64 = 1024;

const MIB: u64 = 1024 * 1024;

/// Paths resolved from the storage description file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDescription {
    /// Directory the description file lives in; everything else is
    /// relative to it.
    pub database_dir: PathBuf,
    /// Descriptor (chunk-map) file path.
    pub header_path: PathBuf,
    /// Transaction log base path (`_1`/`_2` are appended).
    pub log_path: PathBuf,
    /// Transaction log size limit in bytes.
    pub log_size_limit: u64,
}

/// Read the two-line storage description file, creating it with
/// defaults when missing.
///
/// Line 1 is the descriptor-file name; line 2 is
/// `<log-limit-MiB> <log-name>`. Relative names resolve against the
/// description file's directory.
pub fn init_storage_description(path: &Path) -> Result<StorageDescription> {
    let database_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    if !path.exists() {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("storage");
        fs::create_dir_all(&database_dir)?;
        fs::write(
            path,
            format!("{name}.header\n{DEFAULT_TRANS_LOG_LIMIT_MB} {name}.log\n"),
        )?;
        info!(path = %path.display(), "created storage description file");
        return Ok(StorageDescription {
            header_path: database_dir.join(format!("{name}.header")),
            log_path: database_dir.join(format!("{name}.log")),
            log_size_limit: DEFAULT_TRANS_LOG_LIMIT_MB * MIB,
            database_dir,
        });
    }

    let text = fs::read_to_string(path)?;
    let mut lines = text.lines();
    let header_line = lines
        .next()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .ok_or_else(|| StorageError::corrupted("storage description: missing header line"))?;
    let log_line = lines
        .next()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .ok_or_else(|| StorageError::corrupted("storage description: missing log line"))?;
    let (limit_str, log_name) = log_line
        .split_once(char::is_whitespace)
        .ok_or_else(|| StorageError::corrupted("storage description: malformed log line"))?;
    let limit_mb: u64 = limit_str
        .parse()
        .map_err(|_| StorageError::corrupted("storage description: bad log size limit"))?;

    let resolve = |name: &str| -> PathBuf {
        let p = Path::new(name);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            database_dir.join(p)
        }
    };
    Ok(StorageDescription {
        header_path: resolve(header_line),
        log_path: resolve(log_name.trim()),
        log_size_limit: limit_mb * MIB,
        database_dir,
    })
}

impl StorageEngine {
    /// Open the storage engine: description file, descriptor file lock,
    /// super-header validation, transaction recovery, chunk-map rebuild.
    pub fn open(config: StorageConfig, catalog: Arc<dyn SystemCatalog>) -> Result<StorageEngine> {
        let description = init_storage_description(&config.storage_path)?;
        let desc_file = DescriptorFile::open(&description.header_path)?;
        #[cfg(unix)]
        desc_file.lock_exclusive()?;
        let translog = TransLog::open(&description.log_path, description.log_size_limit)?;
        let datastores = DataStores::init(description.database_dir.join("datastores"))?;

        let n_instances = catalog.number_of_instances();
        let placement = ReplicaPlacement::new(n_instances, config.redundancy)?;

        let existing = desc_file.read_super_header()?;
        let fresh = match &existing {
            None => true,
            // A header that never got past initialization is treated as
            // a fresh database.
            Some(h) => h.magic == tessera_storage::descriptor::STORAGE_HEADER_MAGIC
                && h.curr_pos < STORAGE_HEADER_SIZE as u64,
        };
        let hdr = if fresh {
            StorageHeader::initial()
        } else {
            let h = existing.expect("non-fresh header exists");
            h.validate()?;
            h
        };

        let engine = StorageEngine::assemble(
            config, desc_file, datastores, translog, hdr, placement, catalog,
        );
        if fresh {
            info!("initializing storage header");
            let inner = engine.inner.lock();
            engine.desc_file.write_super_header(&inner.hdr)?;
        } else {
            engine.do_txn_recovery_on_startup()?;
            engine.init_chunk_map()?;
            // Persist free-list updates made during recovery.
            engine.datastores.flush_all()?;
        }
        Ok(engine)
    }

    /// Roll back whatever the catalog's leftover locks say was in
    /// flight: coordinator locks first, then worker locks, deleting each
    /// group once replayed.
    pub(crate) fn do_txn_recovery_on_startup(&self) -> Result<()> {
        let instance = self.instance_id();
        let (coord_locks, worker_locks) = self.catalog.read_array_locks(instance);

        let mut undo: BTreeMap<ArrayUAID, VersionId> = BTreeMap::new();
        for lock in &coord_locks {
            match lock.mode {
                LockMode::Create | LockMode::Write => {
                    undo.insert(lock.array_uaid, lock.rollback_to);
                }
                // Array removal is finished by the catalog; the chunk-map
                // walk below reclaims whatever is left on disk.
                LockMode::Remove | LockMode::Read => {}
            }
        }
        self.rollback(&undo)?;
        self.catalog.delete_coord_locks(instance);

        undo.clear();
        for lock in &worker_locks {
            match lock.mode {
                LockMode::Create | LockMode::Write => {
                    undo.insert(lock.array_uaid, lock.rollback_to);
                }
                LockMode::Remove | LockMode::Read => {}
            }
        }
        self.rollback(&undo)?;
        self.catalog.delete_worker_locks(instance);
        Ok(())
    }

    /// Walk the descriptor file slot by slot and rebuild the in-memory
    /// chunk map, reclaiming dead chunks and chunks of removed arrays.
    pub(crate) fn init_chunk_map(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        debug!(n_chunks = inner.hdr.n_chunks, "reading chunk map");

        let n_chunks = inner.hdr.n_chunks;
        let mut chunk_pos = STORAGE_HEADER_SIZE as u64;
        let mut existent: FxHashMap<ArrayUAID, bool> = FxHashMap::default();
        let mut oldest_versions: FxHashMap<ArrayUAID, u64> = FxHashMap::default();
        let mut clones: FxHashSet<(u64, u64)> = FxHashSet::default();

        for i in 0..n_chunks {
            let this_pos = chunk_pos;
            chunk_pos += CHUNK_DESCRIPTOR_SIZE as u64;

            let Some(desc) = self.desc_file.read_descriptor(this_pos)? else {
                error!(
                    slot = i,
                    pos = this_pos,
                    n_chunks,
                    "descriptor file shorter than the super-header claims"
                );
                inner.hdr.curr_pos = this_pos;
                inner.hdr.n_chunks = i;
                chunk_pos = this_pos;
                break;
            };

            if desc.hdr.pos.hdr_pos != this_pos {
                warn!(
                    slot = i,
                    pos = this_pos,
                    recorded = desc.hdr.pos.hdr_pos,
                    "descriptor slot position mismatch, freeing slot"
                );
                inner.free_headers.insert(this_pos);
                continue;
            }
            if desc.hdr.arr_id == 0 {
                inner.free_headers.insert(this_pos);
                continue;
            }

            let uaid = desc.hdr.pos.ds_guid;
            let exists = *existent.entry(uaid).or_insert_with(|| {
                let exists = self.catalog.array_exists(uaid);
                if !exists {
                    // The whole array is gone; take its data store with it.
                    if let Err(e) = self.datastores.close_data_store(uaid, true) {
                        warn!(uaid, error = %e, "could not remove orphan data store");
                    }
                }
                exists
            });
            if !exists {
                let mut freed = desc.hdr;
                freed.arr_id = 0;
                self.desc_file.write_header(this_pos, &freed)?;
                inner.free_headers.insert(this_pos);
                continue;
            }

            let oldest_version = *oldest_versions
                .entry(uaid)
                .or_insert_with(|| self.catalog.oldest_array_version(uaid));
            let coords = desc.coordinates();
            let addr = StorageAddress::new(desc.hdr.arr_id, desc.hdr.att_id, coords.clone());

            // Which entry serves this coordinate at the oldest retained
            // version right now?
            let oldest_probe = StorageAddress::new(oldest_version, addr.att_id, coords.clone());
            let oldest_live: Option<(StorageAddress, InnerChunkMapEntry)> = inner
                .chunk_map
                .get(&uaid)
                .and_then(|map| {
                    map.range(oldest_probe.clone()..)
                        .next()
                        .filter(|(k, _)| k.same_base(&oldest_probe))
                        .map(|(k, e)| (k.clone(), e.clone()))
                });
            let oldest_live_arr = oldest_live.as_ref().map(|(k, _)| k.arr_id).unwrap_or(0);

            if desc.hdr.arr_id > oldest_live_arr {
                // Live: insert into the map.
                if !desc.hdr.is_tombstone() && !clones.insert((uaid, desc.hdr.pos.offs)) {
                    let message = format!(
                        "two live descriptors share data-store block {uaid}:{}",
                        desc.hdr.pos.offs
                    );
                    if self.config.enforce_data_integrity {
                        return Err(StorageError::DuplicateChunkAddr(message));
                    }
                    warn!(slot = i, "{message}; keeping the first entry");
                    inner.free_headers.insert(this_pos);
                    continue;
                }
                let entry = if desc.hdr.is_tombstone() {
                    InnerChunkMapEntry::Tombstone { hdr_pos: this_pos }
                } else {
                    InnerChunkMapEntry::Chunk(Arc::new(PersistentChunk::from_descriptor(
                        uaid,
                        addr.clone(),
                        desc.hdr,
                    )))
                };
                let replaced = inner
                    .chunk_map
                    .entry(uaid)
                    .or_default()
                    .insert(addr.clone(), entry);
                if replaced.is_some() {
                    return Err(StorageError::DuplicateChunkAddr(format!(
                        "two descriptors map to address {addr}"
                    )));
                }

                // Inserting this chunk may have obsoleted the previous
                // oldest-live entry at the same coordinate.
                if oldest_live_arr != 0 && desc.hdr.arr_id <= oldest_version {
                    let (victim_key, victim_entry) = oldest_live.expect("arr checked non-zero");
                    let ds = self.datastores.get_or_create(uaid)?;
                    let EngineInner {
                        chunk_map,
                        free_headers,
                        ..
                    } = &mut *inner;
                    self.mark_chunk_as_free(free_headers, &victim_entry, Some(&ds))?;
                    if let Some(map) = chunk_map.get_mut(&uaid) {
                        map.remove(&victim_key);
                    }
                }
            } else {
                // Dead on arrival: no retained version can see it.
                let mut freed = desc.hdr;
                freed.arr_id = 0;
                self.desc_file.write_header(this_pos, &freed)?;
                inner.free_headers.insert(this_pos);
                if !desc.hdr.is_tombstone() {
                    let ds = self.datastores.get_or_create(uaid)?;
                    ds.lock().free_chunk(desc.hdr.pos.offs, desc.hdr.allocated_size);
                }
            }
        }

        if chunk_pos != inner.hdr.curr_pos {
            warn!(
                walked = chunk_pos,
                recorded = inner.hdr.curr_pos,
                "descriptor file position disagrees with super-header"
            );
            if chunk_pos > inner.hdr.curr_pos {
                inner.hdr.curr_pos = chunk_pos;
            }
        }
        Ok(())
    }

}
