//! Per-array data stores
//!
//! Each unversioned array owns one append-mostly byte file at
//! `<base>/datastores/<guid>.data`. Space is tracked per file by a free
//! list keyed by power-of-two size class. Allocation rounds the request
//! up to the next class, reuses a freed block of that class when one
//! exists, splits a larger free block otherwise, and extends the file as
//! a last resort. Freed blocks return to their class; blocks are never
//! compacted or moved.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tessera_core::{Result, StorageError};
use tracing::{debug, trace};

#[cfg(unix)]
use std::os::unix::fs::FileExt;

/// Smallest block the allocator hands out.
pub const MIN_ALLOC_SIZE: u64 = 64;

/// One per-array byte file with its free lists.
pub struct DataStore {
    guid: u64,
    path: PathBuf,
    file: File,
    file_size: u64,
    /// Size class (log2 of block size) to free block offsets.
    free_lists: BTreeMap<u32, BTreeSet<u64>>,
    dirty: bool,
}

impl DataStore {
    /// Open or create the store file for `guid` under `dir`.
    pub fn open(dir: &Path, guid: u64) -> Result<Self> {
        let path = Self::file_path(dir, guid);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let file_size = file.metadata()?.len();
        trace!(guid, size = file_size, "opened data store");
        Ok(DataStore {
            guid,
            path,
            file,
            file_size,
            free_lists: BTreeMap::new(),
            dirty: false,
        })
    }

    /// Path of the store file for `guid`.
    pub fn file_path(dir: &Path, guid: u64) -> PathBuf {
        dir.join(format!("{guid}.data"))
    }

    /// Store guid (equals the array UAID).
    pub fn guid(&self) -> u64 {
        self.guid
    }

    /// Current file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Total bytes sitting on free lists.
    pub fn free_bytes(&self) -> u64 {
        self.free_lists
            .iter()
            .map(|(class, offsets)| (1u64 << class) * offsets.len() as u64)
            .sum()
    }

    fn size_class(requested: u64) -> u32 {
        requested
            .max(MIN_ALLOC_SIZE)
            .next_power_of_two()
            .trailing_zeros()
    }

    /// Allocate a block of at least `requested` bytes.
    ///
    /// Returns `(offset, allocated)`; `allocated` is the power-of-two
    /// block size actually reserved.
    pub fn allocate_space(&mut self, requested: u64) -> Result<(u64, u64)> {
        let class = Self::size_class(requested);
        let allocated = 1u64 << class;

        // Exact-class block available.
        if let Some(offset) = self.pop_free(class) {
            trace!(guid = self.guid, offset, allocated, "reused free block");
            return Ok((offset, allocated));
        }

        // Split the smallest larger free block, returning the remainders
        // to their classes.
        let larger = self
            .free_lists
            .range(class + 1..)
            .find(|(_, offsets)| !offsets.is_empty())
            .map(|(&c, _)| c);
        if let Some(big_class) = larger {
            let offset = self
                .pop_free(big_class)
                .expect("free list of the found class is non-empty");
            let mut c = big_class;
            while c > class {
                c -= 1;
                self.free_lists
                    .entry(c)
                    .or_default()
                    .insert(offset + (1u64 << c));
            }
            trace!(
                guid = self.guid,
                offset,
                allocated,
                from_class = big_class,
                "split free block"
            );
            return Ok((offset, allocated));
        }

        // Extend the file.
        let offset = self.file_size;
        self.file_size += allocated;
        self.file.set_len(self.file_size)?;
        self.dirty = true;
        trace!(guid = self.guid, offset, allocated, "extended data store");
        Ok((offset, allocated))
    }

    fn pop_free(&mut self, class: u32) -> Option<u64> {
        let offsets = self.free_lists.get_mut(&class)?;
        let offset = offsets.pop_first()?;
        Some(offset)
    }

    /// Return a block to its size class.
    pub fn free_chunk(&mut self, offset: u64, allocated: u64) {
        debug_assert!(allocated.is_power_of_two());
        debug_assert!(offset + allocated <= self.file_size);
        let class = allocated.trailing_zeros();
        let inserted = self.free_lists.entry(class).or_default().insert(offset);
        debug_assert!(inserted, "double free at offset {offset}");
        self.dirty = true;
    }

    /// Write `data` into a previously allocated block.
    pub fn write_data(&mut self, offset: u64, data: &[u8], allocated: u64) -> Result<()> {
        if data.len() as u64 > allocated {
            return Err(StorageError::corrupted(format!(
                "write of {} bytes into a {allocated}-byte block",
                data.len()
            )));
        }
        self.file.write_all_at(data, offset)?;
        self.dirty = true;
        Ok(())
    }

    /// Read `buf.len()` bytes from `offset`.
    pub fn read_data(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Fsync the file.
    pub fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.file.sync_all()?;
            self.dirty = false;
        }
        Ok(())
    }

    fn close(self, remove_from_disk: bool) -> Result<()> {
        let path = self.path.clone();
        drop(self.file);
        if remove_from_disk {
            debug!(guid = self.guid, path = %path.display(), "unlinking data store");
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Registry of open data stores keyed by guid.
pub struct DataStores {
    base_dir: PathBuf,
    stores: Mutex<FxHashMap<u64, Arc<Mutex<DataStore>>>>,
}

impl DataStores {
    /// Initialize the pool rooted at `base_dir` (created if missing).
    pub fn init(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(DataStores {
            base_dir,
            stores: Mutex::new(FxHashMap::default()),
        })
    }

    /// Directory holding the store files.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Get the store for `guid`, opening or creating its file on first
    /// use.
    pub fn get_or_create(&self, guid: u64) -> Result<Arc<Mutex<DataStore>>> {
        let mut stores = self.stores.lock();
        if let Some(ds) = stores.get(&guid) {
            return Ok(Arc::clone(ds));
        }
        let ds = Arc::new(Mutex::new(DataStore::open(&self.base_dir, guid)?));
        stores.insert(guid, Arc::clone(&ds));
        Ok(ds)
    }

    /// Close the store for `guid`, optionally unlinking its file. A
    /// missing store with `remove_from_disk` still removes any stale
    /// file.
    pub fn close_data_store(&self, guid: u64, remove_from_disk: bool) -> Result<()> {
        let removed = self.stores.lock().remove(&guid);
        match removed {
            Some(ds) => match Arc::try_unwrap(ds) {
                Ok(ds) => ds.into_inner().close(remove_from_disk)?,
                Err(ds) => {
                    // Still referenced elsewhere; unlink by path and let
                    // the last reference drop the handle.
                    if remove_from_disk {
                        let path = ds.lock().path.clone();
                        match std::fs::remove_file(path) {
                            Ok(()) => {}
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
            },
            None if remove_from_disk => {
                let path = DataStore::file_path(&self.base_dir, guid);
                match std::fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            None => {}
        }
        Ok(())
    }

    /// Guids of every open store.
    pub fn open_guids(&self) -> Vec<u64> {
        let mut guids: Vec<u64> = self.stores.lock().keys().copied().collect();
        guids.sort_unstable();
        guids
    }

    /// Fsync every open store.
    pub fn flush_all(&self) -> Result<()> {
        let stores: Vec<_> = self.stores.lock().values().cloned().collect();
        for ds in stores {
            ds.lock().flush()?;
        }
        Ok(())
    }
}
