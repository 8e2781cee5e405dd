//! Chunk-descriptor file
//!
//! One fixed-width slot per chunk ever allocated, preceded by a small
//! super-header. Slots are rewritten in place at their `hdr_pos`; a slot
//! whose `arr_id` is zero is free and its offset sits in the free-header
//! set for reuse.
//!
//! # File layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ StorageHeader (64 bytes)                     │
//! ├──────────────────────────────────────────────┤
//! │ ChunkDescriptor slot 0 (224 bytes)           │
//! ├──────────────────────────────────────────────┤
//! │ ChunkDescriptor slot 1                       │
//! │ ...                                          │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The super-header records the bounds of the storage format the file
//! was written with; opening refuses files outside the compiled version.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tessera_core::{
    ChunkDescriptor, ChunkHeader, InstanceId, Result, StorageError, CHUNK_DESCRIPTOR_SIZE,
    CHUNK_HEADER_SIZE, STORAGE_FORMAT_VERSION,
};
use tracing::trace;

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Magic bytes opening the descriptor file.
pub const STORAGE_HEADER_MAGIC: u64 = u64::from_le_bytes(*b"TESSHDR1");

/// Serialized size of [`StorageHeader`]; descriptor slots start here.
pub const STORAGE_HEADER_SIZE: usize = 64;

/// The storage super-header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageHeader {
    /// File magic.
    pub magic: u64,
    /// Oldest storage format version present in the file.
    pub version_lower_bound: u32,
    /// Newest storage format version present in the file.
    pub version_upper_bound: u32,
    /// File offset one past the last slot ever written.
    pub curr_pos: u64,
    /// Identity of the instance owning this storage.
    pub instance_id: InstanceId,
    /// Number of slots ever allocated (free slots included).
    pub n_chunks: u64,
}

impl StorageHeader {
    /// A fresh header for an empty storage.
    pub fn initial() -> Self {
        StorageHeader {
            magic: STORAGE_HEADER_MAGIC,
            version_lower_bound: STORAGE_FORMAT_VERSION,
            version_upper_bound: STORAGE_FORMAT_VERSION,
            curr_pos: STORAGE_HEADER_SIZE as u64,
            instance_id: tessera_core::INVALID_INSTANCE,
            n_chunks: 0,
        }
    }

    /// Serialize to the fixed little-endian layout.
    pub fn to_bytes(&self) -> [u8; STORAGE_HEADER_SIZE] {
        let mut b = [0u8; STORAGE_HEADER_SIZE];
        b[0..8].copy_from_slice(&self.magic.to_le_bytes());
        b[8..12].copy_from_slice(&self.version_lower_bound.to_le_bytes());
        b[12..16].copy_from_slice(&self.version_upper_bound.to_le_bytes());
        b[16..24].copy_from_slice(&self.curr_pos.to_le_bytes());
        b[24..32].copy_from_slice(&self.instance_id.to_le_bytes());
        b[32..40].copy_from_slice(&self.n_chunks.to_le_bytes());
        b
    }

    /// Deserialize from the fixed little-endian layout.
    pub fn from_bytes(b: &[u8; STORAGE_HEADER_SIZE]) -> Self {
        StorageHeader {
            magic: u64::from_le_bytes(b[0..8].try_into().unwrap()),
            version_lower_bound: u32::from_le_bytes(b[8..12].try_into().unwrap()),
            version_upper_bound: u32::from_le_bytes(b[12..16].try_into().unwrap()),
            curr_pos: u64::from_le_bytes(b[16..24].try_into().unwrap()),
            instance_id: u64::from_le_bytes(b[24..32].try_into().unwrap()),
            n_chunks: u64::from_le_bytes(b[32..40].try_into().unwrap()),
        }
    }

    /// Validate magic and version bounds against the compiled format.
    pub fn validate(&self) -> Result<()> {
        if self.magic != STORAGE_HEADER_MAGIC {
            return Err(StorageError::InvalidStorageHeader);
        }
        if self.version_lower_bound != STORAGE_FORMAT_VERSION
            || self.version_upper_bound != STORAGE_FORMAT_VERSION
        {
            return Err(StorageError::MismatchedFormat {
                lower: self.version_lower_bound,
                upper: self.version_upper_bound,
                compiled: STORAGE_FORMAT_VERSION,
            });
        }
        Ok(())
    }
}

/// Offsets of free descriptor slots, reused lowest-first.
#[derive(Debug, Clone, Default)]
pub struct FreeHeaderSet {
    offsets: BTreeSet<u64>,
}

impl FreeHeaderSet {
    /// New empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a free slot.
    pub fn insert(&mut self, hdr_pos: u64) {
        debug_assert!(hdr_pos >= STORAGE_HEADER_SIZE as u64);
        self.offsets.insert(hdr_pos);
    }

    /// Take the lowest free slot, if any.
    pub fn pop(&mut self) -> Option<u64> {
        self.offsets.pop_first()
    }

    /// Membership test.
    pub fn contains(&self, hdr_pos: u64) -> bool {
        self.offsets.contains(&hdr_pos)
    }

    /// Number of free slots.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// True when no slots are free.
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// Handle on the descriptor file.
pub struct DescriptorFile {
    file: File,
    path: PathBuf,
}

impl DescriptorFile {
    /// Open or create the descriptor file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        Ok(DescriptorFile { file, path })
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take an exclusive advisory lock; refuses to share the storage with
    /// another process.
    #[cfg(unix)]
    pub fn lock_exclusive(&self) -> Result<()> {
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(StorageError::LockBusy(format!(
                "descriptor file {} is locked by another process",
                self.path.display()
            )));
        }
        Ok(())
    }

    /// Read the super-header; `None` when the file is empty (fresh
    /// database).
    pub fn read_super_header(&self) -> Result<Option<StorageHeader>> {
        let len = self.file.metadata()?.len();
        if len == 0 {
            return Ok(None);
        }
        if len < STORAGE_HEADER_SIZE as u64 {
            return Err(StorageError::corrupted("descriptor file shorter than header"));
        }
        let mut buf = [0u8; STORAGE_HEADER_SIZE];
        self.file.read_exact_at(&mut buf, 0)?;
        Ok(Some(StorageHeader::from_bytes(&buf)))
    }

    /// Rewrite the super-header in one write.
    pub fn write_super_header(&self, hdr: &StorageHeader) -> Result<()> {
        self.file.write_all_at(&hdr.to_bytes(), 0)?;
        Ok(())
    }

    /// Read the descriptor slot at `hdr_pos`. `None` on a short read
    /// (slot past the end of the file).
    pub fn read_descriptor(&self, hdr_pos: u64) -> Result<Option<ChunkDescriptor>> {
        let len = self.file.metadata()?.len();
        if hdr_pos + CHUNK_DESCRIPTOR_SIZE as u64 > len {
            return Ok(None);
        }
        let mut buf = [0u8; CHUNK_DESCRIPTOR_SIZE];
        self.file.read_exact_at(&mut buf, hdr_pos)?;
        Ok(Some(ChunkDescriptor::from_bytes(&buf)))
    }

    /// Write a full descriptor slot at `hdr_pos`.
    pub fn write_descriptor(&self, hdr_pos: u64, desc: &ChunkDescriptor) -> Result<()> {
        trace!(hdr_pos, arr_id = desc.hdr.arr_id, "writing chunk descriptor");
        self.file.write_all_at(&desc.to_bytes(), hdr_pos)?;
        Ok(())
    }

    /// Rewrite only the header part of a slot (used to free a slot by
    /// zeroing its `arr_id`).
    pub fn write_header(&self, hdr_pos: u64, hdr: &ChunkHeader) -> Result<()> {
        debug_assert!(hdr_pos >= STORAGE_HEADER_SIZE as u64);
        self.file.write_all_at(&hdr.to_bytes(), hdr_pos)?;
        Ok(())
    }

    /// Read only the header part of a slot.
    pub fn read_header(&self, hdr_pos: u64) -> Result<ChunkHeader> {
        let mut buf = [0u8; CHUNK_HEADER_SIZE];
        self.file.read_exact_at(&mut buf, hdr_pos)?;
        Ok(ChunkHeader::from_bytes(&buf))
    }

    /// Fsync the file.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
