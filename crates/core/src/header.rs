//! On-disk chunk header and descriptor layouts
//!
//! These structures are written verbatim into the descriptor file and the
//! transaction log, so every field uses a fixed-width integer and the
//! byte order is little-endian throughout. This is a deliberate
//! portability limit: the files are not interchangeable with big-endian
//! hosts.
//!
//! # Chunk header layout (96 bytes)
//!
//! ```text
//! ┌──────┬──────┬─────────────────────────────────────────┐
//! │ off  │ size │ field                                   │
//! ├──────┼──────┼─────────────────────────────────────────┤
//! │ 0    │ 4    │ storage_version (u32)                   │
//! │ 4    │ 4    │ flags (u32)                             │
//! │ 8    │ 8    │ arr_id (u64)                            │
//! │ 16   │ 4    │ att_id (u32)                            │
//! │ 20   │ 2    │ n_coordinates (u16)                     │
//! │ 22   │ 2    │ compression_method (i16)                │
//! │ 24   │ 8    │ instance_id (u64)                       │
//! │ 32   │ 8    │ allocated_size (u64)                    │
//! │ 40   │ 8    │ compressed_size (u64)                   │
//! │ 48   │ 8    │ size (u64)                              │
//! │ 56   │ 8    │ n_elems (u64)                           │
//! │ 64   │ 24   │ pos: ds_guid, offs, hdr_pos (3 x u64)   │
//! │ 88   │ 8    │ reserved (zero)                         │
//! └──────┴──────┴─────────────────────────────────────────┘
//! ```
//!
//! A `ChunkDescriptor` is the header followed by `MAX_DIMS` i64
//! coordinate slots, of which the first `n_coordinates` are meaningful.

use crate::error::{Result, StorageError};
use crate::types::{ArrayVersionId, AttributeId, Coordinates, InstanceId};

/// Compiled storage format version. Opening a database whose header
/// carries bounds outside this version is refused.
pub const STORAGE_FORMAT_VERSION: u32 = 5;

/// Serialized size of [`ChunkHeader`].
pub const CHUNK_HEADER_SIZE: usize = 96;

/// Maximum number of dimensions a descriptor slot can carry.
pub const MAX_DIMS: usize = 16;

/// Serialized size of [`ChunkDescriptor`].
pub const CHUNK_DESCRIPTOR_SIZE: usize = CHUNK_HEADER_SIZE + MAX_DIMS * 8;

/// Chunk header flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkFlags(u32);

impl ChunkFlags {
    /// Deletion marker: the entry hides older versions and carries no data.
    pub const TOMBSTONE: u32 = 1 << 0;
    /// Payload is RLE-encoded.
    pub const RLE_CHUNK: u32 = 1 << 1;
    /// Chunk stores a sparse coordinate set.
    pub const SPARSE_CHUNK: u32 = 1 << 2;
    /// Payload is delta-encoded relative to a previous version.
    pub const DELTA_CHUNK: u32 = 1 << 3;

    /// No flags set.
    pub fn empty() -> Self {
        ChunkFlags(0)
    }

    /// Construct from raw bits.
    pub fn from_bits(bits: u32) -> Self {
        ChunkFlags(bits)
    }

    /// Raw bit value.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Test a flag bit.
    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    /// Set or clear a flag bit.
    pub fn set(&mut self, flag: u32, value: bool) {
        if value {
            self.0 |= flag;
        } else {
            self.0 &= !flag;
        }
    }
}

/// Location of a chunk's bytes on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiskPos {
    /// Data-store guid; equals the array UAID.
    pub ds_guid: u64,
    /// Byte offset of the chunk data inside the data store.
    pub offs: u64,
    /// Byte offset of the chunk's descriptor slot in the descriptor file.
    /// Zero means "not yet persisted".
    pub hdr_pos: u64,
}

/// Fixed, platform-independent chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Storage format version the chunk was written with.
    pub storage_version: u32,
    /// Flag bits (see [`ChunkFlags`]).
    pub flags: ChunkFlags,
    /// Versioned array id.
    pub arr_id: ArrayVersionId,
    /// Attribute id.
    pub att_id: AttributeId,
    /// Number of meaningful coordinates.
    pub n_coordinates: u16,
    /// Compression method id; negative means undefined.
    pub compression_method: i16,
    /// Instance where the chunk originated.
    pub instance_id: InstanceId,
    /// Bytes allocated in the data store (power-of-two class).
    pub allocated_size: u64,
    /// Bytes actually written (compressed size).
    pub compressed_size: u64,
    /// Uncompressed payload size.
    pub size: u64,
    /// Element count recorded by the writer. For chunks with overlap this
    /// includes overlap cells; the authoritative logical count comes from
    /// the decoded bitmap.
    pub n_elems: u64,
    /// On-disk location.
    pub pos: DiskPos,
}

impl Default for ChunkHeader {
    fn default() -> Self {
        ChunkHeader {
            storage_version: STORAGE_FORMAT_VERSION,
            flags: ChunkFlags::empty(),
            arr_id: 0,
            att_id: 0,
            n_coordinates: 0,
            compression_method: 0,
            instance_id: 0,
            allocated_size: 0,
            compressed_size: 0,
            size: 0,
            n_elems: 0,
            pos: DiskPos::default(),
        }
    }
}

impl ChunkHeader {
    /// True if this header marks a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.flags.contains(ChunkFlags::TOMBSTONE)
    }

    /// Serialize to the fixed little-endian layout.
    pub fn to_bytes(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut b = [0u8; CHUNK_HEADER_SIZE];
        b[0..4].copy_from_slice(&self.storage_version.to_le_bytes());
        b[4..8].copy_from_slice(&self.flags.bits().to_le_bytes());
        b[8..16].copy_from_slice(&self.arr_id.to_le_bytes());
        b[16..20].copy_from_slice(&self.att_id.to_le_bytes());
        b[20..22].copy_from_slice(&self.n_coordinates.to_le_bytes());
        b[22..24].copy_from_slice(&self.compression_method.to_le_bytes());
        b[24..32].copy_from_slice(&self.instance_id.to_le_bytes());
        b[32..40].copy_from_slice(&self.allocated_size.to_le_bytes());
        b[40..48].copy_from_slice(&self.compressed_size.to_le_bytes());
        b[48..56].copy_from_slice(&self.size.to_le_bytes());
        b[56..64].copy_from_slice(&self.n_elems.to_le_bytes());
        b[64..72].copy_from_slice(&self.pos.ds_guid.to_le_bytes());
        b[72..80].copy_from_slice(&self.pos.offs.to_le_bytes());
        b[80..88].copy_from_slice(&self.pos.hdr_pos.to_le_bytes());
        b
    }

    /// Deserialize from the fixed little-endian layout.
    pub fn from_bytes(b: &[u8; CHUNK_HEADER_SIZE]) -> Self {
        let u32le = |r: std::ops::Range<usize>| u32::from_le_bytes(b[r].try_into().unwrap());
        let u64le = |r: std::ops::Range<usize>| u64::from_le_bytes(b[r].try_into().unwrap());
        ChunkHeader {
            storage_version: u32le(0..4),
            flags: ChunkFlags::from_bits(u32le(4..8)),
            arr_id: u64le(8..16),
            att_id: u32le(16..20),
            n_coordinates: u16::from_le_bytes(b[20..22].try_into().unwrap()),
            compression_method: i16::from_le_bytes(b[22..24].try_into().unwrap()),
            instance_id: u64le(24..32),
            allocated_size: u64le(32..40),
            compressed_size: u64le(40..48),
            size: u64le(48..56),
            n_elems: u64le(56..64),
            pos: DiskPos {
                ds_guid: u64le(64..72),
                offs: u64le(72..80),
                hdr_pos: u64le(80..88),
            },
        }
    }
}

/// A chunk header plus its fixed-capacity coordinate slots; the unit of
/// storage in the descriptor file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// The chunk header.
    pub hdr: ChunkHeader,
    /// Coordinate slots; entries past `hdr.n_coordinates` are zero.
    pub coords: [i64; MAX_DIMS],
}

impl Default for ChunkDescriptor {
    fn default() -> Self {
        ChunkDescriptor {
            hdr: ChunkHeader::default(),
            coords: [0; MAX_DIMS],
        }
    }
}

impl ChunkDescriptor {
    /// Build a descriptor from a header and live coordinates.
    ///
    /// Fails with `ChunkOutOfBoundaries` if the coordinate count exceeds
    /// the slot capacity.
    pub fn new(hdr: ChunkHeader, coords: &Coordinates) -> Result<Self> {
        if coords.len() > MAX_DIMS {
            return Err(StorageError::ChunkOutOfBoundaries {
                dims: coords.len(),
                max: MAX_DIMS,
            });
        }
        let mut slots = [0i64; MAX_DIMS];
        slots[..coords.len()].copy_from_slice(coords);
        let mut hdr = hdr;
        hdr.n_coordinates = coords.len() as u16;
        Ok(ChunkDescriptor { hdr, coords: slots })
    }

    /// Meaningful coordinates of this descriptor.
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::from_slice(&self.coords[..self.hdr.n_coordinates as usize])
    }

    /// Serialize to the fixed little-endian layout.
    pub fn to_bytes(&self) -> [u8; CHUNK_DESCRIPTOR_SIZE] {
        let mut b = [0u8; CHUNK_DESCRIPTOR_SIZE];
        b[..CHUNK_HEADER_SIZE].copy_from_slice(&self.hdr.to_bytes());
        for (i, c) in self.coords.iter().enumerate() {
            let at = CHUNK_HEADER_SIZE + i * 8;
            b[at..at + 8].copy_from_slice(&c.to_le_bytes());
        }
        b
    }

    /// Deserialize from the fixed little-endian layout.
    pub fn from_bytes(b: &[u8; CHUNK_DESCRIPTOR_SIZE]) -> Self {
        let hdr_bytes: [u8; CHUNK_HEADER_SIZE] = b[..CHUNK_HEADER_SIZE].try_into().unwrap();
        let mut coords = [0i64; MAX_DIMS];
        for (i, c) in coords.iter_mut().enumerate() {
            let at = CHUNK_HEADER_SIZE + i * 8;
            *c = i64::from_le_bytes(b[at..at + 8].try_into().unwrap());
        }
        ChunkDescriptor {
            hdr: ChunkHeader::from_bytes(&hdr_bytes),
            coords,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::coords_from;

    fn sample_header() -> ChunkHeader {
        let mut flags = ChunkFlags::empty();
        flags.set(ChunkFlags::RLE_CHUNK, true);
        ChunkHeader {
            storage_version: STORAGE_FORMAT_VERSION,
            flags,
            arr_id: 42,
            att_id: 3,
            n_coordinates: 2,
            compression_method: 0,
            instance_id: 7,
            allocated_size: 4096,
            compressed_size: 3000,
            size: 3000,
            n_elems: 512,
            pos: DiskPos {
                ds_guid: 11,
                offs: 8192,
                hdr_pos: 64,
            },
        }
    }

    #[test]
    fn header_roundtrip() {
        let hdr = sample_header();
        let parsed = ChunkHeader::from_bytes(&hdr.to_bytes());
        assert_eq!(parsed, hdr);
    }

    #[test]
    fn descriptor_roundtrip() {
        let desc = ChunkDescriptor::new(sample_header(), &coords_from(&[10, -20])).unwrap();
        let parsed = ChunkDescriptor::from_bytes(&desc.to_bytes());
        assert_eq!(parsed, desc);
        assert_eq!(parsed.coordinates().as_slice(), &[10, -20]);
    }

    #[test]
    fn descriptor_rejects_too_many_dims() {
        let coords = coords_from(&[0; MAX_DIMS + 1]);
        let err = ChunkDescriptor::new(sample_header(), &coords).unwrap_err();
        assert!(matches!(err, StorageError::ChunkOutOfBoundaries { .. }));
    }

    #[test]
    fn tombstone_flag() {
        let mut hdr = sample_header();
        assert!(!hdr.is_tombstone());
        hdr.flags.set(ChunkFlags::TOMBSTONE, true);
        assert!(hdr.is_tombstone());
        hdr.flags.set(ChunkFlags::TOMBSTONE, false);
        assert!(!hdr.is_tombstone());
    }
}
