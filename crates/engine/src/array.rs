//! Array descriptors
//!
//! The catalog owns array schemas; the storage engine consumes only the
//! slice of them it needs: identity (unversioned and versioned ids, the
//! version sequence number), the attribute count, which attribute is the
//! empty-bitmap, and per-dimension chunk intervals for scan stepping and
//! chunk-number hashing.

use tessera_core::{ArrayUAID, ArrayVersionId, AttributeId, Coordinates, VersionId};

/// One array dimension as the storage engine sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionDesc {
    /// Lowest coordinate of the dimension.
    pub start: i64,
    /// Cells per chunk along this dimension.
    pub chunk_interval: i64,
    /// Cells of overlap shared with neighbouring chunks.
    pub chunk_overlap: i64,
}

impl DimensionDesc {
    /// Create a dimension without overlap.
    pub fn new(start: i64, chunk_interval: i64) -> Self {
        debug_assert!(chunk_interval > 0);
        DimensionDesc {
            start,
            chunk_interval,
            chunk_overlap: 0,
        }
    }

    /// Set the overlap width.
    pub fn with_overlap(mut self, chunk_overlap: i64) -> Self {
        debug_assert!(chunk_overlap >= 0);
        self.chunk_overlap = chunk_overlap;
        self
    }
}

/// Descriptor of one array version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayDesc {
    uaid: ArrayUAID,
    id: ArrayVersionId,
    version: VersionId,
    n_attributes: u32,
    empty_bitmap_attribute: Option<AttributeId>,
    dimensions: Vec<DimensionDesc>,
}

impl ArrayDesc {
    /// Create a descriptor.
    pub fn new(
        uaid: ArrayUAID,
        id: ArrayVersionId,
        version: VersionId,
        n_attributes: u32,
        empty_bitmap_attribute: Option<AttributeId>,
        dimensions: Vec<DimensionDesc>,
    ) -> Self {
        debug_assert!(n_attributes > 0);
        debug_assert!(!dimensions.is_empty());
        ArrayDesc {
            uaid,
            id,
            version,
            n_attributes,
            empty_bitmap_attribute,
            dimensions,
        }
    }

    /// Unversioned array id (data-store guid).
    pub fn uaid(&self) -> ArrayUAID {
        self.uaid
    }

    /// Versioned array id of this version.
    pub fn id(&self) -> ArrayVersionId {
        self.id
    }

    /// Version sequence number (1 for the first version).
    pub fn version(&self) -> VersionId {
        self.version
    }

    /// Attribute count, including the empty-bitmap attribute.
    pub fn n_attributes(&self) -> u32 {
        self.n_attributes
    }

    /// True when `att_id` is the empty-bitmap attribute.
    pub fn is_empty_bitmap_attribute(&self, att_id: AttributeId) -> bool {
        self.empty_bitmap_attribute == Some(att_id)
    }

    /// Dimension descriptors.
    pub fn dimensions(&self) -> &[DimensionDesc] {
        &self.dimensions
    }

    /// Chunk interval of the last (fastest-varying) dimension; the scan
    /// step of `find_next_chunk`.
    pub fn last_chunk_interval(&self) -> i64 {
        self.dimensions[self.dimensions.len() - 1].chunk_interval
    }

    /// True when any dimension carries chunk overlap. The stored element
    /// count of such arrays includes overlap cells, so logical counts
    /// must be re-derived from the encoded form.
    pub fn has_overlap(&self) -> bool {
        self.dimensions.iter().any(|d| d.chunk_overlap > 0)
    }

    /// Deterministic hash of a chunk's grid position, shared by every
    /// instance for replica placement. Depends only on the chunk grid,
    /// never on liveness or time.
    pub fn hashed_chunk_number(&self, coords: &Coordinates) -> u64 {
        debug_assert_eq!(coords.len(), self.dimensions.len());
        let mut hash = 0u64;
        for (dim, &coord) in self.dimensions.iter().zip(coords.iter()) {
            let cell = (coord - dim.start).div_euclid(dim.chunk_interval) as u64;
            hash = hash.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(cell);
        }
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::types::coords_from;

    fn desc() -> ArrayDesc {
        ArrayDesc::new(
            1,
            5,
            2,
            2,
            Some(1),
            vec![DimensionDesc::new(0, 10), DimensionDesc::new(0, 10)],
        )
    }

    #[test]
    fn accessors() {
        let d = desc();
        assert_eq!(d.uaid(), 1);
        assert_eq!(d.id(), 5);
        assert_eq!(d.version(), 2);
        assert!(d.is_empty_bitmap_attribute(1));
        assert!(!d.is_empty_bitmap_attribute(0));
        assert_eq!(d.last_chunk_interval(), 10);
    }

    #[test]
    fn hashed_chunk_number_is_grid_based() {
        let d = desc();
        // Same chunk, different cell: same hash.
        assert_eq!(
            d.hashed_chunk_number(&coords_from(&[0, 0])),
            d.hashed_chunk_number(&coords_from(&[0, 0])),
        );
        // Different chunks disagree.
        assert_ne!(
            d.hashed_chunk_number(&coords_from(&[0, 0])),
            d.hashed_chunk_number(&coords_from(&[0, 10])),
        );
        // Negative coordinates round toward negative infinity.
        assert_ne!(
            d.hashed_chunk_number(&coords_from(&[-10, 0])),
            d.hashed_chunk_number(&coords_from(&[0, 0])),
        );
    }
}
