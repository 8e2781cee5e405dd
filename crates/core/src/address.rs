//! Chunk addressing
//!
//! A `StorageAddress` names one chunk of one attribute of one array
//! version. The ordering is the backbone of multi-version lookups: within
//! the per-array map, addresses sort by attribute, then coordinates, then
//! *descending* version id, so a range scan starting at
//! `(att, coords, version = V)` lands on the newest entry with version
//! `<= V` for that coordinate. A map for one array looks like:
//!
//! ```text
//! att_id = 0
//!   coords = {0,0}
//!     arr_id = 3 -> CHUNK      (exists in all versions >= 3)
//!     arr_id = 1 -> CHUNK      (visible in versions 1 and 2)
//!   coords = {0,10}
//!     arr_id = 2 -> TOMBSTONE  (deleted at version 2)
//!     arr_id = 1 -> CHUNK      (visible only in version 1)
//! att_id = 1
//!   ...
//! ```
//!
//! An address with zero-length coordinates sorts before every chunk of its
//! attribute; scan primitives use it as "start of attribute" and set it
//! back to zero length to signal "end of array".

use crate::types::{ArrayVersionId, AttributeId, Coordinates};
use std::cmp::Ordering;
use std::fmt;

/// Address of a chunk in persistent storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct StorageAddress {
    /// Versioned array id wherein this chunk first appeared.
    pub arr_id: ArrayVersionId,
    /// Attribute the chunk belongs to.
    pub att_id: AttributeId,
    /// Chunk origin coordinates.
    pub coords: Coordinates,
}

impl StorageAddress {
    /// Create an address.
    pub fn new(arr_id: ArrayVersionId, att_id: AttributeId, coords: Coordinates) -> Self {
        StorageAddress {
            arr_id,
            att_id,
            coords,
        }
    }

    /// Start-of-attribute sentinel: empty coordinates sort first.
    pub fn attribute_start(arr_id: ArrayVersionId, att_id: AttributeId) -> Self {
        StorageAddress {
            arr_id,
            att_id,
            coords: Coordinates::new(),
        }
    }

    /// True if `other` names the same `(attribute, coordinates)` pair,
    /// regardless of version.
    pub fn same_base(&self, other: &StorageAddress) -> bool {
        self.att_id == other.att_id && self.coords == other.coords
    }
}

impl Ord for StorageAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.att_id
            .cmp(&other.att_id)
            .then_with(|| self.coords.len().cmp(&other.coords.len()))
            .then_with(|| self.coords.cmp(&other.coords))
            // Reverse ordering keeps the most recent version first.
            .then_with(|| other.arr_id.cmp(&self.arr_id))
    }
}

impl PartialOrd for StorageAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for StorageAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "v{}/att{}@{:?}",
            self.arr_id,
            self.att_id,
            self.coords.as_slice()
        )
    }
}
