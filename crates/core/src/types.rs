//! Identifier and coordinate types
//!
//! All identifiers are catalog-assigned integers. An array has one stable
//! unversioned id (`ArrayUAID`) and a monotonically increasing sequence of
//! versioned ids (`ArrayVersionId`); every chunk belongs to exactly one
//! versioned array.

use smallvec::SmallVec;

/// Unversioned array identifier, stable across versions.
///
/// The data-store file of an array is keyed by this id.
pub type ArrayUAID = u64;

/// Versioned array identifier; each committed write of an array creates a
/// new one, strictly greater than all previous ids of the same array.
pub type ArrayVersionId = u64;

/// Version sequence number within one array (1, 2, 3, ...).
pub type VersionId = u64;

/// Attribute identifier within an array schema.
pub type AttributeId = u32;

/// Cluster instance identifier.
pub type InstanceId = u64;

/// Query identifier, unique per coordinator.
pub type QueryId = u64;

/// A single dimension position.
pub type Coordinate = i64;

/// Chunk origin coordinates, one entry per array dimension.
///
/// Most arrays have few dimensions, so the inline capacity avoids heap
/// allocation on the hot lookup paths.
pub type Coordinates = SmallVec<[Coordinate; 4]>;

/// Sentinel for "no array" (used by flush-all style interfaces).
pub const INVALID_ARRAY_ID: ArrayUAID = u64::MAX;

/// Sentinel for an unassigned instance id.
pub const INVALID_INSTANCE: InstanceId = u64::MAX;

/// Build `Coordinates` from a slice.
pub fn coords_from(slice: &[Coordinate]) -> Coordinates {
    SmallVec::from_slice(slice)
}
