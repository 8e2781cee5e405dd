//! Core types for the Tessera storage engine
//!
//! This crate defines the foundational vocabulary shared by every other
//! crate in the workspace:
//! - numeric identifiers (`ArrayUAID`, `ArrayVersionId`, `InstanceId`, ...)
//! - chunk coordinates and the `StorageAddress` ordering that drives MVCC
//! - the platform-independent on-disk chunk header and descriptor layouts
//! - the unified `StorageError` type and `Result` alias
//! - the `StorageConfig` knob set

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod config;
pub mod error;
pub mod header;
pub mod types;

pub use address::StorageAddress;
pub use config::StorageConfig;
pub use error::{Result, StorageError};
pub use header::{
    ChunkDescriptor, ChunkFlags, ChunkHeader, DiskPos, CHUNK_DESCRIPTOR_SIZE, CHUNK_HEADER_SIZE,
    MAX_DIMS, STORAGE_FORMAT_VERSION,
};
pub use types::{
    coords_from, ArrayUAID, ArrayVersionId, AttributeId, Coordinate, Coordinates, InstanceId,
    QueryId, VersionId, INVALID_ARRAY_ID, INVALID_INSTANCE,
};
