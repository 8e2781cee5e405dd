//! Error types for the Tessera storage engine
//!
//! One unified error enum serves the whole workspace. Variants map
//! one-to-one onto the failure kinds the engine can observe, from on-disk
//! corruption to cache-protocol misuse. `thiserror` provides `Display`
//! and `Error` impls.

use crate::types::{ArrayUAID, InstanceId};
use std::io;
use thiserror::Error;

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Error type for the storage engine.
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error from the underlying filesystem.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// An on-disk structure failed validation (bad magic, truncated
    /// segment array, impossible field value).
    #[error("storage corrupted: {0}")]
    StorageCorrupted(String),

    /// The super-header magic does not match; refusing to open.
    #[error("invalid storage header magic")]
    InvalidStorageHeader,

    /// The storage format version bounds are outside the compiled range.
    #[error("storage format version [{lower}, {upper}] not supported by compiled version {compiled}")]
    MismatchedFormat {
        /// Lower bound recorded in the file.
        lower: u32,
        /// Upper bound recorded in the file.
        upper: u32,
        /// Version this build understands.
        compiled: u32,
    },

    /// Requested chunk is not present at the requested version.
    #[error("chunk not found")]
    ChunkNotFound,

    /// A chunk already exists at the given address.
    #[error("chunk already exists at {0}")]
    ChunkAlreadyExists(String),

    /// Two live descriptors resolve to the same data-store location.
    #[error("duplicate chunk address: {0}")]
    DuplicateChunkAddr(String),

    /// Attempt to use chunk data before it has been loaded.
    #[error("access to raw chunk of array {0}")]
    AccessToRawChunk(ArrayUAID),

    /// Coordinate count exceeds the descriptor capacity.
    #[error("chunk has {dims} dimensions, maximum is {max}")]
    ChunkOutOfBoundaries {
        /// Requested dimensionality.
        dims: usize,
        /// Compiled maximum.
        max: usize,
    },

    /// Compression method id is undefined (negative).
    #[error("compression method is not defined")]
    CompressMethodUndefined,

    /// Decompression produced a size different from the recorded one.
    #[error("cannot decompress chunk: expected {expected} bytes, got {got}")]
    CantDecompressChunk {
        /// Uncompressed size recorded in the header.
        expected: u64,
        /// Size the codec produced.
        got: u64,
    },

    /// Memory allocation for a chunk buffer failed.
    #[error("cannot allocate {0} bytes")]
    CantAllocateMemory(u64),

    /// A bounded queue is full.
    #[error("queue overflow: {0}")]
    Overflow(String),

    /// Transport-level failure talking to a peer.
    #[error("connection error to instance {0}")]
    ConnectionError(InstanceId),

    /// The target instance is known to be offline.
    #[error("instance {0} is offline")]
    InstanceOffline(InstanceId),

    /// Not enough live replicas to satisfy the operation.
    #[error("no quorum: {alive} of {required} replicas reachable")]
    NoQuorum {
        /// Replicas currently reachable.
        alive: usize,
        /// Replicas required.
        required: usize,
    },

    /// The unversioned array does not exist in the catalog.
    #[error("array {0} does not exist")]
    ArrayDoesntExist(ArrayUAID),

    /// An array lock is held by another query.
    #[error("array lock busy: {0}")]
    LockBusy(String),

    /// An array lock could not be upgraded.
    #[error("cannot increment array lock: {0}")]
    CantIncrementLock(String),

    /// Iterator positioned past the last chunk.
    #[error("no current chunk")]
    NoCurrentChunk,

    /// Iterator positioned past the last element.
    #[error("no current element")]
    NoCurrentElement,

    /// A chunk was unpinned more times than pinned.
    #[error("pin/unpin disbalance")]
    PinUnpinDisbalance,

    /// The owning query was cancelled.
    #[error("query {0} cancelled")]
    QueryCancelled(u64),
}

impl StorageError {
    /// Corruption constructor.
    pub fn corrupted(message: impl Into<String>) -> Self {
        StorageError::StorageCorrupted(message.into())
    }

    /// Queue-overflow constructor.
    pub fn overflow(message: impl Into<String>) -> Self {
        StorageError::Overflow(message.into())
    }

    /// True for errors that indicate on-disk damage and should refuse the
    /// open or surface to the operator.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StorageError::StorageCorrupted(_)
                | StorageError::InvalidStorageHeader
                | StorageError::MismatchedFormat { .. }
                | StorageError::DuplicateChunkAddr(_)
                | StorageError::CantDecompressChunk { .. }
        )
    }

    /// True for errors that may succeed on retry once the cluster or the
    /// queue drains (scheduled-retry class).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::Overflow(_) | StorageError::LockBusy(_)
        )
    }

    /// True for errors that must abort the process-level open.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StorageError::InvalidStorageHeader | StorageError::MismatchedFormat { .. }
        )
    }
}
