//! The Tessera persistent storage engine
//!
//! Ties the on-disk primitives, the RLE codecs and the replication layer
//! together into the multi-version chunk store:
//!
//! - [`chunkmap`]: the two-level `UAID -> (StorageAddress -> entry)` map
//!   with descending-version MVCC ordering;
//! - [`cache`]: byte-accounted LRU bookkeeping over pinned chunks;
//! - [`engine`]: the [`StorageEngine`] itself — create/write/read/load,
//!   tombstones, version removal, pin/unpin, latches;
//! - [`recovery`]: storage description file, startup transaction
//!   recovery, chunk-map reconstruction;
//! - collaborator traits ([`catalog`], [`query`], [`array`]) consumed
//!   from the system catalog and query layers.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod array;
pub mod cache;
pub mod catalog;
pub mod chunkmap;
pub mod engine;
pub mod query;
pub mod recovery;
pub mod testing;

pub use array::{ArrayDesc, DimensionDesc};
pub use catalog::{ArrayLock, LockMode, SystemCatalog};
pub use chunkmap::{InnerChunkMap, InnerChunkMapEntry, PersistentChunk};
pub use engine::{ChunkMapEntryInfo, DiskInfo, ReplicaApplyError, StorageEngine, N_LATCHES};
pub use query::QueryContext;
