//! On-disk primitives for the Tessera storage engine
//!
//! This crate owns the four disk-backed structures underneath the chunk
//! map:
//!
//! - **Data stores** (`datastore`): one append-mostly byte file per
//!   unversioned array, with power-of-two best-fit free lists.
//! - **Descriptor file** (`descriptor`): a fixed-width slot file listing
//!   every chunk ever allocated, prefixed by a small super-header, with a
//!   free-slot set for reuse.
//! - **Transaction log** (`translog`): two rotating undo-log files of
//!   CRC-checked, fixed-size records, replayed at startup to roll back
//!   partial versions.
//! - **Compression codecs** (`codec`): the pluggable seam between raw
//!   chunk bytes and what the data store holds.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod datastore;
pub mod descriptor;
pub mod translog;

pub use codec::{compressor_for, Compressor, NoCompression, COMPRESSION_NONE};
pub use datastore::{DataStore, DataStores, MIN_ALLOC_SIZE};
pub use descriptor::{
    DescriptorFile, FreeHeaderSet, StorageHeader, STORAGE_HEADER_MAGIC, STORAGE_HEADER_SIZE,
};
pub use translog::{TransLog, TransLogRecord, TRANS_LOG_RECORD_SIZE};
