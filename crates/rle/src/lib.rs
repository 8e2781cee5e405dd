//! Run-length encoded chunk payloads and empty-bitmaps
//!
//! This crate implements the value representation used both on disk and
//! in memory by the storage engine. Two parallel codecs share one
//! storyline:
//!
//! - [`EmptyBitmap`]: runs of set bits over logical cell positions, each
//!   run mapping to a contiguous range of payload indexes;
//! - [`Payload`]: the cell values themselves, packed in stride-major
//!   order and split into segments of literal values, constant runs and
//!   null runs.
//!
//! Both offer cell-level iterators (walk one set bit / one value at a
//! time) and segment-level iterators (consume whole or partial runs),
//! plus `pack`/`unpack` for the on-disk form. Builders coalesce
//! consecutive equal values into runs while appending.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bitmap;
pub mod builder;
pub mod payload;
pub mod tile;
pub mod value;

pub use bitmap::{BitmapCellIterator, BitmapSegment, BitmapSegmentIterator, EmptyBitmap};
pub use builder::{BitmapBuilder, PayloadBuilder};
pub use payload::{Payload, PayloadCellIterator, PayloadSegment, PayloadSegmentIterator, SegmentWithLength};
pub use tile::{unpack_bitmap_tile, unpack_tile};
pub use value::Value;
