//! Compression codec seam
//!
//! Chunk bytes pass through a [`Compressor`] before hitting the data
//! store. Codecs are pluggable by method id; the engine stores the id in
//! the chunk header and looks the codec back up on read. Method 0 is the
//! no-op codec and is always available. The engine's "store raw when
//! compression does not shrink" rule lives above this seam.

mod identity;
mod traits;

pub use identity::NoCompression;
pub use traits::Compressor;

use tessera_core::{Result, StorageError};

/// Method id of the no-op codec.
pub const COMPRESSION_NONE: i16 = 0;

static NO_COMPRESSION: NoCompression = NoCompression;

/// Look up the codec for a method id.
///
/// Negative ids are undefined by contract and fail with
/// `CompressMethodUndefined`; unknown positive ids fail the same way so a
/// build without an optional codec refuses data it cannot read back.
pub fn compressor_for(method: i16) -> Result<&'static dyn Compressor> {
    match method {
        COMPRESSION_NONE => Ok(&NO_COMPRESSION),
        _ => Err(StorageError::CompressMethodUndefined),
    }
}
