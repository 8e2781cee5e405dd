//! No-op codec.

use super::traits::Compressor;
use tessera_core::{Result, StorageError};

/// Pass-through codec: output equals input.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompression;

impl Compressor for NoCompression {
    fn method(&self) -> i16 {
        0
    }

    fn name(&self) -> &'static str {
        "none"
    }

    fn compress(&self, src: &[u8]) -> Vec<u8> {
        src.to_vec()
    }

    fn decompress(&self, src: &[u8], decompressed_size: usize) -> Result<Vec<u8>> {
        if src.len() != decompressed_size {
            return Err(StorageError::CantDecompressChunk {
                expected: decompressed_size as u64,
                got: src.len() as u64,
            });
        }
        Ok(src.to_vec())
    }
}
