//! Codec trait.

use tessera_core::Result;

/// A chunk compression codec.
///
/// Implementations must be deterministic and side-effect free; the same
/// input always produces the same output.
pub trait Compressor: Send + Sync {
    /// Stable method id recorded in chunk headers.
    fn method(&self) -> i16;

    /// Human-readable codec name for logs.
    fn name(&self) -> &'static str;

    /// Compress `src`. May return output no smaller than the input; the
    /// caller decides whether to keep it.
    fn compress(&self, src: &[u8]) -> Vec<u8>;

    /// Decompress `src` into exactly `decompressed_size` bytes. Fails
    /// with `CantDecompressChunk` when the output size disagrees.
    fn decompress(&self, src: &[u8], decompressed_size: usize) -> Result<Vec<u8>>;
}
