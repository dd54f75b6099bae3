//! # Packet Batch Compression
//!
//! Byte-to-byte codecs used on outgoing packet batches.
//!
//! ## Contract
//!
//! - [`Compressor::will_compress`] decides whether a buffer is worth the CPU.
//!   The batch pipeline uses it to pick between inline and worker compression.
//! - [`Compressor::compress`] is deterministic and always decodable by the
//!   paired [`Compressor::decompress`].
//! - [`Compressor::decompress`] refuses to produce more than the configured
//!   maximum, so a tiny hostile payload cannot expand into gigabytes.
//!
//! Compressors are immutable after construction and shared between the tick
//! thread and every worker behind an `Arc<dyn Compressor>`.

mod deflate;
mod lz4;

pub use deflate::DeflateCompressor;
pub use lz4::Lz4Compressor;

use crate::error::{CompressError, DecodeError};

/// Default zlib-style compression level for network batches.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Default size (bytes) at which batches start being compressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: i64 = 256;

/// Default cap on decompressed output (2 MiB).
pub const DEFAULT_MAX_DECOMPRESSION_SIZE: usize = 2 * 1024 * 1024;

/// A packet batch codec.
pub trait Compressor: Send + Sync {
    /// Returns true if `buffer` is large enough to be worth compressing.
    fn will_compress(&self, buffer: &[u8]) -> bool;

    /// Compresses `buffer`.
    fn compress(&self, buffer: &[u8]) -> Result<Vec<u8>, CompressError>;

    /// Compresses `buffer` into `out`, replacing its contents.
    ///
    /// Workers pass a long-lived scratch buffer so its allocation is reused
    /// across batches.
    fn compress_into(&self, buffer: &[u8], out: &mut Vec<u8>) -> Result<(), CompressError> {
        let compressed = self.compress(buffer)?;
        out.clear();
        out.extend_from_slice(&compressed);
        Ok(())
    }

    /// Short codec name, used to key per-codec worker state.
    fn name(&self) -> &'static str {
        "compressor"
    }

    /// Restores a buffer produced by [`Compressor::compress`].
    fn decompress(&self, payload: &[u8]) -> Result<Vec<u8>, DecodeError>;
}

/// Minimum buffer size for compression to kick in.
///
/// Configured as a signed integer: any negative value means "never".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompressionThreshold(Option<usize>);

impl CompressionThreshold {
    /// Never compress.
    pub const NEVER: Self = Self(None);

    /// Compress buffers of at least `bytes` bytes.
    #[must_use]
    pub const fn at(bytes: usize) -> Self {
        Self(Some(bytes))
    }

    /// Builds a threshold from a config value (negative = never).
    #[must_use]
    pub fn from_setting(value: i64) -> Self {
        usize::try_from(value).map_or(Self::NEVER, Self::at)
    }

    /// Returns true if a buffer of `len` bytes passes the threshold.
    #[inline]
    #[must_use]
    pub const fn admits(self, len: usize) -> bool {
        match self.0 {
            Some(threshold) => len >= threshold,
            None => false,
        }
    }

    /// Returns the threshold in bytes, or `None` when disabled.
    #[must_use]
    pub const fn bytes(self) -> Option<usize> {
        self.0
    }
}

impl Default for CompressionThreshold {
    fn default() -> Self {
        Self::from_setting(DEFAULT_COMPRESSION_THRESHOLD)
    }
}
