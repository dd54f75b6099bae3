//! Raw deflate codec, the protocol's default batch compression.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use super::{CompressionThreshold, Compressor};
use crate::error::{CompressError, DecodeError};

/// Raw deflate (no zlib header) compressor.
///
/// Buffers below the threshold are emitted as stored blocks rather than passed
/// through untouched, so the receiving side can always inflate a batch.
#[derive(Clone, Debug)]
pub struct DeflateCompressor {
    level: u32,
    threshold: CompressionThreshold,
    max_decompression_size: usize,
}

impl DeflateCompressor {
    /// Creates a compressor.
    ///
    /// `level` is clamped to the deflate range `0..=9`.
    #[must_use]
    pub fn new(level: u32, threshold: CompressionThreshold, max_decompression_size: usize) -> Self {
        Self {
            level: level.min(9),
            threshold,
            max_decompression_size,
        }
    }

    /// Returns the compression level.
    #[must_use]
    pub const fn level(&self) -> u32 {
        self.level
    }

    /// Returns the compression threshold.
    #[must_use]
    pub const fn threshold(&self) -> CompressionThreshold {
        self.threshold
    }

    /// Returns the decompression limit in bytes.
    #[must_use]
    pub const fn max_decompression_size(&self) -> usize {
        self.max_decompression_size
    }
}

impl Compressor for DeflateCompressor {
    fn will_compress(&self, buffer: &[u8]) -> bool {
        self.threshold.admits(buffer.len())
    }

    fn compress(&self, buffer: &[u8]) -> Result<Vec<u8>, CompressError> {
        let mut out = Vec::with_capacity(buffer.len() / 2 + 16);
        self.compress_into(buffer, &mut out)?;
        Ok(out)
    }

    fn compress_into(&self, buffer: &[u8], out: &mut Vec<u8>) -> Result<(), CompressError> {
        let level = if self.will_compress(buffer) {
            Compression::new(self.level)
        } else {
            Compression::none()
        };

        out.clear();
        let mut encoder = DeflateEncoder::new(out, level);
        encoder
            .write_all(buffer)
            .map_err(|e| CompressError::Codec(e.to_string()))?;
        encoder.finish().map_err(|e| CompressError::Codec(e.to_string()))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "deflate"
    }

    fn decompress(&self, payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
        // Read one byte past the limit so an oversized stream is detectable
        // without inflating all of it.
        let limit = self.max_decompression_size;
        let mut decoder = DeflateDecoder::new(payload).take(limit as u64 + 1);
        let mut output = Vec::new();
        decoder
            .read_to_end(&mut output)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;

        if output.len() > limit {
            return Err(DecodeError::TooLarge {
                size: output.len(),
                limit,
            });
        }
        Ok(output)
    }
}
