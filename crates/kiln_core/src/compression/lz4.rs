//! LZ4 block codec with a size-prepended frame.
//!
//! Frame: `[uncompressed_len: u32 LE][lz4 block]`. The announced length is
//! checked against the limit before any decoding happens, and the decoded
//! block must fill it exactly.

use lz4_flex::block::{self, get_maximum_output_size};
use lz4_flex::decompress_size_prepended;

use super::{CompressionThreshold, Compressor};
use crate::error::{CompressError, DecodeError};

/// Size of the little-endian length prefix.
const SIZE_PREFIX_LEN: usize = 4;

/// LZ4 compressor for low-latency links where CPU matters more than ratio.
///
/// LZ4 has no level knob; the threshold only drives the inline-vs-worker
/// decision in the batch pipeline.
#[derive(Clone, Debug)]
pub struct Lz4Compressor {
    threshold: CompressionThreshold,
    max_decompression_size: usize,
}

impl Lz4Compressor {
    /// Creates a compressor.
    #[must_use]
    pub const fn new(threshold: CompressionThreshold, max_decompression_size: usize) -> Self {
        Self {
            threshold,
            max_decompression_size,
        }
    }

    /// Returns the compression threshold.
    #[must_use]
    pub const fn threshold(&self) -> CompressionThreshold {
        self.threshold
    }
}

impl Compressor for Lz4Compressor {
    fn will_compress(&self, buffer: &[u8]) -> bool {
        self.threshold.admits(buffer.len())
    }

    fn compress(&self, buffer: &[u8]) -> Result<Vec<u8>, CompressError> {
        let mut out = Vec::new();
        self.compress_into(buffer, &mut out)?;
        Ok(out)
    }

    fn compress_into(&self, buffer: &[u8], out: &mut Vec<u8>) -> Result<(), CompressError> {
        let len = u32::try_from(buffer.len()).map_err(|_| {
            CompressError::Codec(format!(
                "buffer of {} bytes does not fit the size prefix",
                buffer.len()
            ))
        })?;

        out.clear();
        out.resize(SIZE_PREFIX_LEN + get_maximum_output_size(buffer.len()), 0);
        out[..SIZE_PREFIX_LEN].copy_from_slice(&len.to_le_bytes());
        let written = block::compress_into(buffer, &mut out[SIZE_PREFIX_LEN..])
            .map_err(|e| CompressError::Codec(e.to_string()))?;
        out.truncate(SIZE_PREFIX_LEN + written);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "lz4"
    }

    fn decompress(&self, payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
        if payload.len() < SIZE_PREFIX_LEN {
            return Err(DecodeError::Malformed(format!(
                "payload of {} bytes is shorter than the size prefix",
                payload.len()
            )));
        }

        let mut prefix = [0u8; SIZE_PREFIX_LEN];
        prefix.copy_from_slice(&payload[..SIZE_PREFIX_LEN]);
        let announced = u32::from_le_bytes(prefix) as usize;
        if announced > self.max_decompression_size {
            return Err(DecodeError::TooLarge {
                size: announced,
                limit: self.max_decompression_size,
            });
        }

        let output =
            decompress_size_prepended(payload).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        if output.len() != announced {
            return Err(DecodeError::Malformed(format!(
                "block decoded to {} of {announced} announced bytes",
                output.len()
            )));
        }
        Ok(output)
    }
}
