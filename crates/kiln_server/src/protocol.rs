//! # Packet Batches
//!
//! The pipeline treats game packets as opaque byte strings. A batch is the
//! unit of compression:
//!
//! ```text
//! [varint len][packet bytes][varint len][packet bytes]...
//! ```
//!
//! Lengths are unsigned LEB128, at most five bytes (`u32`).

use std::sync::Arc;

use kiln_core::DecodeError;

/// Longest encoding of a `u32` varint.
const MAX_VARINT_LEN: usize = 5;

/// An encoded, immutable packet bound for clients.
///
/// Cloning shares the bytes, so one packet can sit in many batches.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientboundPacket(Arc<[u8]>);

impl ClientboundPacket {
    /// Wraps encoded packet bytes.
    #[must_use]
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the encoded bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the encoded length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true for a zero-length packet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Length-prefixed concatenation of packets.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PacketBatch {
    buffer: Vec<u8>,
}

impl PacketBatch {
    /// Encodes `packets` into one batch.
    #[must_use]
    pub fn from_packets(packets: &[ClientboundPacket]) -> Self {
        let size: usize = packets.iter().map(|p| p.len() + MAX_VARINT_LEN).sum();
        let mut buffer = Vec::with_capacity(size);
        for packet in packets {
            write_varint(&mut buffer, packet.len());
            buffer.extend_from_slice(packet.bytes());
        }
        Self { buffer }
    }

    /// Wraps an already-encoded batch (for example, a decompressed payload).
    #[must_use]
    pub fn from_buffer(buffer: Vec<u8>) -> Self {
        Self { buffer }
    }

    /// Returns the encoded bytes.
    #[must_use]
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Consumes the batch and returns the encoded bytes.
    #[must_use]
    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }

    /// Encoded length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true if the batch holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Splits the batch back into packet payloads.
    pub fn decode(&self) -> Result<Vec<Vec<u8>>, DecodeError> {
        let mut packets = Vec::new();
        let mut rest = self.buffer.as_slice();
        while !rest.is_empty() {
            let (len, used) = read_varint(rest)?;
            rest = &rest[used..];
            if len > rest.len() {
                return Err(DecodeError::Malformed(format!(
                    "packet claims {len} bytes, {} remain",
                    rest.len()
                )));
            }
            let (packet, tail) = rest.split_at(len);
            packets.push(packet.to_vec());
            rest = tail;
        }
        Ok(packets)
    }
}

fn write_varint(out: &mut Vec<u8>, mut value: usize) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn read_varint(input: &[u8]) -> Result<(usize, usize), DecodeError> {
    let mut value: u64 = 0;
    for (i, byte) in input.iter().take(MAX_VARINT_LEN).enumerate() {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            let value = u32::try_from(value)
                .map_err(|_| DecodeError::Malformed("varint exceeds u32".into()))?;
            return Ok((value as usize, i + 1));
        }
    }
    if input.len() < MAX_VARINT_LEN {
        Err(DecodeError::Malformed("truncated varint".into()))
    } else {
        Err(DecodeError::Malformed("varint longer than 5 bytes".into()))
    }
}
