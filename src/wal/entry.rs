//! Commit log entry framing
//!
//! Every record on disk is a frame:
//!
//! ```text
//! ┌───────────┬─────────────────────┬──────────────────┐
//! │ size (4)  │ crc32(size) (8)     │ payload (size)   │
//! │ i32 BE    │ u64 BE              │ opaque bytes     │
//! └───────────┴─────────────────────┴──────────────────┘
//! ```
//!
//! The checksum covers only the raw size bytes. It lets recovery trust `size`
//! before using it to bound the payload read; payload integrity belongs to
//! whoever serialized the mutation.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{CommitLogError, Result};

use super::PartitionId;

/// Bytes of framing around every payload
pub const ENTRY_OVERHEAD_SIZE: usize = 4 + 8;

/// Size value that marks the end of the written part of a segment
pub const END_OF_SEGMENT_MARKER: i32 = 0;

/// Largest payload a segment of `capacity` bytes accepts
///
/// Half the segment minus framing, so at least two records always fit and a
/// single record can never be too big for every segment.
pub fn max_payload_size(capacity: u64) -> usize {
    ((capacity / 2) as usize).saturating_sub(ENTRY_OVERHEAD_SIZE)
}

/// Checksum stored after the size field
pub fn size_checksum(size: i32) -> u64 {
    crc32fast::hash(&size.to_be_bytes()) as u64
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub size: i32,
    pub checksum: u64,
}

impl FrameHeader {
    pub fn decode(buf: &[u8; ENTRY_OVERHEAD_SIZE]) -> Self {
        let mut size = [0u8; 4];
        size.copy_from_slice(&buf[..4]);
        let mut checksum = [0u8; 8];
        checksum.copy_from_slice(&buf[4..]);
        Self {
            size: i32::from_be_bytes(size),
            checksum: u64::from_be_bytes(checksum),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.checksum == size_checksum(self.size)
    }
}

/// A mutation as the commit log sees it: the partitions it dirties and an
/// opaque payload of known size.
pub trait Mutation {
    /// Partitions (column families) this mutation writes to
    fn partitions(&self) -> &[PartitionId];

    /// Exact number of bytes `serialize_into` appends
    fn serialized_size(&self) -> usize;

    /// Append the serialized payload to `buf`
    fn serialize_into(&self, buf: &mut BytesMut);
}

/// A mutation whose payload is already serialized
#[derive(Debug, Clone)]
pub struct RawMutation {
    partitions: Vec<PartitionId>,
    payload: Bytes,
}

impl RawMutation {
    pub fn new(partition: PartitionId, payload: impl Into<Bytes>) -> Self {
        Self {
            partitions: vec![partition],
            payload: payload.into(),
        }
    }

    pub fn with_partitions(partitions: Vec<PartitionId>, payload: impl Into<Bytes>) -> Self {
        Self {
            partitions,
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

impl Mutation for RawMutation {
    fn partitions(&self) -> &[PartitionId] {
        &self.partitions
    }

    fn serialized_size(&self) -> usize {
        self.payload.len()
    }

    fn serialize_into(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.payload);
    }
}

/// Frame a mutation, enforcing the per-segment payload limit
///
/// Empty payloads are rejected: their size field would read back as the
/// end-of-segment marker.
pub fn encode_mutation<M: Mutation + ?Sized>(mutation: &M, max_payload: usize) -> Result<Bytes> {
    let size = mutation.serialized_size();
    check_payload_size(size, max_payload)?;

    let mut buf = BytesMut::with_capacity(ENTRY_OVERHEAD_SIZE + size);
    put_header(&mut buf, size as i32);
    mutation.serialize_into(&mut buf);

    if buf.len() != ENTRY_OVERHEAD_SIZE + size {
        return Err(CommitLogError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "mutation declared {} bytes but serialized {}",
                size,
                buf.len() - ENTRY_OVERHEAD_SIZE
            ),
        )));
    }

    Ok(buf.freeze())
}

/// Frame a raw payload
pub fn encode_frame(payload: &[u8], max_payload: usize) -> Result<Bytes> {
    check_payload_size(payload.len(), max_payload)?;

    let mut buf = BytesMut::with_capacity(ENTRY_OVERHEAD_SIZE + payload.len());
    put_header(&mut buf, payload.len() as i32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

fn check_payload_size(size: usize, max_payload: usize) -> Result<()> {
    if size == 0 {
        return Err(CommitLogError::EmptyRecord);
    }
    if size > max_payload {
        return Err(CommitLogError::RecordTooLarge {
            size,
            max: max_payload,
        });
    }
    Ok(())
}

fn put_header(buf: &mut BytesMut, size: i32) {
    buf.put_i32(size);
    buf.put_u64(size_checksum(size));
}
