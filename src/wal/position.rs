//! Replay positions and partition ids
//!
//! A `ReplayPosition` names a point in the log stream. Appends hand them out,
//! the store passes them back to `discard_completed` once it has flushed, and
//! recovery tags every replayed record with one.

use std::fmt;

/// Logical partition (column family) whose writes are tracked per segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId(pub u64);

impl From<u64> for PartitionId {
    fn from(id: u64) -> Self {
        PartitionId(id)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition:{}", self.0)
    }
}

/// A (segment id, byte offset) cursor into the log
///
/// Ordered by segment id first, then offset (field order matters for the
/// derived `Ord`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ReplayPosition {
    pub segment_id: u64,
    pub offset: u64,
}

impl ReplayPosition {
    /// Position before any record ever written
    pub const NONE: ReplayPosition = ReplayPosition {
        segment_id: 0,
        offset: 0,
    };

    pub fn new(segment_id: u64, offset: u64) -> Self {
        Self { segment_id, offset }
    }
}

impl fmt::Display for ReplayPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplayPosition({}, {})", self.segment_id, self.offset)
    }
}
