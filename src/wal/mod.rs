//! Write-Ahead Log (WAL) Module
//!
//! The segmented commit log: framing, segment files, the segment manager,
//! the background sync worker and recovery.
//!
//! ## Responsibilities
//! - Append framed records to fixed-capacity segment files
//! - Track which partitions still have unflushed data in which segment
//! - Delete segments once nothing depends on them
//! - Replay segments after a crash, stopping at torn tails
//!
//! ## Segment File Format
//! ```text
//! CommitLog-<version>-<id>.log
//! ┌─────────────────────────────────────────┐
//! │ Record 1                                │
//! │ ┌──────────┬──────────────┬───────────┐ │
//! │ │ Size (4) │ CRC(size)(8) │ Payload   │ │
//! │ └──────────┴──────────────┴───────────┘ │
//! ├─────────────────────────────────────────┤
//! │ Record 2                                │
//! │ ┌──────────┬──────────────┬───────────┐ │
//! │ │ Size (4) │ CRC(size)(8) │ Payload   │ │
//! │ └──────────┴──────────────┴───────────┘ │
//! └─────────────────────────────────────────┘
//! ```

mod descriptor;
mod entry;
mod manager;
mod position;
mod recovery;
mod segment;
mod sync;

pub use descriptor::{
    SegmentDescriptor, SegmentIdGenerator, CURRENT_VERSION, DEFAULT_PREFIX, LEGACY_VERSION,
    SEGMENT_EXTENSION,
};
pub use entry::{
    encode_frame, encode_mutation, max_payload_size, size_checksum, FrameHeader, Mutation,
    RawMutation, END_OF_SEGMENT_MARKER, ENTRY_OVERHEAD_SIZE,
};
pub use manager::{list_segments, SegmentManager};
pub use position::{PartitionId, ReplayPosition};
pub use recovery::{ApplyError, FileRecovery, RecoveryEngine, RecoveryResult, ReplayTarget, TailState};
pub use segment::Segment;
pub use sync::{SyncWorker, WorkerCommand};
