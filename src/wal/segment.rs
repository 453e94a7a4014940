//! Commit log segment files
//!
//! A segment is one fixed-capacity file. Space is claimed by advancing the
//! write cursor, then the frame is written at the claimed offset with a
//! positional write, so writers that claimed disjoint ranges never contend on
//! the file.

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::error::Result;

use super::entry::{encode_frame, max_payload_size};
use super::{PartitionId, ReplayPosition, SegmentDescriptor};

/// One commit log segment
///
/// ## Concurrency:
/// - `write_cursor`: advanced only inside the manager's critical section
/// - `dirty`: own mutex, so dirty marking is serialized per segment
/// - file writes: positional, no lock
/// - `in_flight`: offsets claimed but not yet written; `written` wakes
///   appenders waiting for earlier claims before they fsync
pub struct Segment {
    descriptor: SegmentDescriptor,
    path: PathBuf,
    file: File,
    capacity: u64,

    /// Next free byte in the file
    write_cursor: AtomicU64,

    /// Highest record offset per partition with unflushed data here
    dirty: Mutex<HashMap<PartitionId, u64>>,

    /// Start offsets of claimed ranges whose write has not finished
    in_flight: Mutex<BTreeSet<u64>>,
    written: Condvar,

    /// Set once the segment stops being the tail
    retired: AtomicBool,

    /// Writes landed since the last fsync
    needs_sync: AtomicBool,
}

impl Segment {
    /// Create a new, empty segment file in `dir`
    pub fn create(dir: &Path, prefix: &str, descriptor: SegmentDescriptor, capacity: u64) -> Result<Self> {
        let path = dir.join(descriptor.file_name_with_prefix(prefix));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        debug!(segment_id = descriptor.id, path = %path.display(), capacity, "created commit log segment");

        Ok(Self::from_file(descriptor, path, file, capacity))
    }

    /// Segment whose file handle rejects writes
    #[cfg(test)]
    pub(crate) fn create_read_only(
        dir: &Path,
        prefix: &str,
        descriptor: SegmentDescriptor,
        capacity: u64,
    ) -> Result<Self> {
        let path = dir.join(descriptor.file_name_with_prefix(prefix));
        File::create(&path)?;
        let file = File::open(&path)?;
        Ok(Self::from_file(descriptor, path, file, capacity))
    }

    fn from_file(descriptor: SegmentDescriptor, path: PathBuf, file: File, capacity: u64) -> Self {
        Self {
            descriptor,
            path,
            file,
            capacity,
            write_cursor: AtomicU64::new(0),
            dirty: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(BTreeSet::new()),
            written: Condvar::new(),
            retired: AtomicBool::new(false),
            needs_sync: AtomicBool::new(false),
        }
    }

    // =========================================================================
    // Writing
    // =========================================================================

    /// Frame and write `payload`, returning where it landed
    ///
    /// Returns `Ok(None)` when the segment cannot fit the frame. Oversized
    /// payloads fail with `RecordTooLarge` and leave the segment untouched.
    pub fn append(&self, payload: &[u8]) -> Result<Option<ReplayPosition>> {
        let frame = encode_frame(payload, self.max_payload_size())?;
        let offset = match self.try_claim(frame.len() as u64) {
            Some(offset) => offset,
            None => return Ok(None),
        };
        self.write_frame(offset, &frame)?;
        Ok(Some(self.position_at(offset)))
    }

    /// Reserve `len` bytes, returning their starting offset
    ///
    /// The range stays in flight until `write_frame` is called for it.
    pub fn try_claim(&self, len: u64) -> Option<u64> {
        let capacity = self.capacity;
        let mut in_flight = self.in_flight.lock();
        let offset = self
            .write_cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cursor| {
                let end = cursor.checked_add(len)?;
                (end <= capacity).then_some(end)
            })
            .ok()?;
        in_flight.insert(offset);
        Some(offset)
    }

    /// Whether `len` more bytes fit
    pub fn has_capacity_for(&self, len: u64) -> bool {
        self.write_cursor.load(Ordering::Acquire) + len <= self.capacity
    }

    /// Write an encoded frame at a previously claimed offset
    ///
    /// The claim is released whether or not the write succeeds.
    pub fn write_frame(&self, offset: u64, frame: &[u8]) -> io::Result<()> {
        let result = write_all_at(&self.file, frame, offset);
        if result.is_ok() {
            self.needs_sync.store(true, Ordering::Release);
            trace!(segment_id = self.id(), offset, len = frame.len(), "wrote frame");
        }

        let mut in_flight = self.in_flight.lock();
        in_flight.remove(&offset);
        self.written.notify_all();

        result
    }

    /// Block until every range claimed before `offset` has been written
    pub fn wait_for_writes_before(&self, offset: u64) {
        let mut in_flight = self.in_flight.lock();
        while in_flight.range(..offset).next().is_some() {
            self.written.wait(&mut in_flight);
        }
    }

    // =========================================================================
    // Dirty Tracking
    // =========================================================================

    /// Record that `partition` has unflushed data at `offset`
    pub fn mark_dirty(&self, partition: PartitionId, offset: u64) {
        let mut dirty = self.dirty.lock();
        let highest = dirty.entry(partition).or_insert(offset);
        if *highest < offset {
            *highest = offset;
        }
    }

    /// Forget `partition` unconditionally
    pub fn clean(&self, partition: PartitionId) {
        self.dirty.lock().remove(&partition);
    }

    /// Forget `partition` if everything it wrote here is at or before `up_to`
    pub fn mark_clean(&self, partition: PartitionId, up_to: ReplayPosition) {
        let mut dirty = self.dirty.lock();
        let covered = match dirty.get(&partition) {
            Some(&offset) => {
                up_to.segment_id > self.id() || (up_to.segment_id == self.id() && offset <= up_to.offset)
            }
            None => false,
        };
        if covered {
            dirty.remove(&partition);
        }
    }

    pub fn is_dirty(&self, partition: PartitionId) -> bool {
        self.dirty.lock().contains_key(&partition)
    }

    /// Snapshot of the dirty partitions and their highest offsets
    pub fn dirty_partitions(&self) -> Vec<(PartitionId, u64)> {
        let mut dirty: Vec<_> = self.dirty.lock().iter().map(|(p, o)| (*p, *o)).collect();
        dirty.sort();
        dirty
    }

    /// True when nothing depends on this segment and it is no longer the tail
    pub fn is_reclaimable(&self) -> bool {
        self.is_retired() && self.dirty.lock().is_empty()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Flush written frames to stable storage
    ///
    /// `force` always issues an fsync; otherwise the fsync is skipped when
    /// nothing was written since the previous one.
    pub fn sync(&self, force: bool) -> io::Result<()> {
        let pending = self.needs_sync.swap(false, Ordering::AcqRel);
        if !force && !pending {
            return Ok(());
        }
        if let Err(e) = self.file.sync_data() {
            self.needs_sync.store(true, Ordering::Release);
            return Err(e);
        }
        trace!(segment_id = self.id(), "synced segment");
        Ok(())
    }

    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Remove the segment file
    pub fn delete(&self) -> io::Result<()> {
        fs::remove_file(&self.path)?;
        debug!(segment_id = self.id(), path = %self.path.display(), "deleted commit log segment");
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> u64 {
        self.descriptor.id
    }

    pub fn descriptor(&self) -> SegmentDescriptor {
        self.descriptor
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn max_payload_size(&self) -> usize {
        max_payload_size(self.capacity)
    }

    /// Bytes claimed so far
    pub fn write_offset(&self) -> u64 {
        self.write_cursor.load(Ordering::Acquire)
    }

    /// Position of the next record in this segment
    pub fn current_position(&self) -> ReplayPosition {
        self.position_at(self.write_offset())
    }

    pub fn contains(&self, position: ReplayPosition) -> bool {
        position.segment_id == self.id()
    }

    fn position_at(&self, offset: u64) -> ReplayPosition {
        ReplayPosition::new(self.id(), offset)
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id())
            .field("path", &self.path)
            .field("write_offset", &self.write_offset())
            .field("capacity", &self.capacity)
            .field("retired", &self.is_retired())
            .finish()
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "failed to write whole frame"));
            }
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
