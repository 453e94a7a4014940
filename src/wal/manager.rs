//! Segment Manager
//!
//! Owns the ordered set of active segments and coordinates appends,
//! allocation and reclamation.
//!
//! ## Responsibilities
//! - Pick the tail for each append, rolling over to a new segment when full
//! - Keep a spare segment ready so writers rarely wait on file creation
//! - Clean partitions and delete segments nothing depends on any more
//! - Route every I/O failure through the commit failure policy

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam::channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Config, WalSyncStrategy};
use crate::error::{CommitLogError, Result};
use crate::failure::FailureHandler;

use super::entry::{encode_mutation, max_payload_size, Mutation};
use super::sync::WorkerCommand;
use super::{PartitionId, ReplayPosition, Segment, SegmentDescriptor, SegmentIdGenerator};

/// State guarded by the manager lock
struct SegmentSet {
    /// Oldest first; the last element is the tail
    active: VecDeque<Arc<Segment>>,

    /// Pre-allocated segment waiting to become the tail
    spare: Option<Arc<Segment>>,

    /// Background worker, when started
    worker: Option<Sender<WorkerCommand>>,
}

/// Manages the active segments of one commit log
///
/// ## Concurrency:
/// - `segments`: the critical section. Held while choosing the tail,
///   claiming space and marking partitions dirty; released before the frame
///   is written.
/// - `ids`: atomic, lock-free
/// - `discard_completed` works on a snapshot and only takes the lock to
///   unlink a reclaimed segment
pub struct SegmentManager {
    dir: PathBuf,
    prefix: String,
    capacity: u64,
    sync_every_write: bool,
    allocate_ahead: bool,
    ids: SegmentIdGenerator,
    segments: Mutex<SegmentSet>,
    failure: Arc<FailureHandler>,
}

impl SegmentManager {
    /// Create a manager for `config.log_dir`
    ///
    /// Does not create any file. Existing segment files only advance the id
    /// generator so new segments sort after them.
    pub fn new(config: &Config, failure: Arc<FailureHandler>) -> Result<Self> {
        let ids = SegmentIdGenerator::new();
        if config.log_dir.is_dir() {
            for (descriptor, _) in list_segments(&config.log_dir, &config.file_prefix)? {
                ids.advance_past(descriptor.id);
            }
        }

        Ok(Self {
            dir: config.log_dir.clone(),
            prefix: config.file_prefix.clone(),
            capacity: config.segment_size,
            sync_every_write: config.sync_strategy == WalSyncStrategy::EveryWrite,
            allocate_ahead: config.allocate_ahead,
            ids,
            segments: Mutex::new(SegmentSet {
                active: VecDeque::new(),
                spare: None,
                worker: None,
            }),
            failure,
        })
    }

    // =========================================================================
    // Append Path
    // =========================================================================

    /// Append a mutation, returning the position of its record
    ///
    /// With `EveryWrite`, the call returns only after every record claimed
    /// before it in the same segment is written and the segment is synced.
    /// A failed write or sync abandons the segment; later appends go to a
    /// new one.
    pub fn append<M: Mutation + ?Sized>(&self, mutation: &M) -> Result<ReplayPosition> {
        // Rejected before touching any segment
        let frame = encode_mutation(mutation, self.max_payload_size())?;
        let len = frame.len() as u64;

        let (segment, offset) = {
            let mut set = self.segments.lock();
            let segment = self.tail_with_capacity(&mut set, len)?;
            let offset = match segment.try_claim(len) {
                Some(offset) => offset,
                None => {
                    return Err(self.fail(
                        "Failed to claim space in commit log segment",
                        std::io::Error::new(
                            std::io::ErrorKind::Other,
                            format!("{} bytes do not fit segment {}", len, segment.id()),
                        ),
                    ));
                }
            };
            // Dirty before unlocking, so a rollover plus discard can never
            // reclaim a segment with a write still in flight
            for partition in mutation.partitions() {
                segment.mark_dirty(*partition, offset);
            }
            (segment, offset)
        };

        if let Err(e) = segment.write_frame(offset, &frame) {
            self.abandon(&segment);
            return Err(self.fail("Failed to write commit log record", e));
        }

        if self.sync_every_write {
            // Syncing past an unwritten earlier claim would acknowledge a
            // record that recovery cannot reach
            segment.wait_for_writes_before(offset);
            if let Err(e) = segment.sync(true) {
                self.abandon(&segment);
                return Err(self.fail("Failed to sync commit log segment", e));
            }
        }

        Ok(ReplayPosition::new(segment.id(), offset))
    }

    /// Stop appending to a segment that may contain a hole
    ///
    /// Records claimed concurrently with the failed one may still land in
    /// it; every later append rolls over.
    fn abandon(&self, segment: &Segment) {
        if !segment.is_retired() {
            warn!(segment_id = segment.id(), "abandoning commit log segment after I/O failure");
            segment.retire();
        }
    }

    /// Current tail if it fits `len` more bytes, otherwise a newly activated one
    fn tail_with_capacity(&self, set: &mut SegmentSet, len: u64) -> Result<Arc<Segment>> {
        if let Some(tail) = set.active.back() {
            if !tail.is_retired() && tail.has_capacity_for(len) {
                return Ok(Arc::clone(tail));
            }
        }

        let next = match self.take_spare(set) {
            Some(spare) => spare,
            None => match self.create_segment() {
                Ok(segment) => Arc::new(segment),
                Err(e) => return Err(self.fail("Failed to allocate commit log segment", e)),
            },
        };

        if let Some(previous) = set.active.back() {
            previous.retire();
        }
        set.active.push_back(Arc::clone(&next));

        info!(
            segment_id = next.id(),
            active_segments = set.active.len(),
            "activated commit log segment"
        );

        if self.allocate_ahead {
            if let Some(worker) = &set.worker {
                let _ = worker.send(WorkerCommand::AllocateSpare);
            }
        }

        Ok(next)
    }

    /// Take the spare if it still sorts after the tail
    fn take_spare(&self, set: &mut SegmentSet) -> Option<Arc<Segment>> {
        let spare = set.spare.take()?;
        let tail_id = set.active.back().map(|s| s.id()).unwrap_or(0);
        if spare.id() > tail_id {
            return Some(spare);
        }
        debug!(segment_id = spare.id(), tail_id, "discarding stale spare segment");
        if let Err(e) = spare.delete() {
            warn!(segment_id = spare.id(), error = %e, "failed to delete stale spare segment");
        }
        None
    }

    fn create_segment(&self) -> Result<Segment> {
        let descriptor = SegmentDescriptor::new(self.ids.next_id());
        Segment::create(&self.dir, &self.prefix, descriptor, self.capacity)
    }

    // =========================================================================
    // Look-ahead Allocation
    // =========================================================================

    /// Allocate a spare segment if none is ready
    pub fn ensure_spare(&self) -> Result<()> {
        if !self.allocate_ahead || self.segments.lock().spare.is_some() {
            return Ok(());
        }

        let segment = match self.create_segment() {
            Ok(segment) => Arc::new(segment),
            Err(e) => return Err(self.fail("Failed to allocate spare commit log segment", e)),
        };

        let mut set = self.segments.lock();
        let tail_id = set.active.back().map(|s| s.id()).unwrap_or(0);
        if set.spare.is_none() && segment.id() > tail_id {
            debug!(segment_id = segment.id(), "spare commit log segment ready");
            set.spare = Some(segment);
            return Ok(());
        }
        drop(set);

        // Lost a race with a synchronous allocation
        if let Err(e) = segment.delete() {
            warn!(segment_id = segment.id(), error = %e, "failed to delete redundant spare segment");
        }
        Ok(())
    }

    pub fn allocates_ahead(&self) -> bool {
        self.allocate_ahead
    }

    pub fn has_spare(&self) -> bool {
        self.segments.lock().spare.is_some()
    }

    // =========================================================================
    // Reclamation
    // =========================================================================

    /// Mark `partition` clean up to `up_to` and delete segments nobody needs
    ///
    /// Walks oldest first and stops after the segment containing `up_to`.
    /// The tail is cleaned but never deleted.
    pub fn discard_completed(&self, partition: PartitionId, up_to: ReplayPosition) {
        let snapshot: Vec<Arc<Segment>> = self.segments.lock().active.iter().cloned().collect();

        for segment in snapshot {
            segment.mark_clean(partition, up_to);

            if segment.is_reclaimable() {
                self.reclaim(&segment);
            }

            if segment.contains(up_to) {
                break;
            }
        }
    }

    fn reclaim(&self, segment: &Arc<Segment>) {
        {
            let mut set = self.segments.lock();
            let index = match set.active.iter().position(|s| Arc::ptr_eq(s, segment)) {
                Some(index) => index,
                None => return,
            };
            if !segment.is_retired() {
                return;
            }
            set.active.remove(index);
            debug!(
                segment_id = segment.id(),
                active_segments = set.active.len(),
                "reclaiming commit log segment"
            );
        }

        if let Err(e) = segment.delete() {
            warn!(segment_id = segment.id(), error = %e, "failed to delete reclaimed segment");
        }
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Sync active segments
    ///
    /// Non-forced syncs are handed to the background worker when it runs.
    pub fn sync(&self, force: bool) -> Result<()> {
        if !force {
            if let Some(worker) = &self.segments.lock().worker {
                if worker.send(WorkerCommand::Sync).is_ok() {
                    return Ok(());
                }
            }
        }
        self.sync_all(force)
    }

    /// Sync every active segment on the calling thread
    pub fn sync_all(&self, force: bool) -> Result<()> {
        for segment in self.segments() {
            if let Err(e) = segment.sync(force) {
                if force {
                    self.abandon(&segment);
                }
                return Err(self.fail("Failed to sync commit log segment", e));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub(crate) fn attach_worker(&self, worker: Sender<WorkerCommand>) {
        self.segments.lock().worker = Some(worker);
    }

    pub(crate) fn detach_worker(&self) {
        self.segments.lock().worker = None;
    }

    /// Final sync and removal of the unused spare
    pub fn shutdown(&self) -> Result<()> {
        self.sync_all(true)?;

        let spare = self.segments.lock().spare.take();
        if let Some(spare) = spare {
            spare.delete()?;
        }
        Ok(())
    }

    /// Drop every segment and delete its file
    pub fn reset_unsafe(&self) -> Result<()> {
        let doomed: Vec<Arc<Segment>> = {
            let mut set = self.segments.lock();
            let mut doomed: Vec<_> = set.active.drain(..).collect();
            doomed.extend(set.spare.take());
            doomed
        };

        for segment in &doomed {
            match segment.delete() {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!(deleted = doomed.len(), "reset commit log segments");
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Number of active segments, tail included, spare excluded
    pub fn active_segment_count(&self) -> usize {
        self.segments.lock().active.len()
    }

    /// Whether `path` is an active segment or the spare
    pub fn manages(&self, path: &Path) -> bool {
        let set = self.segments.lock();
        set.active.iter().chain(set.spare.iter()).any(|s| s.path() == path)
    }

    /// Snapshot of the active segments, oldest first
    pub fn segments(&self) -> Vec<Arc<Segment>> {
        self.segments.lock().active.iter().cloned().collect()
    }

    /// Where the next record would go
    pub fn current_position(&self) -> ReplayPosition {
        self.segments
            .lock()
            .active
            .back()
            .map(|tail| tail.current_position())
            .unwrap_or(ReplayPosition::NONE)
    }

    pub fn max_payload_size(&self) -> usize {
        max_payload_size(self.capacity)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Keep new ids above segments replayed from disk
    pub fn advance_ids_past(&self, id: u64) {
        self.ids.advance_past(id);
    }

    pub fn next_segment_id(&self) -> u64 {
        self.ids.peek()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn fail(&self, message: &str, error: impl Into<CommitLogError>) -> CommitLogError {
        let error = error.into();
        self.failure.handle_commit_error(message, &error);
        error
    }
}

/// Segment files in `dir` with the given prefix, sorted by id
///
/// Files that do not parse as segment names are skipped.
pub fn list_segments(dir: &Path, prefix: &str) -> Result<Vec<(SegmentDescriptor, PathBuf)>> {
    let mut segments = Vec::new();

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if let Ok(descriptor) = SegmentDescriptor::from_path(prefix, &path) {
            segments.push((descriptor, path));
        }
    }

    segments.sort_by_key(|(descriptor, _)| *descriptor);
    Ok(segments)
}
