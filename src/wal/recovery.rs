//! Commit log recovery
//!
//! Replays segment files after a restart.
//!
//! A file is read frame by frame until something stops it: end of file, the
//! end-of-segment marker, a short read, a size checksum mismatch or an
//! impossible size. None of those are errors; a partially written frame is
//! what the tail of the active segment looks like after a crash. Replay of
//! the file ends there and the next file starts.
//!
//! Only unreadable files and failures reported by the `ReplayTarget`
//! abort recovery.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::error::{CommitLogError, Result};

use super::entry::{size_checksum, END_OF_SEGMENT_MARKER, ENTRY_OVERHEAD_SIZE};
use super::{ReplayPosition, SegmentDescriptor, DEFAULT_PREFIX};

/// Error type returned by replay targets
pub type ApplyError = Box<dyn std::error::Error + Send + Sync>;

/// Receives replayed records (the storage engine)
pub trait ReplayTarget {
    /// Deserialize and apply one record
    fn apply(&mut self, position: ReplayPosition, payload: Bytes) -> std::result::Result<(), ApplyError>;

    /// Called once after every file has been replayed
    fn flush(&mut self) -> std::result::Result<(), ApplyError> {
        Ok(())
    }
}

impl<F> ReplayTarget for F
where
    F: FnMut(ReplayPosition, Bytes) -> std::result::Result<(), ApplyError>,
{
    fn apply(&mut self, position: ReplayPosition, payload: Bytes) -> std::result::Result<(), ApplyError> {
        self(position, payload)
    }
}

/// Why replay of a file stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailState {
    /// End of file exactly at a frame boundary
    Clean,
    /// Zero size field
    EndMarker,
    /// File ends inside a frame
    Truncated,
    /// Size field does not match its checksum
    ChecksumMismatch,
    /// Negative size, or larger than the rest of the file
    InvalidSize,
}

impl TailState {
    /// Whether replay stopped before the end of the written data
    pub fn is_incomplete(&self) -> bool {
        !matches!(self, TailState::Clean | TailState::EndMarker)
    }
}

/// Outcome of replaying one file
#[derive(Debug, Clone)]
pub struct FileRecovery {
    pub descriptor: SegmentDescriptor,
    pub path: PathBuf,
    pub records_replayed: u64,
    pub records_skipped: u64,
    pub tail: TailState,
    /// Offset where replay of this file stopped
    pub end_offset: u64,
}

/// Result of a recovery operation
#[derive(Debug, Default)]
pub struct RecoveryResult {
    /// Files replayed
    pub files_recovered: usize,

    /// Files skipped entirely because they precede the replay floor
    pub files_skipped: usize,

    /// Records handed to the target
    pub records_replayed: u64,

    /// Records before the replay floor
    pub records_skipped: u64,

    /// Files whose replay stopped at a truncated or corrupt frame
    pub incomplete_files: usize,

    /// Position of the last record applied
    pub last_position: Option<ReplayPosition>,

    /// Highest segment id seen, replayed or skipped
    pub max_segment_id: Option<u64>,

    /// Per-file details, in replay order
    pub files: Vec<FileRecovery>,
}

/// Replays segment files into a `ReplayTarget`
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    prefix: String,
    floor: ReplayPosition,
}

impl RecoveryEngine {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            floor: ReplayPosition::NONE,
        }
    }

    /// Skip every record before `floor`
    pub fn replay_from(mut self, floor: ReplayPosition) -> Self {
        self.floor = floor;
        self
    }

    /// Replay `files` in ascending segment id order
    ///
    /// File names must parse as segment descriptors; the caller's order is
    /// ignored.
    pub fn recover<T: ReplayTarget + ?Sized>(&self, files: &[PathBuf], target: &mut T) -> Result<RecoveryResult> {
        let mut segments = Vec::with_capacity(files.len());
        for path in files {
            let descriptor = SegmentDescriptor::from_path(&self.prefix, path)?;
            descriptor.check_version()?;
            segments.push((descriptor, path.clone()));
        }
        segments.sort_by_key(|(descriptor, _)| *descriptor);

        let mut result = RecoveryResult::default();

        for (descriptor, path) in segments {
            result.max_segment_id = Some(result.max_segment_id.unwrap_or(0).max(descriptor.id));

            if descriptor.id < self.floor.segment_id {
                debug!(segment_id = descriptor.id, "skipping segment before replay floor");
                result.files_skipped += 1;
                continue;
            }

            let file = self.recover_file(descriptor, &path, target, &mut result.last_position)?;

            result.files_recovered += 1;
            result.records_replayed += file.records_replayed;
            result.records_skipped += file.records_skipped;
            if file.tail.is_incomplete() {
                result.incomplete_files += 1;
            }
            result.files.push(file);
        }

        if let Err(e) = target.flush() {
            return Err(CommitLogError::Apply {
                position: result.last_position.unwrap_or(ReplayPosition::NONE),
                message: e.to_string(),
            });
        }

        info!(
            files = result.files_recovered,
            records = result.records_replayed,
            skipped = result.records_skipped,
            incomplete = result.incomplete_files,
            "commit log recovery complete"
        );

        Ok(result)
    }

    /// Replay a single file
    pub fn recover_file<T: ReplayTarget + ?Sized>(
        &self,
        descriptor: SegmentDescriptor,
        path: &Path,
        target: &mut T,
        last_position: &mut Option<ReplayPosition>,
    ) -> Result<FileRecovery> {
        let unreadable = |source: io::Error| CommitLogError::Unreadable {
            path: path.to_path_buf(),
            source,
        };

        let file = File::open(path).map_err(unreadable)?;
        let file_len = file.metadata().map_err(unreadable)?.len();
        let mut reader = BufReader::new(file);

        let mut recovery = FileRecovery {
            descriptor,
            path: path.to_path_buf(),
            records_replayed: 0,
            records_skipped: 0,
            tail: TailState::Clean,
            end_offset: 0,
        };

        let mut offset = 0u64;
        recovery.tail = loop {
            // Size
            let mut size_buf = [0u8; 4];
            match read_up_to(&mut reader, &mut size_buf).map_err(unreadable)? {
                0 => break TailState::Clean,
                4 => {}
                _ => break TailState::Truncated,
            }
            let size = i32::from_be_bytes(size_buf);
            if size == END_OF_SEGMENT_MARKER {
                break TailState::EndMarker;
            }

            // Size checksum
            let mut checksum_buf = [0u8; 8];
            if read_up_to(&mut reader, &mut checksum_buf).map_err(unreadable)? < checksum_buf.len() {
                break TailState::Truncated;
            }
            if u64::from_be_bytes(checksum_buf) != size_checksum(size) {
                break TailState::ChecksumMismatch;
            }

            let remaining = file_len.saturating_sub(offset + ENTRY_OVERHEAD_SIZE as u64);
            if size < 0 || size as u64 > remaining {
                break TailState::InvalidSize;
            }

            // Payload
            let mut payload = vec![0u8; size as usize];
            if read_up_to(&mut reader, &mut payload).map_err(unreadable)? < payload.len() {
                break TailState::Truncated;
            }

            let position = ReplayPosition::new(descriptor.id, offset);
            offset += (ENTRY_OVERHEAD_SIZE + payload.len()) as u64;

            if position < self.floor {
                recovery.records_skipped += 1;
                continue;
            }

            if let Err(e) = target.apply(position, Bytes::from(payload)) {
                return Err(CommitLogError::Apply {
                    position,
                    message: e.to_string(),
                });
            }
            recovery.records_replayed += 1;
            *last_position = Some(position);
        };
        recovery.end_offset = offset;

        if recovery.tail.is_incomplete() {
            warn!(
                segment_id = descriptor.id,
                offset,
                tail = ?recovery.tail,
                "stopped replaying segment at incomplete record"
            );
        } else {
            debug!(
                segment_id = descriptor.id,
                records = recovery.records_replayed,
                "replayed segment"
            );
        }

        Ok(recovery)
    }
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

/// Fill `buf` as far as the reader allows, returning the bytes read
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
