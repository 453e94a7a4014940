//! Segment descriptors
//!
//! Every segment file carries its id and format version in its name:
//!
//! ```text
//! CommitLog-3-1700000000001.log     versioned (always written)
//! CommitLog-1700000000001.log       legacy (read only, implies version 1)
//! ```

use std::cmp::Ordering;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{CommitLogError, Result};

/// Default segment file name prefix
pub const DEFAULT_PREFIX: &str = "CommitLog";

/// Segment file extension (without the dot)
pub const SEGMENT_EXTENSION: &str = "log";

/// Version implied by legacy names without a version field
pub const LEGACY_VERSION: u32 = 1;

/// Version written by this implementation
pub const CURRENT_VERSION: u32 = 3;

/// Identity of one segment file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentDescriptor {
    /// Monotonic segment id (never reused)
    pub id: u64,

    /// On-disk format version
    pub version: u32,
}

impl SegmentDescriptor {
    /// Descriptor for a new segment in the current format
    pub fn new(id: u64) -> Self {
        Self {
            id,
            version: CURRENT_VERSION,
        }
    }

    pub fn with_version(id: u64, version: u32) -> Self {
        Self { id, version }
    }

    /// Parse a file name using the default prefix
    pub fn parse(name: &str) -> Result<Self> {
        Self::parse_with_prefix(DEFAULT_PREFIX, name)
    }

    /// Parse `<prefix>-<id>.log` or `<prefix>-<version>-<id>.log`
    pub fn parse_with_prefix(prefix: &str, name: &str) -> Result<Self> {
        let invalid = || CommitLogError::InvalidSegmentName(name.to_string());

        let rest = name
            .strip_prefix(prefix)
            .and_then(|s| s.strip_prefix('-'))
            .and_then(|s| s.strip_suffix(SEGMENT_EXTENSION))
            .and_then(|s| s.strip_suffix('.'))
            .ok_or_else(invalid)?;

        let fields: Vec<&str> = rest.split('-').collect();
        match fields.as_slice() {
            [id] => Ok(Self::with_version(parse_decimal(id).ok_or_else(invalid)?, LEGACY_VERSION)),
            [version, id] => {
                let version = parse_decimal(version)
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(invalid)?;
                let id = parse_decimal(id).ok_or_else(invalid)?;
                Ok(Self::with_version(id, version))
            }
            _ => Err(invalid()),
        }
    }

    /// Parse the file name component of a path using the given prefix
    pub fn from_path(prefix: &str, path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CommitLogError::InvalidSegmentName(path.display().to_string()))?;
        Self::parse_with_prefix(prefix, name)
    }

    /// True if `name` parses with the default prefix
    pub fn is_valid(name: &str) -> bool {
        Self::parse(name).is_ok()
    }

    /// File name using the default prefix
    pub fn file_name(&self) -> String {
        self.file_name_with_prefix(DEFAULT_PREFIX)
    }

    /// File name in the versioned form
    pub fn file_name_with_prefix(&self, prefix: &str) -> String {
        format!("{}-{}-{}.{}", prefix, self.version, self.id, SEGMENT_EXTENSION)
    }

    /// Whether this implementation can replay the segment
    pub fn check_version(&self) -> Result<()> {
        if self.version > CURRENT_VERSION {
            return Err(CommitLogError::UnsupportedVersion {
                version: self.version,
                max: CURRENT_VERSION,
            });
        }
        Ok(())
    }
}

impl PartialOrd for SegmentDescriptor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SegmentDescriptor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id).then(self.version.cmp(&other.version))
    }
}

/// Digits only: rejects signs, spaces and empty fields that `str::parse` would
/// partially accept.
fn parse_decimal(field: &str) -> Option<u64> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse().ok()
}

/// Hands out strictly increasing segment ids
///
/// Ids start at the wall-clock time in milliseconds so that a restarted
/// process keeps allocating above the previous run's ids.
#[derive(Debug)]
pub struct SegmentIdGenerator {
    next: AtomicU64,
}

impl SegmentIdGenerator {
    pub fn new() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self::starting_at(now.max(1))
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, AtomicOrdering::SeqCst)
    }

    /// Ensure every future id is greater than `id`
    pub fn advance_past(&self, id: u64) {
        self.next.fetch_max(id.saturating_add(1), AtomicOrdering::SeqCst);
    }

    pub fn peek(&self) -> u64 {
        self.next.load(AtomicOrdering::SeqCst)
    }
}

impl Default for SegmentIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
