//! Error types for the commit log
//!
//! Provides a unified error type for all operations.

use std::path::PathBuf;

use thiserror::Error;

use crate::wal::ReplayPosition;

/// Result type alias using CommitLogError
pub type Result<T> = std::result::Result<T, CommitLogError>;

/// Unified error type for commit log operations
#[derive(Debug, Error)]
pub enum CommitLogError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    /// Write, allocation or sync failure. Already routed through the
    /// commit failure policy by the time the caller sees it.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    #[error("Record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    /// A zero size field marks the end of a segment, so it cannot frame a record
    #[error("Empty record")]
    EmptyRecord,

    // -------------------------------------------------------------------------
    // Segment File Errors
    // -------------------------------------------------------------------------
    #[error("Invalid commit log segment name: {0}")]
    InvalidSegmentName(String),

    #[error("Unsupported commit log format version {version} (max {max})")]
    UnsupportedVersion { version: u32, max: u32 },

    // -------------------------------------------------------------------------
    // Recovery Errors
    // -------------------------------------------------------------------------
    #[error("Cannot read commit log segment {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to apply record at {position}: {message}")]
    Apply {
        position: ReplayPosition,
        message: String,
    },

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}
