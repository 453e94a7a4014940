//! Configuration for the commit log
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{CommitLogError, Result};
use crate::failure::CommitFailurePolicy;
use crate::wal::{DEFAULT_PREFIX, ENTRY_OVERHEAD_SIZE};

/// Main configuration for a commit log instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Directory holding the segment files
    /// Internal structure:
    ///   {log_dir}/
    ///     ├── CommitLog-3-1700000000001.log
    ///     └── CommitLog-3-1700000000002.log
    pub log_dir: PathBuf,

    /// Fixed capacity of every segment file (in bytes)
    pub segment_size: u64,

    /// File name prefix shared by all segments
    pub file_prefix: String,

    // -------------------------------------------------------------------------
    // Durability Configuration
    // -------------------------------------------------------------------------
    /// Sync strategy: how often to fsync segments
    pub sync_strategy: WalSyncStrategy,

    /// Keep one spare segment allocated ahead of the tail
    pub allocate_ahead: bool,

    // -------------------------------------------------------------------------
    // Failure Handling
    // -------------------------------------------------------------------------
    /// Initial commit failure policy (mutable at runtime on the handler)
    pub failure_policy: CommitFailurePolicy,
}

/// Segment sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalSyncStrategy {
    /// fsync after every append (safest, slowest)
    EveryWrite,

    /// fsync from the background worker every `interval_ms`
    Periodic { interval_ms: u64 },
}

impl WalSyncStrategy {
    /// Interval of the background sync, if any
    pub fn interval(&self) -> Option<Duration> {
        match self {
            WalSyncStrategy::EveryWrite => None,
            WalSyncStrategy::Periodic { interval_ms } => Some(Duration::from_millis(*interval_ms)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./atlaslog_data"),
            segment_size: 32 * 1024 * 1024, // 32 MB
            file_prefix: DEFAULT_PREFIX.to_string(),
            sync_strategy: WalSyncStrategy::Periodic { interval_ms: 10_000 },
            allocate_ahead: true,
            failure_policy: CommitFailurePolicy::Stop,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check that the configuration describes a usable log
    pub fn validate(&self) -> Result<()> {
        // Two minimal frames must always fit in one segment
        let min_segment = 2 * (ENTRY_OVERHEAD_SIZE as u64 + 1);
        if self.segment_size < min_segment {
            return Err(CommitLogError::Config(format!(
                "segment_size {} is below the minimum of {} bytes",
                self.segment_size, min_segment
            )));
        }

        if self.segment_size > i32::MAX as u64 {
            return Err(CommitLogError::Config(format!(
                "segment_size {} exceeds the frame size limit",
                self.segment_size
            )));
        }

        if self.file_prefix.is_empty() || self.file_prefix.contains('-') {
            return Err(CommitLogError::Config(format!(
                "file_prefix {:?} must be non-empty and must not contain '-'",
                self.file_prefix
            )));
        }

        if let WalSyncStrategy::Periodic { interval_ms: 0 } = self.sync_strategy {
            return Err(CommitLogError::Config(
                "periodic sync interval must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the log directory
    pub fn log_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.log_dir = path.into();
        self
    }

    /// Set the segment capacity (in bytes)
    pub fn segment_size(mut self, size: u64) -> Self {
        self.config.segment_size = size;
        self
    }

    /// Set the segment file name prefix
    pub fn file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.file_prefix = prefix.into();
        self
    }

    /// Set the sync strategy
    pub fn sync_strategy(mut self, strategy: WalSyncStrategy) -> Self {
        self.config.sync_strategy = strategy;
        self
    }

    /// Enable or disable spare segment look-ahead
    pub fn allocate_ahead(mut self, enabled: bool) -> Self {
        self.config.allocate_ahead = enabled;
        self
    }

    /// Set the initial commit failure policy
    pub fn failure_policy(mut self, policy: CommitFailurePolicy) -> Self {
        self.config.failure_policy = policy;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
