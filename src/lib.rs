//! # atlas-commitlog
//!
//! The commit log of a distributed key-value store:
//! - Segmented, fixed-capacity log files with checksummed record framing
//! - Per-partition dirty tracking so flushed segments can be deleted
//! - Crash recovery that tolerates torn and corrupted tails
//! - Configurable commit failure policy (stop / die / ignore)
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        CommitLog                             │
//! │        append / sync / discard_completed / recover           │
//! └───────┬──────────────────────┬───────────────────┬──────────┘
//!         │                      │                   │
//!         ▼                      ▼                   ▼
//!  ┌──────────────┐      ┌──────────────┐    ┌──────────────┐
//!  │SegmentManager│◄─────│  SyncWorker  │    │RecoveryEngine│
//!  │ (tail, spare)│      │ (background) │    │   (replay)   │
//!  └──────┬───────┘      └──────────────┘    └──────────────┘
//!         │
//!         ▼
//!  ┌──────────────┐      ┌──────────────┐
//!  │   Segment    │─────►│FailureHandler│
//!  │ (file, dirty)│ I/O  │   (policy)   │
//!  └──────────────┘ err  └──────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod wal;
pub mod failure;
pub mod commit_log;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{CommitLogError, Result};
pub use config::{Config, WalSyncStrategy};
pub use commit_log::CommitLog;
pub use failure::{CommitFailurePolicy, FailureAction, FailureHandler};
pub use wal::{Mutation, PartitionId, RawMutation, ReplayPosition, ReplayTarget};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of atlas-commitlog
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
