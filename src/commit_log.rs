//! Commit Log Module
//!
//! The public entry point that composes the segment manager, the sync
//! worker, recovery and the failure policy.
//!
//! ## Responsibilities
//! - Accept mutations and hand back their replay positions
//! - Sync on demand or in the background
//! - Drop segments once the store has flushed past them
//! - Replay segment files on startup

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::failure::FailureHandler;
use crate::wal::{
    list_segments, Mutation, PartitionId, RecoveryEngine, RecoveryResult, ReplayPosition, ReplayTarget,
    SegmentManager, SyncWorker,
};

/// A commit log instance
///
/// Construct one per process and share it (e.g. behind an `Arc`); tests
/// build independent instances in their own directories.
///
/// ## Lifecycle
/// 1. `open`: no thread, no segment file
/// 2. `recover_directory`: replay what the previous run left behind
/// 3. `start`: background sync + spare allocation
/// 4. `append` / `sync` / `discard_completed`
/// 5. `stop`: join the worker, final sync
pub struct CommitLog {
    config: Config,
    manager: Arc<SegmentManager>,
    failure: Arc<FailureHandler>,
    worker: Mutex<Option<SyncWorker>>,
}

impl CommitLog {
    /// Open a commit log in `config.log_dir`
    ///
    /// Creates the directory if needed.
    ///
    /// `config.failure_policy` replaces whatever policy `failure` was built
    /// with; call `failure.set_policy` afterwards to change it at runtime.
    pub fn open(config: Config, failure: Arc<FailureHandler>) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.log_dir)?;
        failure.set_policy(config.failure_policy);

        let manager = Arc::new(SegmentManager::new(&config, Arc::clone(&failure))?);

        Ok(Self {
            config,
            manager,
            failure,
            worker: Mutex::new(None),
        })
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified log directory and a failure
    /// handler wired to the real process.
    pub fn open_path(path: &Path) -> Result<Self> {
        let config = Config::builder().log_dir(path).build();
        let failure = Arc::new(FailureHandler::standalone(config.failure_policy));
        Self::open(config, failure)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the background worker (idempotent)
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_none() {
            *worker = Some(SyncWorker::spawn(
                Arc::clone(&self.manager),
                self.config.sync_strategy.interval(),
            )?);
        }
        Ok(())
    }

    /// Stop the background worker and sync everything written
    pub fn stop(&self) -> Result<()> {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.shutdown();
        }
        self.manager.shutdown()
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Append a mutation
    ///
    /// Fails with `RecordTooLarge` when the payload exceeds
    /// `max_payload_size()` and with `EmptyRecord` when it is empty; neither
    /// writes anything. I/O failures have already been handled by the
    /// failure policy when they are returned.
    ///
    /// With `EveryWrite` the call returns once this record and every record
    /// claimed before it in the same segment are durable.
    pub fn append<M: Mutation + ?Sized>(&self, mutation: &M) -> Result<ReplayPosition> {
        self.manager.append(mutation)
    }

    /// Sync written records; `force` blocks until they are durable
    pub fn sync(&self, force: bool) -> Result<()> {
        self.manager.sync(force)
    }

    /// The store flushed `partition` up to `position`
    pub fn discard_completed(&self, partition: PartitionId, position: ReplayPosition) {
        self.manager.discard_completed(partition, position);
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Replay the given segment files into `target`
    pub fn recover<T: ReplayTarget + ?Sized>(&self, files: &[PathBuf], target: &mut T) -> Result<RecoveryResult> {
        let result = self.recovery_engine().recover(files, target)?;
        if let Some(max_id) = result.max_segment_id {
            self.manager.advance_ids_past(max_id);
        }
        Ok(result)
    }

    /// Replay every segment left in the log directory, then delete them
    ///
    /// Files are only deleted after `target.flush()` succeeded, i.e. once
    /// their content is durable elsewhere. Segments of this instance,
    /// including the spare, are never touched.
    pub fn recover_directory<T: ReplayTarget + ?Sized>(&self, target: &mut T) -> Result<RecoveryResult> {
        let files: Vec<PathBuf> = list_segments(&self.config.log_dir, &self.config.file_prefix)?
            .into_iter()
            .map(|(_, path)| path)
            .filter(|path| !self.manager.manages(path))
            .collect();

        if files.is_empty() {
            info!(dir = %self.config.log_dir.display(), "no commit log segments to replay");
            return Ok(RecoveryResult::default());
        }

        let result = self.recover(&files, target)?;

        for path in &files {
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to delete replayed segment");
            }
        }

        Ok(result)
    }

    fn recovery_engine(&self) -> RecoveryEngine {
        RecoveryEngine::new(self.config.file_prefix.clone())
    }

    // =========================================================================
    // Testing Support
    // =========================================================================

    /// Discard all segments and delete their files
    ///
    /// Intended for tests that reuse one instance across cases.
    pub fn reset_unsafe(&self) -> Result<()> {
        self.manager.reset_unsafe()
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Number of active segments, tail included
    pub fn active_segment_count(&self) -> usize {
        self.manager.active_segment_count()
    }

    /// Position the next record will be written at
    pub fn current_position(&self) -> ReplayPosition {
        self.manager.current_position()
    }

    /// Largest payload `append` accepts
    pub fn max_payload_size(&self) -> usize {
        self.manager.max_payload_size()
    }

    pub fn segment_manager(&self) -> &SegmentManager {
        &self.manager
    }

    pub fn failure_handler(&self) -> &Arc<FailureHandler> {
        &self.failure
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn log_dir(&self) -> &Path {
        &self.config.log_dir
    }
}

impl Drop for CommitLog {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.shutdown();
        }
    }
}
