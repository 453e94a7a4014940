//! Background sync worker
//!
//! One thread per commit log, started and stopped explicitly. It performs
//! periodic syncs, batched `sync(false)` requests and spare segment
//! allocation, so appenders only ever allocate when the tail is full and no
//! spare is ready.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{never, select, tick, unbounded, Receiver, Sender};
use tracing::{debug, error, info};

use crate::error::Result;

use super::SegmentManager;

/// Requests accepted by the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    AllocateSpare,
    Sync,
    Shutdown,
}

/// Handle to the running worker thread
pub struct SyncWorker {
    commands: Sender<WorkerCommand>,
    handle: Option<JoinHandle<()>>,
    manager: Arc<SegmentManager>,
}

impl SyncWorker {
    /// Spawn the worker and attach it to `manager`
    ///
    /// `interval` drives periodic syncs; `None` disables them.
    pub fn spawn(manager: Arc<SegmentManager>, interval: Option<Duration>) -> Result<Self> {
        let (commands, inbox) = unbounded();

        let thread_manager = Arc::clone(&manager);
        let handle = thread::Builder::new()
            .name("commitlog-sync".to_string())
            .spawn(move || run(thread_manager, inbox, interval))?;

        manager.attach_worker(commands.clone());
        let allocate_ahead = manager.allocates_ahead();
        if allocate_ahead {
            let _ = commands.send(WorkerCommand::AllocateSpare);
        }

        info!(?interval, allocate_ahead, "commit log sync worker started");

        Ok(Self {
            commands,
            handle: Some(handle),
            manager,
        })
    }

    /// Stop the worker and wait for it to exit
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.manager.detach_worker();
        let _ = self.commands.send(WorkerCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("commit log sync worker panicked");
            }
        }
    }
}

impl Drop for SyncWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop_and_join();
        }
    }
}

fn run(manager: Arc<SegmentManager>, inbox: Receiver<WorkerCommand>, interval: Option<Duration>) {
    let ticker: Receiver<Instant> = match interval {
        Some(interval) => tick(interval),
        None => never(),
    };

    loop {
        select! {
            recv(inbox) -> command => match command {
                Ok(WorkerCommand::AllocateSpare) => allocate_spare(&manager),
                Ok(WorkerCommand::Sync) => sync(&manager),
                Ok(WorkerCommand::Shutdown) | Err(_) => break,
            },
            recv(ticker) -> _ => {
                sync(&manager);
                allocate_spare(&manager);
            }
        }
    }

    debug!("commit log sync worker exiting");
}

// Failures were already routed through the failure policy by the manager.

fn allocate_spare(manager: &SegmentManager) {
    if let Err(e) = manager.ensure_spare() {
        debug!(error = %e, "spare segment allocation failed");
    }
}

fn sync(manager: &SegmentManager) {
    if let Err(e) = manager.sync_all(false) {
        debug!(error = %e, "background sync failed");
    }
}
