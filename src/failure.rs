//! Commit failure policy
//!
//! Decides what the process does when the commit log cannot be written.
//!
//! ## Decision Table
//! ```text
//! phase        policy   action
//! ──────────── ──────── ─────────────────────────────────
//! NotStarted   any      terminate quietly
//! Started      Stop     disable cluster participation
//! Started      Die      terminate (loud)
//! Started      Ignore   log only
//! ```
//!
//! Process termination and cluster membership are injected capabilities, so
//! tests substitute fakes instead of killing the test runner.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, warn};

use crate::error::CommitLogError;

/// Exit status used when the commit log kills the process
pub const COMMIT_FAILURE_EXIT_CODE: i32 = 100;

/// How to react to commit log I/O failures once the node is serving
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitFailurePolicy {
    /// Leave the cluster but keep the process alive for inspection
    #[default]
    Stop,

    /// Terminate the process
    Die,

    /// Log and carry on
    Ignore,
}

impl fmt::Display for CommitFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommitFailurePolicy::Stop => "stop",
            CommitFailurePolicy::Die => "die",
            CommitFailurePolicy::Ignore => "ignore",
        };
        f.write_str(name)
    }
}

impl FromStr for CommitFailurePolicy {
    type Err = CommitLogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stop" => Ok(CommitFailurePolicy::Stop),
            "die" => Ok(CommitFailurePolicy::Die),
            "ignore" => Ok(CommitFailurePolicy::Ignore),
            other => Err(CommitLogError::Config(format!(
                "unknown commit failure policy: {}",
                other
            ))),
        }
    }
}

/// Process initialization phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupPhase {
    NotStarted,
    Started,
}

/// What `handle_commit_error` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Terminated { quiet: bool },
    StoppedParticipation,
    Ignored,
}

/// Terminates the process
pub trait ProcessControl: Send + Sync {
    /// `quiet` skips policy side effects (used before start-up completes)
    fn terminate(&self, quiet: bool);
}

/// This node's participation in cluster membership/gossip
pub trait ClusterMembership: Send + Sync {
    fn disable_participation(&self);
}

/// Exits the real process
#[derive(Debug, Default)]
pub struct ProcessExit;

impl ProcessControl for ProcessExit {
    fn terminate(&self, quiet: bool) {
        if !quiet {
            error!(exit_code = COMMIT_FAILURE_EXIT_CODE, "terminating process after commit log failure");
        }
        std::process::exit(COMMIT_FAILURE_EXIT_CODE);
    }
}

/// Membership for a node that is not part of a cluster
#[derive(Debug, Default)]
pub struct StandaloneMembership;

impl ClusterMembership for StandaloneMembership {
    fn disable_participation(&self) {
        warn!("commit failure policy 'stop': no cluster membership to disable");
    }
}

/// Enforces the commit failure policy
pub struct FailureHandler {
    policy: RwLock<CommitFailurePolicy>,
    started: AtomicBool,
    failures: AtomicU64,
    process: Arc<dyn ProcessControl>,
    membership: Arc<dyn ClusterMembership>,
}

impl FailureHandler {
    pub fn new(
        policy: CommitFailurePolicy,
        process: Arc<dyn ProcessControl>,
        membership: Arc<dyn ClusterMembership>,
    ) -> Self {
        Self {
            policy: RwLock::new(policy),
            started: AtomicBool::new(false),
            failures: AtomicU64::new(0),
            process,
            membership,
        }
    }

    /// Handler wired to the real process and no cluster
    pub fn standalone(policy: CommitFailurePolicy) -> Self {
        Self::new(policy, Arc::new(ProcessExit), Arc::new(StandaloneMembership))
    }

    /// React to a commit log failure according to phase and current policy
    pub fn handle_commit_error(&self, message: &str, cause: &dyn std::error::Error) -> FailureAction {
        self.failures.fetch_add(1, Ordering::Relaxed);

        if self.phase() == StartupPhase::NotStarted {
            error!(%message, %cause, "exiting due to commit log failure during initialization");
            self.process.terminate(true);
            return FailureAction::Terminated { quiet: true };
        }

        let policy = self.policy();
        match policy {
            CommitFailurePolicy::Stop => {
                error!(%message, %cause, %policy, "commit log failure, disabling cluster participation");
                self.membership.disable_participation();
                FailureAction::StoppedParticipation
            }
            CommitFailurePolicy::Die => {
                error!(%message, %cause, %policy, "commit log failure, terminating");
                self.process.terminate(false);
                FailureAction::Terminated { quiet: false }
            }
            CommitFailurePolicy::Ignore => {
                error!(%message, %cause, %policy, "commit log failure ignored");
                FailureAction::Ignored
            }
        }
    }

    pub fn policy(&self) -> CommitFailurePolicy {
        *self.policy.read()
    }

    pub fn set_policy(&self, policy: CommitFailurePolicy) {
        *self.policy.write() = policy;
    }

    /// Called by bootstrap once the node is serving traffic
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub fn phase(&self) -> StartupPhase {
        if self.started.load(Ordering::Acquire) {
            StartupPhase::Started
        } else {
            StartupPhase::NotStarted
        }
    }

    /// Number of failures handled so far
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for FailureHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureHandler")
            .field("policy", &self.policy())
            .field("phase", &self.phase())
            .field("failures", &self.failure_count())
            .finish()
    }
}
