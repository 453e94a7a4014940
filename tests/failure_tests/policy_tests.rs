//! Tests for the commit failure policy
//!
//! These tests verify:
//! - Failures before start-up always terminate quietly
//! - After start-up each policy takes its own action
//! - The policy is read at the time of each failure

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use atlas_commitlog::failure::{ClusterMembership, ProcessControl, StartupPhase};
use atlas_commitlog::{CommitFailurePolicy, CommitLogError, FailureAction, FailureHandler};

// =============================================================================
// Helper Functions
// =============================================================================

/// Records terminate calls instead of exiting
#[derive(Default)]
struct KillerForTests {
    killed: AtomicBool,
    quiet: AtomicBool,
    calls: AtomicUsize,
}

impl ProcessControl for KillerForTests {
    fn terminate(&self, quiet: bool) {
        self.killed.store(true, Ordering::SeqCst);
        self.quiet.store(quiet, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

impl KillerForTests {
    fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    fn was_quiet(&self) -> bool {
        self.quiet.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FakeMembership {
    disabled: AtomicBool,
}

impl ClusterMembership for FakeMembership {
    fn disable_participation(&self) {
        self.disabled.store(true, Ordering::SeqCst);
    }
}

impl FakeMembership {
    fn was_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }
}

fn setup(policy: CommitFailurePolicy) -> (FailureHandler, Arc<KillerForTests>, Arc<FakeMembership>) {
    let killer = Arc::new(KillerForTests::default());
    let membership = Arc::new(FakeMembership::default());
    let handler = FailureHandler::new(policy, killer.clone(), membership.clone());
    (handler, killer, membership)
}

fn disk_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "disk on fire")
}

// =============================================================================
// Before Start-up
// =============================================================================

#[test]
fn test_any_policy_terminates_quietly_before_startup() {
    for policy in [CommitFailurePolicy::Stop, CommitFailurePolicy::Die, CommitFailurePolicy::Ignore] {
        let (handler, killer, membership) = setup(policy);
        assert_eq!(handler.phase(), StartupPhase::NotStarted);

        let action = handler.handle_commit_error("Test", &disk_error());

        assert_eq!(action, FailureAction::Terminated { quiet: true }, "policy {}", policy);
        assert!(killer.was_killed());
        assert!(killer.was_quiet());
        assert!(!membership.was_disabled());
    }
}

// =============================================================================
// After Start-up
// =============================================================================

#[test]
fn test_stop_disables_participation() {
    let (handler, killer, membership) = setup(CommitFailurePolicy::Stop);
    handler.mark_started();

    let action = handler.handle_commit_error("Test", &disk_error());

    assert_eq!(action, FailureAction::StoppedParticipation);
    assert!(membership.was_disabled());
    assert!(!killer.was_killed());
}

#[test]
fn test_die_terminates_loudly() {
    let (handler, killer, membership) = setup(CommitFailurePolicy::Die);
    handler.mark_started();

    let action = handler.handle_commit_error("Test", &disk_error());

    assert_eq!(action, FailureAction::Terminated { quiet: false });
    assert!(killer.was_killed());
    assert!(!killer.was_quiet());
    assert!(!membership.was_disabled());
}

#[test]
fn test_ignore_only_logs() {
    let (handler, killer, membership) = setup(CommitFailurePolicy::Ignore);
    handler.mark_started();

    let action = handler.handle_commit_error("Test", &disk_error());

    assert_eq!(action, FailureAction::Ignored);
    assert!(!killer.was_killed());
    assert!(!membership.was_disabled());
}

#[test]
fn test_policy_change_applies_to_next_failure() {
    let (handler, killer, _membership) = setup(CommitFailurePolicy::Ignore);
    handler.mark_started();

    assert_eq!(handler.handle_commit_error("first", &disk_error()), FailureAction::Ignored);
    assert!(!killer.was_killed());

    handler.set_policy(CommitFailurePolicy::Die);
    assert_eq!(handler.policy(), CommitFailurePolicy::Die);

    assert_eq!(
        handler.handle_commit_error("second", &disk_error()),
        FailureAction::Terminated { quiet: false }
    );
    assert_eq!(killer.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failures_are_counted() {
    let (handler, _killer, _membership) = setup(CommitFailurePolicy::Ignore);
    handler.mark_started();

    for _ in 0..3 {
        handler.handle_commit_error("Test", &disk_error());
    }

    assert_eq!(handler.failure_count(), 3);
}

#[test]
fn test_commit_log_error_as_cause() {
    let (handler, _killer, membership) = setup(CommitFailurePolicy::Stop);
    handler.mark_started();

    let error = CommitLogError::Io(disk_error());
    handler.handle_commit_error("Failed to write commit log record", &error);

    assert!(membership.was_disabled());
}

// =============================================================================
// Policy Parsing
// =============================================================================

#[test]
fn test_policy_from_str() {
    assert_eq!("stop".parse::<CommitFailurePolicy>().unwrap(), CommitFailurePolicy::Stop);
    assert_eq!("DIE".parse::<CommitFailurePolicy>().unwrap(), CommitFailurePolicy::Die);
    assert_eq!("Ignore".parse::<CommitFailurePolicy>().unwrap(), CommitFailurePolicy::Ignore);
    assert!(matches!(
        "best_effort".parse::<CommitFailurePolicy>(),
        Err(CommitLogError::Config(_))
    ));
}

#[test]
fn test_policy_display_round_trips() {
    for policy in [CommitFailurePolicy::Stop, CommitFailurePolicy::Die, CommitFailurePolicy::Ignore] {
        assert_eq!(policy.to_string().parse::<CommitFailurePolicy>().unwrap(), policy);
    }
}

#[test]
fn test_default_policy_is_stop() {
    assert_eq!(CommitFailurePolicy::default(), CommitFailurePolicy::Stop);
}
