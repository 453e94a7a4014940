//! Tests for CommitLog
//!
//! These tests verify:
//! - Segment accounting across appends and discards
//! - The record size limit
//! - Concurrent appenders replay completely
//! - Background worker lifecycle
//! - Failure policy enforcement before and after start-up
//! - Directory recovery and test reset

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tempfile::TempDir;

use atlas_commitlog::failure::{ClusterMembership, ProcessControl};
use atlas_commitlog::wal::{list_segments, ApplyError, ReplayTarget};
use atlas_commitlog::{
    CommitFailurePolicy, CommitLog, CommitLogError, Config, FailureHandler, Mutation, PartitionId, RawMutation,
    ReplayPosition, WalSyncStrategy,
};

// =============================================================================
// Helper Functions
// =============================================================================

const SEGMENT_SIZE: u64 = 128 * 1024;

const KEYSPACE: &str = "Keyspace1";

/// A single-column write, serialized with its keyspace, key and column
struct TestMutation {
    partitions: [PartitionId; 1],
    key: &'static str,
    column: &'static str,
    timestamp: u64,
    value: Vec<u8>,
}

impl TestMutation {
    fn new(partition: u64, value_len: usize) -> Self {
        Self {
            partitions: [PartitionId(partition)],
            key: "k",
            column: "c1",
            timestamp: 0,
            value: vec![0xAB; value_len],
        }
    }

    /// Bytes the mutation adds around its value
    fn header_len() -> usize {
        TestMutation::new(0, 0).serialized_size()
    }
}

impl Mutation for TestMutation {
    fn partitions(&self) -> &[PartitionId] {
        &self.partitions
    }

    fn serialized_size(&self) -> usize {
        2 + KEYSPACE.len() + 2 + self.key.len() + 8 + 2 + self.column.len() + 8 + 4 + self.value.len()
    }

    fn serialize_into(&self, buf: &mut BytesMut) {
        buf.put_u16(KEYSPACE.len() as u16);
        buf.put_slice(KEYSPACE.as_bytes());
        buf.put_u16(self.key.len() as u16);
        buf.put_slice(self.key.as_bytes());
        buf.put_u64(self.partitions[0].0);
        buf.put_u16(self.column.len() as u16);
        buf.put_slice(self.column.as_bytes());
        buf.put_u64(self.timestamp);
        buf.put_u32(self.value.len() as u32);
        buf.put_slice(&self.value);
    }
}

/// Records termination instead of exiting
#[derive(Default)]
struct KillerForTests {
    killed: AtomicBool,
    quiet: AtomicBool,
}

impl ProcessControl for KillerForTests {
    fn terminate(&self, quiet: bool) {
        self.quiet.store(quiet, Ordering::SeqCst);
        self.killed.store(true, Ordering::SeqCst);
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

struct TestLog {
    _temp_dir: TempDir,
    log: CommitLog,
    killer: Arc<KillerForTests>,
    membership: Arc<FakeMembership>,
}

fn base_config(dir: &Path) -> Config {
    Config::builder()
        .log_dir(dir)
        .segment_size(SEGMENT_SIZE)
        .allocate_ahead(false)
        .failure_policy(CommitFailurePolicy::Stop)
        .build()
}

fn open_with(config_fn: impl FnOnce(&Path) -> Config) -> TestLog {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let killer = Arc::new(KillerForTests::default());
    let membership = Arc::new(FakeMembership::default());
    let handler = Arc::new(FailureHandler::new(
        CommitFailurePolicy::Stop,
        killer.clone(),
        membership.clone(),
    ));

    let log = CommitLog::open(config_fn(temp_dir.path()), handler).expect("Failed to open commit log");

    TestLog {
        _temp_dir: temp_dir,
        log,
        killer,
        membership,
    }
}

/// Handler whose actions nobody inspects
fn quiet_handler() -> Arc<FailureHandler> {
    Arc::new(FailureHandler::new(
        CommitFailurePolicy::Stop,
        Arc::new(KillerForTests::default()),
        Arc::new(FakeMembership::default()),
    ))
}

fn setup_log() -> TestLog {
    open_with(base_config)
}

/// Mutation whose record payload is exactly `payload_len` bytes
fn mutation_of_size(partition: u64, payload_len: usize) -> TestMutation {
    TestMutation::new(partition, payload_len - TestMutation::header_len())
}

/// Poll `condition` for up to two seconds
fn wait_for(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[derive(Default)]
struct Collector {
    records: Vec<(ReplayPosition, Bytes)>,
}

impl ReplayTarget for Collector {
    fn apply(&mut self, position: ReplayPosition, payload: Bytes) -> Result<(), ApplyError> {
        self.records.push((position, payload));
        Ok(())
    }
}

const CF_A: u64 = 1;
const CF_B: u64 = 2;

// =============================================================================
// Segment Accounting Tests
// =============================================================================

#[test]
fn test_clean_up_one_partition_keeps_segments_of_other() {
    let t = setup_log();
    let quarter = TestMutation::new(CF_A, (SEGMENT_SIZE / 4) as usize);

    // Roll over into a second segment
    for _ in 0..5 {
        t.log.append(&quarter).unwrap();
    }
    t.log.append(&TestMutation::new(CF_B, 4)).unwrap();
    assert_eq!(t.log.active_segment_count(), 2);

    // CF_A still dirty in both segments
    t.log.discard_completed(PartitionId(CF_B), t.log.current_position());
    assert_eq!(t.log.active_segment_count(), 2);
}

#[test]
fn test_rollover_and_reclaim_after_flush() {
    let t = setup_log();

    let a = TestMutation::new(CF_A, (SEGMENT_SIZE / 4) as usize - 1);
    t.log.append(&a).unwrap();
    t.log.append(&a).unwrap();
    assert_eq!(t.log.active_segment_count(), 1);

    // Everything of CF_A is flushed: the segment is clean but still the tail
    t.log.sync(true).unwrap();
    t.log.discard_completed(PartitionId(CF_A), t.log.current_position());
    assert_eq!(t.log.active_segment_count(), 1);

    let b = TestMutation::new(CF_B, (SEGMENT_SIZE / 2) as usize - 100);
    for _ in 0..3 {
        t.log.append(&b).unwrap();
    }
    assert_eq!(t.log.active_segment_count(), 3);

    t.log.sync(true).unwrap();
    t.log.discard_completed(PartitionId(CF_B), t.log.current_position());
    assert_eq!(t.log.active_segment_count(), 1);
}

#[test]
fn test_discard_is_idempotent() {
    let t = setup_log();
    let b = TestMutation::new(CF_B, (SEGMENT_SIZE / 2) as usize - 100);
    for _ in 0..3 {
        t.log.append(&b).unwrap();
    }
    let position = t.log.current_position();

    t.log.discard_completed(PartitionId(CF_B), position);
    t.log.discard_completed(PartitionId(CF_B), position);

    assert_eq!(t.log.active_segment_count(), 1);
    let files = list_segments(t.log.log_dir(), "CommitLog").unwrap();
    assert_eq!(files.len(), 1);
}

#[test]
fn test_discard_every_partition_leaves_tail() {
    let t = setup_log();
    let quarter = TestMutation::new(CF_B, (SEGMENT_SIZE / 4) as usize);
    for _ in 0..5 {
        t.log.append(&quarter).unwrap();
    }
    assert_eq!(t.log.active_segment_count(), 2);

    let position = t.log.current_position();
    t.log.discard_completed(PartitionId(CF_A), position);
    t.log.discard_completed(PartitionId(CF_B), position);

    assert_eq!(t.log.active_segment_count(), 1);
}

#[test]
fn test_positions_come_from_current_segment() {
    let t = setup_log();
    assert_eq!(t.log.current_position(), ReplayPosition::NONE);

    let first = t.log.append(&TestMutation::new(CF_A, 10)).unwrap();
    let after = t.log.current_position();

    assert_eq!(first.offset, 0);
    assert_eq!(after.segment_id, first.segment_id);
    assert!(after > first);
}

// =============================================================================
// Record Size Tests
// =============================================================================

#[test]
fn test_record_equal_to_limit_is_accepted() {
    let t = setup_log();
    let max = t.log.max_payload_size();

    t.log.append(&mutation_of_size(CF_A, max)).unwrap();

    assert_eq!(t.log.active_segment_count(), 1);
}

#[test]
fn test_record_over_limit_is_rejected() {
    let t = setup_log();
    let max = t.log.max_payload_size();

    let result = t.log.append(&mutation_of_size(CF_A, max + 1));

    match result {
        Err(CommitLogError::RecordTooLarge { size, max: limit }) => {
            assert_eq!(size, max + 1);
            assert_eq!(limit, max);
        }
        other => panic!("expected RecordTooLarge, got {:?}", other),
    }
    assert_eq!(t.log.active_segment_count(), 0);
    assert_eq!(t.log.failure_handler().failure_count(), 0);
    assert!(!t.membership.disabled.load(Ordering::SeqCst));
}

#[test]
fn test_empty_record_is_rejected_and_neighbours_replay() {
    let t = setup_log();

    let first = t.log.append(&RawMutation::new(PartitionId(CF_A), &b"first"[..])).unwrap();
    let empty = t.log.append(&RawMutation::new(PartitionId(CF_A), Bytes::new()));
    let third = t.log.append(&RawMutation::new(PartitionId(CF_A), &b"third"[..])).unwrap();
    t.log.sync(true).unwrap();

    assert!(matches!(empty, Err(CommitLogError::EmptyRecord)));
    assert_eq!(t.log.failure_handler().failure_count(), 0);

    let files: Vec<_> = t.log.segment_manager().segments().iter().map(|s| s.path().to_path_buf()).collect();
    let mut collector = Collector::default();
    let result = t.log.recover(&files, &mut collector).unwrap();

    assert_eq!(result.incomplete_files, 0);
    assert_eq!(
        collector.records,
        vec![(first, Bytes::from_static(b"first")), (third, Bytes::from_static(b"third"))]
    );
}

#[test]
fn test_raw_payload_limit() {
    let t = setup_log();
    let max = t.log.max_payload_size();

    assert!(t.log.append(&RawMutation::new(PartitionId(CF_A), vec![0u8; max])).is_ok());
    assert!(t.log.append(&RawMutation::new(PartitionId(CF_A), vec![0u8; max + 1])).is_err());
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_appenders_replay_everything() {
    let t = open_with(|dir| {
        Config::builder()
            .log_dir(dir)
            .segment_size(32 * 1024)
            .allocate_ahead(true)
            .sync_strategy(WalSyncStrategy::Periodic { interval_ms: 5 })
            .build()
    });
    t.log.start().unwrap();

    let log = Arc::new(t.log);
    let writers: u64 = 6;
    let per_writer: u64 = 300;

    let handles: Vec<_> = (0..writers)
        .map(|w| {
            let log = Arc::clone(&log);
            thread::spawn(move || {
                for i in 0..per_writer {
                    let payload = format!("writer-{}-record-{}", w, i);
                    log.append(&RawMutation::new(PartitionId(w), payload.into_bytes())).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    log.stop().unwrap();
    assert!(!log.is_running());

    // A fresh instance replays what the first one left behind
    let config = log.config().clone();
    let handler = Arc::clone(log.failure_handler());
    drop(log);
    let replay = CommitLog::open(config, handler).unwrap();

    let mut collector = Collector::default();
    let result = replay.recover_directory(&mut collector).unwrap();

    assert_eq!(result.records_replayed, writers * per_writer);
    assert_eq!(result.incomplete_files, 0);
    let unique: HashSet<&Bytes> = collector.records.iter().map(|(_, p)| p).collect();
    assert_eq!(unique.len(), (writers * per_writer) as usize);
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_start_is_idempotent_and_allocates_spare() {
    let t = open_with(|dir| Config::builder().log_dir(dir).segment_size(SEGMENT_SIZE).build());

    t.log.start().unwrap();
    t.log.start().unwrap();
    assert!(t.log.is_running());

    assert!(wait_for(|| t.log.segment_manager().has_spare()));
    assert_eq!(t.log.active_segment_count(), 0);

    t.log.stop().unwrap();
    assert!(!t.log.is_running());
    assert!(list_segments(t.log.log_dir(), "CommitLog").unwrap().is_empty());
}

#[test]
fn test_sync_through_worker() {
    let t = open_with(|dir| Config::builder().log_dir(dir).segment_size(SEGMENT_SIZE).build());
    t.log.start().unwrap();

    t.log.append(&TestMutation::new(CF_A, 100)).unwrap();
    t.log.sync(false).unwrap();
    t.log.sync(true).unwrap();

    t.log.stop().unwrap();
}

#[test]
fn test_every_write_mode() {
    let t = open_with(|dir| {
        Config::builder()
            .log_dir(dir)
            .segment_size(SEGMENT_SIZE)
            .sync_strategy(WalSyncStrategy::EveryWrite)
            .build()
    });
    t.log.start().unwrap();

    for _ in 0..10 {
        t.log.append(&TestMutation::new(CF_A, 1000)).unwrap();
    }

    t.log.stop().unwrap();
    assert_eq!(t.log.active_segment_count(), 1);
}

#[test]
fn test_reset_unsafe() {
    let t = setup_log();
    let b = TestMutation::new(CF_B, (SEGMENT_SIZE / 2) as usize - 100);
    for _ in 0..3 {
        t.log.append(&b).unwrap();
    }

    t.log.reset_unsafe().unwrap();

    assert_eq!(t.log.active_segment_count(), 0);
    assert_eq!(t.log.current_position(), ReplayPosition::NONE);
    assert!(list_segments(t.log.log_dir(), "CommitLog").unwrap().is_empty());
}

// =============================================================================
// Failure Policy Tests
// =============================================================================

/// Replace the log directory with a regular file so creating segments fails
fn break_log_dir(dir: &Path) {
    fs::remove_dir_all(dir).unwrap();
    fs::write(dir, b"not a directory").unwrap();
}

#[test]
fn test_failure_before_startup_terminates_quietly() {
    let t = open_with(|dir| {
        Config::builder()
            .log_dir(dir.join("commitlog"))
            .segment_size(SEGMENT_SIZE)
            .failure_policy(CommitFailurePolicy::Ignore)
            .build()
    });
    break_log_dir(t.log.log_dir());

    // Spare allocation on the worker fails
    t.log.start().unwrap();

    assert!(wait_for(|| t.killer.killed.load(Ordering::SeqCst)));
    assert!(t.killer.quiet.load(Ordering::SeqCst));
    t.log.stop().unwrap();
}

#[test]
fn test_failure_after_startup_ignored() {
    let t = open_with(|dir| {
        Config::builder()
            .log_dir(dir.join("commitlog"))
            .segment_size(SEGMENT_SIZE)
            .failure_policy(CommitFailurePolicy::Ignore)
            .build()
    });
    t.log.failure_handler().mark_started();
    break_log_dir(t.log.log_dir());

    t.log.start().unwrap();

    assert!(wait_for(|| t.log.failure_handler().failure_count() >= 1));
    assert!(!t.killer.killed.load(Ordering::SeqCst));
    assert!(!t.membership.disabled.load(Ordering::SeqCst));

    // Writes keep being attempted
    assert!(matches!(t.log.append(&TestMutation::new(CF_A, 10)), Err(CommitLogError::Io(_))));
    assert!(t.log.append(&TestMutation::new(CF_A, 10)).is_err());
    assert!(!t.killer.killed.load(Ordering::SeqCst));

    t.log.stop().unwrap();
}

#[test]
fn test_failure_after_startup_stop_policy() {
    let t = open_with(|dir| {
        Config::builder()
            .log_dir(dir.join("commitlog"))
            .segment_size(SEGMENT_SIZE)
            .allocate_ahead(false)
            .failure_policy(CommitFailurePolicy::Stop)
            .build()
    });
    t.log.failure_handler().mark_started();
    break_log_dir(t.log.log_dir());

    assert!(t.log.append(&TestMutation::new(CF_A, 10)).is_err());

    assert!(t.membership.disabled.load(Ordering::SeqCst));
    assert!(!t.killer.killed.load(Ordering::SeqCst));
}

#[test]
fn test_failure_after_startup_die_policy() {
    let t = open_with(|dir| {
        Config::builder()
            .log_dir(dir.join("commitlog"))
            .segment_size(SEGMENT_SIZE)
            .allocate_ahead(false)
            .failure_policy(CommitFailurePolicy::Die)
            .build()
    });
    t.log.failure_handler().mark_started();
    break_log_dir(t.log.log_dir());

    assert!(t.log.append(&TestMutation::new(CF_A, 10)).is_err());

    assert!(t.killer.killed.load(Ordering::SeqCst));
    assert!(!t.killer.quiet.load(Ordering::SeqCst));
}

// =============================================================================
// Recovery Tests
// =============================================================================

#[test]
fn test_recover_directory_replays_and_deletes() {
    let temp_dir = TempDir::new().unwrap();
    let config = base_config(temp_dir.path());

    let first = CommitLog::open(config.clone(), quiet_handler()).unwrap();
    let mut written = Vec::new();
    for i in 0..5u64 {
        let mutation = TestMutation::new(i, (SEGMENT_SIZE / 4) as usize);
        written.push(first.append(&mutation).unwrap());
    }
    first.stop().unwrap();
    let old_ids: Vec<u64> = first.segment_manager().segments().iter().map(|s| s.id()).collect();
    drop(first);

    let second = CommitLog::open(config, quiet_handler()).unwrap();
    let mut collector = Collector::default();
    let result = second.recover_directory(&mut collector).unwrap();

    assert_eq!(result.files_recovered, 2);
    let replayed: Vec<ReplayPosition> = collector.records.iter().map(|(p, _)| *p).collect();
    assert_eq!(replayed, written);
    assert!(list_segments(temp_dir.path(), "CommitLog").unwrap().is_empty());

    let position = second.append(&TestMutation::new(CF_A, 1)).unwrap();
    assert!(old_ids.iter().all(|id| position.segment_id > *id));

    // Nothing left to replay; the live segment is not touched
    let again = second.recover_directory(&mut Collector::default()).unwrap();
    assert_eq!(again.files_recovered, 0);
    assert_eq!(second.active_segment_count(), 1);
}

#[test]
fn test_recover_directory_leaves_spare_alone() {
    let t = open_with(|dir| Config::builder().log_dir(dir).segment_size(SEGMENT_SIZE).build());
    t.log.start().unwrap();
    assert!(wait_for(|| t.log.segment_manager().has_spare()));

    let result = t.log.recover_directory(&mut Collector::default()).unwrap();
    assert_eq!(result.files_recovered, 0);

    // The first append activates the spare
    let position = t.log.append(&TestMutation::new(CF_A, 10)).unwrap();
    t.log.sync(true).unwrap();

    let tail = t.log.segment_manager().segments().pop().unwrap();
    assert_eq!(tail.id(), position.segment_id);
    assert!(tail.path().exists());
    t.log.stop().unwrap();
}

#[test]
fn test_open_applies_configured_policy() {
    let temp_dir = TempDir::new().unwrap();
    let handler = Arc::new(FailureHandler::new(
        CommitFailurePolicy::Die,
        Arc::new(KillerForTests::default()),
        Arc::new(FakeMembership::default()),
    ));
    let config = Config::builder()
        .log_dir(temp_dir.path())
        .failure_policy(CommitFailurePolicy::Ignore)
        .build();

    let log = CommitLog::open(config, Arc::clone(&handler)).unwrap();
    assert_eq!(handler.policy(), CommitFailurePolicy::Ignore);

    log.failure_handler().set_policy(CommitFailurePolicy::Stop);
    assert_eq!(handler.policy(), CommitFailurePolicy::Stop);
}

#[test]
fn test_recover_explicit_files() {
    let t = setup_log();
    let position = t.log.append(&TestMutation::new(CF_A, 10)).unwrap();
    t.log.sync(true).unwrap();

    let files: Vec<_> = t.log.segment_manager().segments().iter().map(|s| s.path().to_path_buf()).collect();
    let mut collector = Collector::default();
    let result = t.log.recover(&files, &mut collector).unwrap();

    assert_eq!(result.records_replayed, 1);
    assert_eq!(collector.records[0].0, position);
    assert_eq!(collector.records[0].1.len(), TestMutation::header_len() + 10);
}
