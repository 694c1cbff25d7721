//! Integration tests for bootstrap: index load, binlog replay and tail repair
//!
//! These tests verify that bootstrap:
//! 1. Replays every committed record in order
//! 2. Truncates a torn tail exactly once and never loses a committed record
//! 3. Resumes appends at the repaired position
//! 4. Drops a last segment whose header a crash cut off during rotation
//! 5. Refuses inconsistent replicas instead of guessing

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use bayes_core::LogPosition;
use bayes_durability::{
    BinlogConfig, BinlogRecord, BinlogWriter, BootstrapCoordinator, BootstrapError,
    IndexSnapshot, IndexWriter, ReadStopReason, RecordKind, ReplayError, ReplicaPaths,
};
use tempfile::TempDir;

fn paths(dir: &Path) -> ReplicaPaths {
    ReplicaPaths::from_prefix(dir.join("bayes")).unwrap()
}

fn teach(i: u64) -> BinlogRecord {
    BinlogRecord::teach(RecordKind::SetSpam, 1_700_000_000 + i as i64, &[i, i * 31])
}

/// Write `count` records through a fresh writer and return the final position.
fn write_log(paths: &ReplicaPaths, config: BinlogConfig, count: u64) -> LogPosition {
    let mut writer =
        BinlogWriter::create(paths.clone(), [1; 16], LogPosition::ORIGIN, config).unwrap();
    for i in 0..count {
        writer.append(&teach(i)).unwrap();
    }
    writer.sync().unwrap();
    writer.position()
}

/// Bootstrap and collect the first word hash of every replayed record.
fn replay(
    coordinator: &BootstrapCoordinator,
) -> Result<(bayes_durability::Bootstrap, Vec<u64>), BootstrapError> {
    let mut seen = Vec::new();
    let boot = coordinator.bootstrap(
        |_| Ok(()),
        |record| {
            seen.push(record.word_hashes().map_err(|e| e.to_string())?[0]);
            Ok(())
        },
    )?;
    Ok((boot, seen))
}

fn last_segment(paths: &ReplicaPaths) -> std::path::PathBuf {
    paths.list_segments().unwrap().pop().unwrap().path
}

// ============================================================================
// Clean logs
// ============================================================================

#[test]
fn test_empty_replica_starts_at_origin() {
    let temp_dir = TempDir::new().unwrap();
    let p = paths(temp_dir.path());
    let coordinator = BootstrapCoordinator::new(p.clone(), BinlogConfig::default());

    let (boot, seen) = replay(&coordinator).unwrap();
    assert!(seen.is_empty());
    assert_eq!(boot.position, LogPosition::ORIGIN);
    assert!(boot.index.is_none());
    assert!(boot.last_segment.is_none());

    let writer = coordinator.open_writer(&boot).unwrap();
    assert_eq!(writer.position(), LogPosition::ORIGIN);
    assert_eq!(p.list_segments().unwrap().len(), 1);
}

#[test]
fn test_replays_all_records_in_order() {
    let temp_dir = TempDir::new().unwrap();
    let p = paths(temp_dir.path());
    let end = write_log(&p, BinlogConfig::default(), 20);

    let coordinator = BootstrapCoordinator::new(p, BinlogConfig::default());
    let (boot, seen) = replay(&coordinator).unwrap();

    assert_eq!(seen, (0..20).collect::<Vec<_>>());
    assert_eq!(boot.position, end);
    assert_eq!(boot.replica_id, [1; 16]);
    assert!(boot.repaired.is_none());
}

#[test]
fn test_replay_across_rotated_segments() {
    let temp_dir = TempDir::new().unwrap();
    let p = paths(temp_dir.path());
    let config = BinlogConfig::for_testing()
        .with_max_segment_size(1024)
        .with_flush_threshold(256);
    let end = write_log(&p, config.clone(), 200);
    assert!(p.list_segments().unwrap().len() > 2);

    let coordinator = BootstrapCoordinator::new(p.clone(), config);
    let (boot, seen) = replay(&coordinator).unwrap();
    assert_eq!(seen.len(), 200);
    assert_eq!(boot.position, end);
    assert_eq!(boot.stats.segments_read, p.list_segments().unwrap().len());
}

// ============================================================================
// Tail repair
// ============================================================================

#[test]
fn test_torn_tail_is_truncated_once() {
    let temp_dir = TempDir::new().unwrap();
    let p = paths(temp_dir.path());
    let end = write_log(&p, BinlogConfig::default(), 5);
    let seg = last_segment(&p);
    let good_size = std::fs::metadata(&seg).unwrap().len();

    // simulate a crash in the middle of writing a sixth record
    let torn = teach(5).encode(&end);
    let mut file = OpenOptions::new().append(true).open(&seg).unwrap();
    file.write_all(&torn[..torn.len() / 2]).unwrap();
    drop(file);

    let coordinator = BootstrapCoordinator::new(p.clone(), BinlogConfig::default());
    let (boot, seen) = replay(&coordinator).unwrap();
    assert_eq!(seen.len(), 5);
    assert_eq!(boot.position, end);
    let repair = boot.repaired.clone().expect("tail repaired");
    assert!(matches!(repair.reason, ReadStopReason::PartialRecord { .. }));
    assert_eq!(repair.physical_offset, good_size);
    assert_eq!(std::fs::metadata(&seg).unwrap().len(), good_size);

    // second startup is clean and identical
    let (again, seen_again) = replay(&coordinator).unwrap();
    assert!(again.repaired.is_none());
    assert_eq!(again.position, end);
    assert_eq!(seen_again, seen);
}

#[test]
fn test_appends_resume_after_repair() {
    let temp_dir = TempDir::new().unwrap();
    let p = paths(temp_dir.path());
    let end = write_log(&p, BinlogConfig::default(), 3);
    let seg = last_segment(&p);

    let mut file = OpenOptions::new().append(true).open(&seg).unwrap();
    file.write_all(&[0xff; 7]).unwrap();
    drop(file);

    let coordinator = BootstrapCoordinator::new(p.clone(), BinlogConfig::default());
    let (boot, _) = replay(&coordinator).unwrap();
    assert_eq!(boot.position, end);

    let mut writer = coordinator.open_writer(&boot).unwrap();
    writer.append(&teach(100)).unwrap();
    writer.sync().unwrap();
    drop(writer);

    let (boot, seen) = replay(&coordinator).unwrap();
    assert!(boot.repaired.is_none());
    assert_eq!(seen, vec![0, 1, 2, 100]);
}

#[test]
fn test_torn_rotation_header_is_discarded() {
    let temp_dir = TempDir::new().unwrap();
    let p = paths(temp_dir.path());
    let end = write_log(&p, BinlogConfig::default(), 3);

    // crash while the next segment's header was being written
    let torn = p.segment_path(end.offset);
    std::fs::write(&torn, b"BYS").unwrap();

    let coordinator = BootstrapCoordinator::new(p.clone(), BinlogConfig::default());
    let (boot, seen) = replay(&coordinator).unwrap();
    assert_eq!(seen, vec![0, 1, 2]);
    assert_eq!(boot.position, end);
    assert!(boot.repaired.is_none());
    assert_eq!(boot.discarded_segment.as_deref(), Some(torn.as_path()));
    assert!(!torn.exists());

    let mut writer = coordinator.open_writer(&boot).unwrap();
    writer.append(&teach(100)).unwrap();
    writer.sync().unwrap();
    drop(writer);

    let (boot, seen) = replay(&coordinator).unwrap();
    assert!(boot.discarded_segment.is_none());
    assert_eq!(seen, vec![0, 1, 2, 100]);
}

#[test]
fn test_torn_first_segment_starts_over() {
    let temp_dir = TempDir::new().unwrap();
    let p = paths(temp_dir.path());
    std::fs::write(p.segment_path(0), [0u8; 20]).unwrap();

    let coordinator = BootstrapCoordinator::new(p.clone(), BinlogConfig::default());
    let (boot, seen) = replay(&coordinator).unwrap();
    assert!(seen.is_empty());
    assert_eq!(boot.position, LogPosition::ORIGIN);
    assert!(boot.last_segment.is_none());

    let mut writer = coordinator.open_writer(&boot).unwrap();
    writer.append(&teach(7)).unwrap();
    writer.sync().unwrap();
    drop(writer);

    let (_, seen) = replay(&coordinator).unwrap();
    assert_eq!(seen, vec![7]);
}

#[test]
fn test_read_only_bootstrap_keeps_torn_segment() {
    let temp_dir = TempDir::new().unwrap();
    let p = paths(temp_dir.path());
    let end = write_log(&p, BinlogConfig::default(), 2);
    let torn = p.segment_path(end.offset);
    std::fs::write(&torn, b"BY").unwrap();

    let coordinator =
        BootstrapCoordinator::new(p.clone(), BinlogConfig::default()).with_repair(false);
    let (boot, seen) = replay(&coordinator).unwrap();
    assert_eq!(seen, vec![0, 1]);
    assert_eq!(boot.position, end);
    assert!(boot.discarded_segment.is_none());
    assert!(torn.exists());
}

#[test]
fn test_header_less_segment_past_the_end_is_fatal() {
    let temp_dir = TempDir::new().unwrap();
    let p = paths(temp_dir.path());
    let end = write_log(&p, BinlogConfig::default(), 2);
    std::fs::write(p.segment_path(end.offset + 64), b"BYS").unwrap();

    let coordinator = BootstrapCoordinator::new(p, BinlogConfig::default());
    let err = replay(&coordinator).unwrap_err();
    assert!(matches!(
        err,
        BootstrapError::Replay(ReplayError::UnreadableSegment { .. })
    ));
}

#[test]
fn test_crc_damage_in_last_record_is_repaired() {
    let temp_dir = TempDir::new().unwrap();
    let p = paths(temp_dir.path());
    write_log(&p, BinlogConfig::default(), 4);
    let seg = last_segment(&p);

    let mut bytes = std::fs::read(&seg).unwrap();
    let last = bytes.len() - 2;
    bytes[last] ^= 0x55;
    std::fs::write(&seg, &bytes).unwrap();

    let coordinator = BootstrapCoordinator::new(p, BinlogConfig::default());
    let (boot, seen) = replay(&coordinator).unwrap();
    assert_eq!(seen.len(), 3);
    assert!(matches!(
        boot.repaired.unwrap().reason,
        ReadStopReason::ChecksumMismatch { .. }
    ));
}

#[test]
fn test_disabled_checksums_accept_damaged_crc() {
    let temp_dir = TempDir::new().unwrap();
    let p = paths(temp_dir.path());
    write_log(&p, BinlogConfig::default(), 4);
    let seg = last_segment(&p);

    let mut bytes = std::fs::read(&seg).unwrap();
    let last = bytes.len() - 2;
    bytes[last] ^= 0x55;
    std::fs::write(&seg, &bytes).unwrap();

    let config = BinlogConfig::default().with_verify_checksums(false);
    let coordinator = BootstrapCoordinator::new(p, config);
    let (boot, seen) = replay(&coordinator).unwrap();
    assert_eq!(seen.len(), 4);
    assert!(boot.repaired.is_none());
}

#[test]
fn test_read_only_bootstrap_leaves_tail() {
    let temp_dir = TempDir::new().unwrap();
    let p = paths(temp_dir.path());
    write_log(&p, BinlogConfig::default(), 2);
    let seg = last_segment(&p);
    let mut file = OpenOptions::new().append(true).open(&seg).unwrap();
    file.write_all(&[1, 2, 3]).unwrap();
    drop(file);
    let damaged_size = std::fs::metadata(&seg).unwrap().len();

    let coordinator =
        BootstrapCoordinator::new(p, BinlogConfig::default()).with_repair(false);
    let (boot, seen) = replay(&coordinator).unwrap();
    assert_eq!(seen.len(), 2);
    assert!(boot.repaired.is_none());
    assert_eq!(std::fs::metadata(&seg).unwrap().len(), damaged_size);
}

// ============================================================================
// Fatal inconsistencies
// ============================================================================

#[test]
fn test_damage_in_earlier_segment_is_fatal() {
    let temp_dir = TempDir::new().unwrap();
    let p = paths(temp_dir.path());
    let config = BinlogConfig::for_testing()
        .with_max_segment_size(1024)
        .with_flush_threshold(256);
    write_log(&p, config.clone(), 100);

    let first = p.list_segments().unwrap()[0].path.clone();
    let mut bytes = std::fs::read(&first).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xff;
    std::fs::write(&first, &bytes).unwrap();

    let coordinator = BootstrapCoordinator::new(p, config);
    let err = replay(&coordinator).unwrap_err();
    assert!(matches!(
        err,
        BootstrapError::Replay(ReplayError::CorruptSegment { .. })
    ));
}

#[test]
fn test_missing_middle_segment_is_fatal() {
    let temp_dir = TempDir::new().unwrap();
    let p = paths(temp_dir.path());
    let config = BinlogConfig::for_testing()
        .with_max_segment_size(1024)
        .with_flush_threshold(256);
    write_log(&p, config.clone(), 150);

    let segments = p.list_segments().unwrap();
    assert!(segments.len() >= 3);
    std::fs::remove_file(&segments[1].path).unwrap();

    let coordinator = BootstrapCoordinator::new(p, config);
    let err = replay(&coordinator).unwrap_err();
    assert!(matches!(
        err,
        BootstrapError::Replay(ReplayError::ChainBroken { .. })
    ));
}

#[test]
fn test_index_without_binlog_is_fatal() {
    let temp_dir = TempDir::new().unwrap();
    let p = paths(temp_dir.path());
    IndexWriter::new(p.clone())
        .unwrap()
        .write(&IndexSnapshot {
            replica_id: [1; 16],
            position: LogPosition::new(500, 0, 0),
            spam_messages: 0,
            ham_messages: 0,
            black_list: Vec::new(),
            buckets: vec![Vec::new()],
        })
        .unwrap();

    let coordinator = BootstrapCoordinator::new(p, BinlogConfig::default());
    let err = replay(&coordinator).unwrap_err();
    assert!(matches!(
        err,
        BootstrapError::Replay(ReplayError::MissingSegment { offset: 500 })
    ));
}

#[test]
fn test_corrupt_index_is_fatal_before_replay() {
    let temp_dir = TempDir::new().unwrap();
    let p = paths(temp_dir.path());
    write_log(&p, BinlogConfig::default(), 2);
    std::fs::write(p.index_path(0), b"definitely not an index").unwrap();

    let coordinator = BootstrapCoordinator::new(p, BinlogConfig::default());
    let mut records = 0;
    let err = coordinator
        .bootstrap(|_| Ok(()), |_| {
            records += 1;
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, BootstrapError::Index { .. }));
    assert_eq!(records, 0);
}

#[test]
fn test_other_replica_segment_is_fatal() {
    let temp_dir = TempDir::new().unwrap();
    let p = paths(temp_dir.path());
    let end = write_log(&p, BinlogConfig::default(), 3);

    IndexWriter::new(p.clone())
        .unwrap()
        .write(&IndexSnapshot {
            replica_id: [2; 16],
            position: end,
            spam_messages: 3,
            ham_messages: 0,
            black_list: Vec::new(),
            buckets: vec![Vec::new()],
        })
        .unwrap();

    let coordinator = BootstrapCoordinator::new(p, BinlogConfig::default());
    let err = replay(&coordinator).unwrap_err();
    assert!(matches!(
        err,
        BootstrapError::Replay(ReplayError::ReplicaMismatch { .. })
    ));
}

// ============================================================================
// Index + tail
// ============================================================================

#[test]
fn test_index_then_tail_replay() {
    let temp_dir = TempDir::new().unwrap();
    let p = paths(temp_dir.path());

    let mut writer =
        BinlogWriter::create(p.clone(), [1; 16], LogPosition::ORIGIN, BinlogConfig::default())
            .unwrap();
    for i in 0..10 {
        writer.append(&teach(i)).unwrap();
    }
    writer.sync().unwrap();
    let checkpoint = writer.position();
    for i in 10..15 {
        writer.append(&teach(i)).unwrap();
    }
    writer.sync().unwrap();
    let end = writer.position();
    drop(writer);

    IndexWriter::new(p.clone())
        .unwrap()
        .write(&IndexSnapshot {
            replica_id: [1; 16],
            position: checkpoint,
            spam_messages: 10,
            ham_messages: 0,
            black_list: Vec::new(),
            buckets: vec![Vec::new(); 4],
        })
        .unwrap();

    let coordinator = BootstrapCoordinator::new(p, BinlogConfig::default());
    let mut spam_messages = 0;
    let (boot, seen) = {
        let mut seen = Vec::new();
        let boot = coordinator
            .bootstrap(
                |index| {
                    spam_messages = index.header().spam_messages;
                    Ok(())
                },
                |record| {
                    seen.push(record.word_hashes().map_err(|e| e.to_string())?[0]);
                    Ok(())
                },
            )
            .unwrap();
        (boot, seen)
    };

    assert_eq!(spam_messages, 10);
    assert_eq!(boot.start, checkpoint);
    assert_eq!(seen, (10..15).collect::<Vec<_>>());
    assert_eq!(boot.position, end);
}

#[test]
fn test_index_position_disagreeing_with_log_is_fatal() {
    let temp_dir = TempDir::new().unwrap();
    let p = paths(temp_dir.path());
    let end = write_log(&p, BinlogConfig::default(), 6);

    // claims a record boundary inside the log, but with the wrong chain CRC
    let bogus = LogPosition::new(end.offset / 2, 0, 0xdead_beef);
    IndexWriter::new(p.clone())
        .unwrap()
        .write(&IndexSnapshot {
            replica_id: [1; 16],
            position: bogus,
            spam_messages: 0,
            ham_messages: 0,
            black_list: Vec::new(),
            buckets: vec![Vec::new()],
        })
        .unwrap();

    let coordinator = BootstrapCoordinator::new(p, BinlogConfig::default());
    let err = replay(&coordinator).unwrap_err();
    assert!(matches!(
        err,
        BootstrapError::Replay(ReplayError::IndexLogMismatch { .. })
    ));
}
