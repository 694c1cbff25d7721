//! Binlog writer.
//!
//! Records are encoded against the current log position and appended to an
//! in-memory buffer. The buffer is written to the active segment by the
//! once-per-second cron flush (or earlier once it passes the flush
//! threshold), and `sync` makes everything written so far durable. A record
//! still in the buffer when the process dies is lost, which replay tolerates:
//! the log simply ends earlier.

use std::time::Instant;

use bayes_core::LogPosition;
use tracing::{debug, info};

use super::config::BinlogConfig;
use crate::format::{BinlogRecord, BinlogSegment};
use crate::replica::ReplicaPaths;

/// Cumulative binlog writer counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinlogCounters {
    /// Records appended
    pub records_appended: u64,
    /// Bytes written to segment files
    pub bytes_written: u64,
    /// Buffer flushes that wrote data
    pub flushes: u64,
    /// Durable syncs
    pub sync_calls: u64,
    /// Nanoseconds spent in fsync
    pub sync_nanos: u64,
    /// Segment rotations
    pub rotations: u64,
}

/// Append-only binlog writer.
pub struct BinlogWriter {
    /// Active segment
    segment: BinlogSegment,

    /// Replica layout
    paths: ReplicaPaths,

    /// Replica UUID stamped into new segments
    replica_id: [u8; 16],

    /// Configuration
    config: BinlogConfig,

    /// Encoded records not yet written to the segment
    buffer: Vec<u8>,

    /// Position after the last appended record (buffered included)
    position: LogPosition,

    /// Position after the last byte written to the segment
    written: LogPosition,

    /// Logical offset covered by the last fsync
    synced_offset: u64,

    counters: BinlogCounters,
}

impl BinlogWriter {
    /// Start a replica: create its first segment at `start`.
    pub fn create(
        paths: ReplicaPaths,
        replica_id: [u8; 16],
        start: LogPosition,
        config: BinlogConfig,
    ) -> Result<Self, BinlogError> {
        config.validate()?;
        let path = paths.segment_path(start.offset);
        let segment = BinlogSegment::create(&path, replica_id, start)?;
        info!(target: "bayes::binlog", path = %path.display(), position = %start, "Created binlog segment");

        Ok(Self::with_segment(segment, paths, replica_id, start, config))
    }

    /// Resume appending to an existing segment whose last valid byte is `position`.
    ///
    /// The segment must end exactly at `position`; bootstrap truncates any
    /// torn tail before calling this.
    pub fn open(
        paths: ReplicaPaths,
        segment_path: &std::path::Path,
        position: LogPosition,
        config: BinlogConfig,
    ) -> Result<Self, BinlogError> {
        config.validate()?;
        let segment = BinlogSegment::open_append(segment_path)?;

        if segment.logical_end() != position.offset {
            return Err(BinlogError::PositionMismatch {
                expected: position.offset,
                actual: segment.logical_end(),
            });
        }

        let replica_id = segment.replica_id();
        debug!(target: "bayes::binlog", path = %segment_path.display(), position = %position, "Opened binlog segment for append");

        let mut writer = Self::with_segment(segment, paths, replica_id, position, config);
        // the segment may already be full from the previous run
        writer.maybe_rotate()?;
        Ok(writer)
    }

    fn with_segment(
        segment: BinlogSegment,
        paths: ReplicaPaths,
        replica_id: [u8; 16],
        position: LogPosition,
        config: BinlogConfig,
    ) -> Self {
        BinlogWriter {
            segment,
            paths,
            replica_id,
            config,
            buffer: Vec::new(),
            position,
            written: position,
            synced_offset: position.offset,
            counters: BinlogCounters::default(),
        }
    }

    /// Append a record, returning the position after it.
    pub fn append(&mut self, record: &BinlogRecord) -> Result<LogPosition, BinlogError> {
        let frame = record.encode(&self.position);
        self.buffer.extend_from_slice(&frame);
        self.position.advance(&frame, record.timestamp);
        self.counters.records_appended += 1;

        if self.buffer.len() >= self.config.flush_threshold {
            self.flush()?;
        }
        Ok(self.position)
    }

    /// Write buffered records to the segment, rotating if it is full.
    pub fn flush(&mut self) -> Result<(), BinlogError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        self.segment.write(&self.buffer)?;
        self.counters.bytes_written += self.buffer.len() as u64;
        self.counters.flushes += 1;
        self.buffer.clear();
        self.written = self.position;

        self.maybe_rotate()
    }

    /// Flush and fsync.
    pub fn sync(&mut self) -> Result<(), BinlogError> {
        self.flush()?;
        if self.synced_offset == self.written.offset {
            return Ok(());
        }

        let start = Instant::now();
        self.segment.sync()?;
        self.counters.sync_calls += 1;
        self.counters.sync_nanos += start.elapsed().as_nanos() as u64;
        self.synced_offset = self.written.offset;
        Ok(())
    }

    fn maybe_rotate(&mut self) -> Result<(), BinlogError> {
        if self.segment.size() < self.config.max_segment_size {
            return Ok(());
        }

        self.segment.close()?;
        self.synced_offset = self.written.offset;

        let path = self.paths.segment_path(self.written.offset);
        let next = BinlogSegment::create(&path, self.replica_id, self.written)?;
        info!(
            target: "bayes::binlog",
            closed = %self.segment.path().display(),
            opened = %path.display(),
            position = %self.written,
            "Rotated binlog segment"
        );
        self.segment = next;
        self.counters.rotations += 1;
        Ok(())
    }

    /// Position after the last appended record.
    pub fn position(&self) -> LogPosition {
        self.position
    }

    /// Position after the last byte written to the segment.
    pub fn written_position(&self) -> LogPosition {
        self.written
    }

    /// Bytes appended but not yet fsynced.
    pub fn uncommitted_bytes(&self) -> u64 {
        self.position.offset - self.synced_offset
    }

    /// Bytes still in the in-memory buffer.
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Active segment path.
    pub fn segment_path(&self) -> &std::path::Path {
        self.segment.path()
    }

    /// Active segment size in bytes.
    pub fn current_segment_size(&self) -> u64 {
        self.segment.size()
    }

    /// Replica UUID.
    pub fn replica_id(&self) -> [u8; 16] {
        self.replica_id
    }

    /// Cumulative counters.
    pub fn counters(&self) -> BinlogCounters {
        self.counters
    }
}

/// Binlog writer errors.
#[derive(Debug, thiserror::Error)]
pub enum BinlogError {
    /// I/O error
    #[error("binlog I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("invalid binlog configuration: {0}")]
    Config(#[from] super::config::BinlogConfigError),

    /// Segment on disk does not end where bootstrap says the log ends
    #[error("binlog segment ends at {actual}, expected {expected}")]
    PositionMismatch {
        /// Position bootstrap computed
        expected: u64,
        /// End of the segment on disk
        actual: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::RecordKind;
    use tempfile::tempdir;

    fn paths(dir: &std::path::Path) -> ReplicaPaths {
        ReplicaPaths::from_prefix(dir.join("bayes")).unwrap()
    }

    fn record(i: u64) -> BinlogRecord {
        BinlogRecord::teach(RecordKind::SetSpam, 1_700_000_000, &[i, i + 1])
    }

    #[test]
    fn test_buffered_until_flush() {
        let dir = tempdir().unwrap();
        let mut writer = BinlogWriter::create(
            paths(dir.path()),
            [3; 16],
            LogPosition::ORIGIN,
            BinlogConfig::default(),
        )
        .unwrap();

        let after = writer.append(&record(1)).unwrap();
        assert!(after.offset > 0);
        assert_eq!(writer.written_position(), LogPosition::ORIGIN);
        assert_eq!(writer.uncommitted_bytes(), after.offset);

        writer.sync().unwrap();
        assert_eq!(writer.written_position(), after);
        assert_eq!(writer.uncommitted_bytes(), 0);
        assert_eq!(writer.buffered_bytes(), 0);
        assert_eq!(writer.counters().sync_calls, 1);

        // nothing new: no second fsync
        writer.sync().unwrap();
        assert_eq!(writer.counters().sync_calls, 1);
    }

    #[test]
    fn test_flush_threshold() {
        let dir = tempdir().unwrap();
        let config = BinlogConfig::for_testing().with_flush_threshold(64);
        let mut writer =
            BinlogWriter::create(paths(dir.path()), [3; 16], LogPosition::ORIGIN, config).unwrap();

        while writer.counters().flushes == 0 {
            writer.append(&record(7)).unwrap();
        }
        assert_eq!(writer.buffered_bytes(), 0);
    }

    #[test]
    fn test_rotation_chains_segments() {
        let dir = tempdir().unwrap();
        let p = paths(dir.path());
        let config = BinlogConfig::for_testing()
            .with_max_segment_size(1024)
            .with_flush_threshold(128);
        let mut writer =
            BinlogWriter::create(p.clone(), [3; 16], LogPosition::ORIGIN, config).unwrap();

        for i in 0..100 {
            writer.append(&record(i)).unwrap();
        }
        writer.sync().unwrap();

        let segments = p.list_segments().unwrap();
        assert!(segments.len() > 1);
        assert_eq!(writer.counters().rotations as usize, segments.len() - 1);

        // every segment starts where the previous one ended
        for pair in segments.windows(2) {
            let prev = BinlogSegment::open_read(&pair[0].path).unwrap();
            let next = BinlogSegment::open_read(&pair[1].path).unwrap();
            assert_eq!(next.start().offset, prev.logical_end());
            assert_eq!(next.start().offset, pair[1].offset);
        }
    }

    #[test]
    fn test_reopen_requires_matching_position() {
        let dir = tempdir().unwrap();
        let p = paths(dir.path());
        let mut writer =
            BinlogWriter::create(p.clone(), [3; 16], LogPosition::ORIGIN, BinlogConfig::default())
                .unwrap();
        let end = writer.append(&record(1)).unwrap();
        writer.sync().unwrap();
        let seg_path = writer.segment_path().to_path_buf();
        drop(writer);

        let writer =
            BinlogWriter::open(p.clone(), &seg_path, end, BinlogConfig::default()).unwrap();
        assert_eq!(writer.position(), end);
        assert_eq!(writer.replica_id(), [3; 16]);

        let err = BinlogWriter::open(p, &seg_path, LogPosition::ORIGIN, BinlogConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, BinlogError::PositionMismatch { .. }));
    }
}
