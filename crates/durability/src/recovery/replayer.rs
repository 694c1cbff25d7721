//! Binlog replayer
//!
//! Replays every record after a starting log position, across segments,
//! and classifies how the log ended. It never modifies files; truncation is
//! the coordinator's job.

use std::path::PathBuf;

use bayes_core::LogPosition;
use tracing::{debug, warn};

use crate::binlog::{BinlogReadError, BinlogReader, ReadStopReason};
use crate::format::{BinlogRecord, BinlogSegment, SEGMENT_HEADER_SIZE};
use crate::replica::{ReplicaFile, ReplicaPaths};

/// Statistics from a replay.
#[derive(Debug, Clone, Default)]
pub struct ReplayStats {
    /// Records applied
    pub records_applied: usize,
    /// Bytes of valid records replayed
    pub bytes_replayed: u64,
    /// Segments opened
    pub segments_read: usize,
}

/// Where a torn or damaged tail starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairPoint {
    /// Segment holding the tail
    pub segment: PathBuf,
    /// Last good logical offset
    pub logical_offset: u64,
    /// Last good physical offset inside the segment
    pub physical_offset: u64,
    /// Segment size before repair
    pub file_size: u64,
    /// What was found there
    pub reason: ReadStopReason,
}

impl RepairPoint {
    /// Bytes the repair discards.
    pub fn discarded_bytes(&self) -> u64 {
        self.file_size.saturating_sub(self.physical_offset)
    }
}

/// How the log ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Every byte of the last segment was a valid record
    Clean,
    /// The last segment ends in a tail that must be truncated
    Repair(RepairPoint),
    /// The last segment was cut off while its header was being written;
    /// it holds no records and must be removed
    TornRotation(PathBuf),
}

/// Replay result.
#[derive(Debug, Clone)]
pub struct ReplayReport {
    /// Position after the last valid record
    pub end: LogPosition,
    /// How the log ended
    pub outcome: ReplayOutcome,
    /// Statistics
    pub stats: ReplayStats,
    /// The last segment, where appends resume
    pub last_segment: Option<ReplicaFile>,
    /// Replica UUID found in the segments
    pub replica_id: Option<[u8; 16]>,
}

/// Binlog replayer.
pub struct BinlogReplayer {
    paths: ReplicaPaths,
    reader: BinlogReader,
}

impl BinlogReplayer {
    /// Create a replayer for a replica.
    pub fn new(paths: ReplicaPaths, verify_checksums: bool) -> Self {
        BinlogReplayer {
            paths,
            reader: BinlogReader::new(verify_checksums),
        }
    }

    /// Replay every record after `start`.
    ///
    /// `replica_id` is the identity the caller already knows (from the
    /// index); every segment must carry it.
    pub fn replay<F>(
        &self,
        start: LogPosition,
        replica_id: Option<[u8; 16]>,
        mut apply: F,
    ) -> Result<ReplayReport, ReplayError>
    where
        F: FnMut(&BinlogRecord) -> Result<(), String>,
    {
        let segments = self.paths.list_segments()?;
        let mut report = ReplayReport {
            end: start,
            outcome: ReplayOutcome::Clean,
            stats: ReplayStats::default(),
            last_segment: segments.last().cloned(),
            replica_id,
        };

        if segments.is_empty() {
            if start.is_origin() {
                return Ok(report);
            }
            return Err(ReplayError::MissingSegment {
                offset: start.offset,
            });
        }

        let first = segments
            .iter()
            .rposition(|s| s.offset <= start.offset)
            .ok_or(ReplayError::MissingSegment {
                offset: start.offset,
            })?;

        let mut position = start;
        let last = segments.len() - 1;

        for (i, file) in segments.iter().enumerate().skip(first) {
            let mut segment = match BinlogSegment::open_read(&file.path) {
                Ok(segment) => segment,
                Err(source)
                    if i == last
                        && file.offset == position.offset
                        && file.size <= SEGMENT_HEADER_SIZE as u64
                        && is_torn_header(&source) =>
                {
                    warn!(
                        target: "bayes::recovery",
                        segment = %file.path.display(),
                        size = file.size,
                        "Binlog ends in a segment without a complete header"
                    );
                    report.outcome = ReplayOutcome::TornRotation(file.path.clone());
                    report.last_segment = i.checked_sub(1).map(|prev| segments[prev].clone());
                    break;
                }
                Err(source) => {
                    return Err(ReplayError::UnreadableSegment {
                        path: file.path.clone(),
                        source,
                    })
                }
            };

            if segment.start().offset != file.offset {
                return Err(ReplayError::ChainBroken {
                    path: file.path.clone(),
                    detail: format!(
                        "header starts at {} but file name says {}",
                        segment.start().offset,
                        file.offset
                    ),
                });
            }

            match report.replica_id {
                Some(id) if id != segment.replica_id() => {
                    return Err(ReplayError::ReplicaMismatch {
                        path: file.path.clone(),
                    });
                }
                _ => report.replica_id = Some(segment.replica_id()),
            }

            if i == first {
                if !segment.covers(position.offset) {
                    return Err(ReplayError::MissingSegment {
                        offset: position.offset,
                    });
                }
                if position.offset == segment.start().offset
                    && self.reader.verifies_checksums()
                    && position.crc32 != segment.start().crc32
                {
                    return Err(ReplayError::ChainBroken {
                        path: file.path.clone(),
                        detail: format!(
                            "index position {} disagrees with segment start {}",
                            position,
                            segment.start()
                        ),
                    });
                }
            } else if segment.start().offset != position.offset
                || (self.reader.verifies_checksums() && segment.start().crc32 != position.crc32)
            {
                return Err(ReplayError::ChainBroken {
                    path: file.path.clone(),
                    detail: format!(
                        "segment starts at {}, previous segment ended at {}",
                        segment.start(),
                        position
                    ),
                });
            }

            let from = position;
            let mid_segment = from.offset > segment.start().offset;
            let result = self
                .reader
                .read_segment(&mut segment, from, |record, _| apply(record))?;

            report.stats.segments_read += 1;
            report.stats.records_applied += result.records_read;
            report.stats.bytes_replayed += result.bytes_read;
            position = result.end;

            debug!(
                target: "bayes::recovery",
                segment = %file.path.display(),
                records = result.records_read,
                end = %position,
                "Replayed segment"
            );

            if result.stop.is_clean() {
                continue;
            }

            if i != last {
                return Err(ReplayError::CorruptSegment {
                    path: file.path.clone(),
                    reason: result.stop,
                });
            }

            // a torn first record is an ordinary crash; anything else means
            // the index and the log describe different histories
            if mid_segment
                && result.records_read == 0
                && !matches!(result.stop, ReadStopReason::PartialRecord { .. })
            {
                return Err(ReplayError::IndexLogMismatch {
                    path: file.path.clone(),
                    position: from,
                });
            }

            let repair = RepairPoint {
                segment: file.path.clone(),
                logical_offset: position.offset,
                physical_offset: segment.physical_offset(position.offset),
                file_size: segment.size(),
                reason: result.stop,
            };
            warn!(
                target: "bayes::recovery",
                segment = %repair.segment.display(),
                offset = repair.logical_offset,
                discarded = repair.discarded_bytes(),
                reason = ?repair.reason,
                "Binlog ends in a damaged tail"
            );
            report.outcome = ReplayOutcome::Repair(repair);
        }

        report.end = position;
        Ok(report)
    }
}

// A header cut short, or one whose bytes never reached the disk.
fn is_torn_header(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::InvalidData
    )
}

/// Binlog replay errors.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// I/O error listing segments
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No segment covers a position the index or chain requires
    #[error("no binlog segment covers log position {offset}")]
    MissingSegment {
        /// Required offset
        offset: u64,
    },

    /// Segment header unreadable
    #[error("cannot open binlog segment {path}: {source}")]
    UnreadableSegment {
        /// Segment path
        path: PathBuf,
        /// Cause
        source: std::io::Error,
    },

    /// Segment belongs to another replica
    #[error("binlog segment {path} belongs to another replica")]
    ReplicaMismatch {
        /// Segment path
        path: PathBuf,
    },

    /// Segment does not continue the previous one
    #[error("binlog chain broken at {path}: {detail}")]
    ChainBroken {
        /// Segment path
        path: PathBuf,
        /// Description
        detail: String,
    },

    /// Damage in a segment that is not the last one
    #[error("corrupt binlog segment {path}: {reason:?}")]
    CorruptSegment {
        /// Segment path
        path: PathBuf,
        /// What was found
        reason: ReadStopReason,
    },

    /// First record after the index position fails its chain CRC
    #[error("index position {position} does not match binlog {path}")]
    IndexLogMismatch {
        /// Segment path
        path: PathBuf,
        /// Index position
        position: LogPosition,
    },

    /// Reader error
    #[error(transparent)]
    Read(#[from] BinlogReadError),
}
