//! Bootstrap coordinator
//!
//! Bootstrap algorithm:
//! 1. Open the index (explicit, else most recent) and hand it to the caller
//! 2. Replay the binlog from the index position (origin if there is none)
//! 3. Truncate a damaged tail of the last segment, once, durably, or remove
//!    a last segment whose header was cut off during rotation
//! 4. Report where appends resume
//!
//! # Properties
//!
//! - **Deterministic**: the resulting log position depends only on file contents
//! - **Idempotent**: a second bootstrap over the repaired files replays the
//!   same records and repairs nothing
//! - **Fail-stop**: anything other than a damaged tail aborts before the
//!   binlog is opened for writing

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bayes_core::LogPosition;
use tracing::{info, warn};

use crate::binlog::{BinlogConfig, BinlogError, BinlogWriter};
use crate::format::{truncate_segment, BinlogRecord};
use crate::index::{IndexError, IndexFile};
use crate::replica::{ReplicaFile, ReplicaPaths};

use super::replayer::{BinlogReplayer, RepairPoint, ReplayError, ReplayOutcome, ReplayStats};

/// Result of a successful bootstrap.
#[derive(Debug)]
pub struct Bootstrap {
    /// The index that was loaded, kept open for lazy bucket reads
    pub index: Option<IndexFile>,
    /// Time spent opening the index
    pub index_load_time: Duration,
    /// Position replay started from
    pub start: LogPosition,
    /// Position after the last valid record
    pub position: LogPosition,
    /// Replica UUID (generated for a brand-new replica)
    pub replica_id: [u8; 16],
    /// Replay statistics
    pub stats: ReplayStats,
    /// Time spent replaying
    pub binlog_load_time: Duration,
    /// The tail that was truncated, if any
    pub repaired: Option<RepairPoint>,
    /// Header-less segment removed after a torn rotation, if any
    pub discarded_segment: Option<PathBuf>,
    /// Segment where appends resume
    pub last_segment: Option<ReplicaFile>,
}

/// Bootstrap coordinator.
pub struct BootstrapCoordinator {
    paths: ReplicaPaths,
    config: BinlogConfig,
    repair: bool,
}

impl BootstrapCoordinator {
    /// Create a coordinator for a replica.
    pub fn new(paths: ReplicaPaths, config: BinlogConfig) -> Self {
        BootstrapCoordinator {
            paths,
            config,
            repair: true,
        }
    }

    /// Whether a damaged tail is truncated (builder pattern).
    ///
    /// Read-only users such as index building leave the binlog untouched and
    /// simply stop at the damage.
    pub fn with_repair(mut self, repair: bool) -> Self {
        self.repair = repair;
        self
    }

    /// Replica layout.
    pub fn paths(&self) -> &ReplicaPaths {
        &self.paths
    }

    /// Run the bootstrap.
    ///
    /// `on_index` sees the index before any binlog I/O; `on_record` sees
    /// every replayed record in log order.
    pub fn bootstrap<S, R>(&self, mut on_index: S, on_record: R) -> Result<Bootstrap, BootstrapError>
    where
        S: FnMut(&IndexFile) -> Result<(), String>,
        R: FnMut(&BinlogRecord) -> Result<(), String>,
    {
        let started = Instant::now();
        let index = match self.paths.bootstrap_index()? {
            Some(path) => {
                let index = IndexFile::open(&path).map_err(|source| BootstrapError::Index {
                    path: path.clone(),
                    source,
                })?;
                on_index(&index).map_err(|detail| BootstrapError::Load { path, detail })?;
                Some(index)
            }
            None => None,
        };
        let index_load_time = started.elapsed();

        let (start, known_id) = match &index {
            Some(index) => {
                info!(
                    target: "bayes::recovery",
                    path = %index.path().display(),
                    position = %index.header().position,
                    buckets = index.header().bucket_count,
                    "Loaded index"
                );
                (index.header().position, Some(index.header().replica_id))
            }
            None => {
                info!(target: "bayes::recovery", "No index found, replaying binlog from the start");
                (LogPosition::ORIGIN, None)
            }
        };

        let started = Instant::now();
        let replayer = BinlogReplayer::new(self.paths.clone(), self.config.verify_checksums);
        let report = replayer.replay(start, known_id, on_record)?;
        let binlog_load_time = started.elapsed();

        let (repaired, discarded_segment) = match report.outcome {
            ReplayOutcome::Clean => (None, None),
            ReplayOutcome::Repair(point) if self.repair => {
                self.truncate(&point)?;
                (Some(point), None)
            }
            ReplayOutcome::Repair(point) => {
                warn!(
                    target: "bayes::recovery",
                    segment = %point.segment.display(),
                    offset = point.logical_offset,
                    "Leaving damaged binlog tail in place"
                );
                (None, None)
            }
            ReplayOutcome::TornRotation(path) if self.repair => {
                self.discard(&path)?;
                (None, Some(path))
            }
            ReplayOutcome::TornRotation(path) => {
                warn!(
                    target: "bayes::recovery",
                    segment = %path.display(),
                    "Leaving header-less binlog segment in place"
                );
                (None, None)
            }
        };

        let replica_id = report
            .replica_id
            .unwrap_or_else(|| *uuid::Uuid::new_v4().as_bytes());

        info!(
            target: "bayes::recovery",
            records = report.stats.records_applied,
            bytes = report.stats.bytes_replayed,
            position = %report.end,
            ms = binlog_load_time.as_millis() as u64,
            "Binlog replay complete"
        );

        Ok(Bootstrap {
            index,
            index_load_time,
            start,
            position: report.end,
            replica_id,
            stats: report.stats,
            binlog_load_time,
            repaired,
            discarded_segment,
            last_segment: report.last_segment,
        })
    }

    fn truncate(&self, point: &RepairPoint) -> Result<(), BootstrapError> {
        truncate_segment(&point.segment, point.physical_offset).map_err(|source| {
            BootstrapError::Truncate {
                path: point.segment.clone(),
                offset: point.physical_offset,
                source,
            }
        })?;
        warn!(
            target: "bayes::recovery",
            segment = %point.segment.display(),
            offset = point.logical_offset,
            discarded = point.discarded_bytes(),
            "Truncated binlog tail"
        );
        Ok(())
    }

    fn discard(&self, path: &Path) -> Result<(), BootstrapError> {
        let removed = std::fs::remove_file(path)
            .and_then(|()| std::fs::File::open(self.paths.dir())?.sync_all());
        removed.map_err(|source| BootstrapError::Discard {
            path: path.to_path_buf(),
            source,
        })?;
        warn!(
            target: "bayes::recovery",
            segment = %path.display(),
            "Removed binlog segment left by an interrupted rotation"
        );
        Ok(())
    }

    /// Open the binlog for appending after a bootstrap.
    pub fn open_writer(&self, boot: &Bootstrap) -> Result<BinlogWriter, BootstrapError> {
        let writer = match &boot.last_segment {
            Some(segment) => BinlogWriter::open(
                self.paths.clone(),
                &segment.path,
                boot.position,
                self.config.clone(),
            )?,
            None => BinlogWriter::create(
                self.paths.clone(),
                boot.replica_id,
                boot.position,
                self.config.clone(),
            )?,
        };
        Ok(writer)
    }
}

/// Bootstrap errors
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// I/O error listing replica files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Index unreadable or invalid
    #[error("cannot load index {path}: {source}")]
    Index {
        /// Index path
        path: PathBuf,
        /// Cause
        source: IndexError,
    },

    /// Caller rejected the index contents
    #[error("cannot load index {path}: {detail}")]
    Load {
        /// Index path
        path: PathBuf,
        /// Cause
        detail: String,
    },

    /// Replay failed
    #[error("binlog replay failed: {0}")]
    Replay(#[from] ReplayError),

    /// Repair truncation failed
    #[error("cannot truncate {path} at {offset}: {source}")]
    Truncate {
        /// Segment path
        path: PathBuf,
        /// Physical offset
        offset: u64,
        /// Cause
        source: std::io::Error,
    },

    /// Removing a header-less last segment failed
    #[error("cannot remove torn segment {path}: {source}")]
    Discard {
        /// Segment path
        path: PathBuf,
        /// Cause
        source: std::io::Error,
    },

    /// Opening the binlog for append failed
    #[error(transparent)]
    Binlog(#[from] BinlogError),
}

impl BootstrapError {
    /// Whether repairing the end of the binlog failed.
    pub fn is_truncate_failure(&self) -> bool {
        matches!(
            self,
            BootstrapError::Truncate { .. } | BootstrapError::Discard { .. }
        )
    }

    /// File the error concerns, when there is one.
    pub fn path(&self) -> Option<&Path> {
        match self {
            BootstrapError::Index { path, .. }
            | BootstrapError::Load { path, .. }
            | BootstrapError::Truncate { path, .. }
            | BootstrapError::Discard { path, .. } => Some(path),
            _ => None,
        }
    }
}
