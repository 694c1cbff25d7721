//! Durability layer for the Bayes engine
//!
//! This crate handles everything that touches disk:
//!
//! - Binlog: segmented append-only log, one record per committed mutation
//! - Index: checkpointed state with lazily loaded buckets
//! - Bootstrap: index load + binlog replay + crash-truncation repair
//! - Binary on-disk formats (segments, records, index)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod binlog;
pub mod format;
pub mod index;
pub mod recovery;
pub mod replica;

pub use binlog::{
    BinlogConfig, BinlogConfigError, BinlogCounters, BinlogError, BinlogReadError, BinlogReader,
    BinlogWriter, ReadStopReason,
};
pub use format::{BinlogRecord, BinlogSegment, RecordError, RecordKind};
pub use index::{IndexError, IndexFile, IndexInfo, IndexSnapshot, IndexWriter};
pub use recovery::{
    Bootstrap, BootstrapCoordinator, BootstrapError, RepairPoint, ReplayError, ReplayOutcome,
    ReplayStats,
};
pub use replica::{ReplicaFile, ReplicaPathError, ReplicaPaths};
