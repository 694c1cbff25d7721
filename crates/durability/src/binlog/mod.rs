//! Append-only binlog.
//!
//! - `config`: segment size, flush threshold, checksum verification
//! - `reader`: streaming replay of one segment
//! - `writer`: buffered append, flush, sync, rotation

pub mod config;
pub mod reader;
pub mod writer;

pub use config::{BinlogConfig, BinlogConfigError};
pub use reader::{BinlogReadError, BinlogReader, ReadStopReason, SegmentReadResult};
pub use writer::{BinlogCounters, BinlogError, BinlogWriter};
