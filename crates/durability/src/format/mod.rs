//! On-disk byte formats for binlog segments and index files.
//!
//! Serialization lives here; how segments and indexes are written, read
//! and recovered lives in `binlog`, `index` and `recovery`.
//!
//! # Module Structure
//!
//! - `binlog_record`: record framing and chain CRC
//! - `segment`: binlog segment header and file handle
//! - `index`: index header and bucket directory

pub mod binlog_record;
pub mod index;
pub mod segment;

pub use binlog_record::{
    check_length, BinlogRecord, RecordError, RecordKind, MIN_RECORD_BODY, RECORD_HEADER_SIZE,
    RECORD_TRAILER_SIZE,
};
pub use index::{
    DirEntry, IndexFormatError, IndexHeader, DIR_ENTRY_SIZE, INDEX_FORMAT_VERSION,
    INDEX_HEADER_SIZE, INDEX_MAGIC, MAX_BUCKETS,
};
pub use segment::{
    truncate_segment, BinlogSegment, SegmentHeader, SegmentHeaderError, SEGMENT_FORMAT_VERSION,
    SEGMENT_HEADER_SIZE, SEGMENT_MAGIC,
};
