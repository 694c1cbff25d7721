//! Committed log frontier
//!
//! A [`LogPosition`] names "how much committed history exists": the logical
//! byte offset into the binlog stream, the timestamp of the last record, and
//! the CRC32 of every log byte before `offset`.
//!
//! The CRC is a running chain. Extending a position by a frame of bytes is
//! the same as computing the CRC of the whole stream up to the new offset,
//! which is what lets replay check every record boundary against the
//! checksum embedded in the log itself.

use std::fmt;

use crc32fast::Hasher;

/// Monotonic marker of committed binlog history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LogPosition {
    /// Logical byte offset (segment headers are not counted)
    pub offset: u64,
    /// Unix timestamp (seconds) of the last record at or before `offset`
    pub timestamp: i64,
    /// CRC32 of all log bytes in `[0, offset)`
    pub crc32: u32,
}

impl LogPosition {
    /// The empty log.
    pub const ORIGIN: LogPosition = LogPosition {
        offset: 0,
        timestamp: 0,
        crc32: 0,
    };

    /// Create a position from its parts.
    pub fn new(offset: u64, timestamp: i64, crc32: u32) -> Self {
        LogPosition {
            offset,
            timestamp,
            crc32,
        }
    }

    /// Whether this is the start of the log.
    pub fn is_origin(&self) -> bool {
        self.offset == 0
    }

    /// A hasher primed with this position's chain state.
    ///
    /// Feeding it the bytes that follow `offset` yields the chain CRC at the
    /// end of those bytes.
    pub fn chain(&self) -> Hasher {
        Hasher::new_with_initial_len(self.crc32, self.offset)
    }

    /// Chain CRC of the log extended by `bytes`, without moving.
    pub fn checksum_through(&self, bytes: &[u8]) -> u32 {
        let mut hasher = self.chain();
        hasher.update(bytes);
        hasher.finalize()
    }

    /// Advance past a complete record frame.
    ///
    /// The timestamp never moves backwards, even if the wall clock did.
    pub fn advance(&mut self, frame: &[u8], timestamp: i64) {
        self.crc32 = self.checksum_through(frame);
        self.offset += frame.len() as u64;
        self.timestamp = self.timestamp.max(timestamp);
    }

    /// The position after `frame`, leaving `self` untouched.
    pub fn advanced(mut self, frame: &[u8], timestamp: i64) -> Self {
        self.advance(frame, timestamp);
        self
    }

    /// Bytes of history between `earlier` and `self`.
    pub fn bytes_since(&self, earlier: &LogPosition) -> u64 {
        self.offset.saturating_sub(earlier.offset)
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (ts={}, crc32={:08x})",
            self.offset, self.timestamp, self.crc32
        )
    }
}

/// Current Unix time in seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_origin() {
        assert!(LogPosition::ORIGIN.is_origin());
        assert_eq!(LogPosition::default(), LogPosition::ORIGIN);
    }

    #[test]
    fn test_advance_matches_whole_stream_crc() {
        let mut pos = LogPosition::ORIGIN;
        pos.advance(b"hello ", 10);
        pos.advance(b"world", 11);

        assert_eq!(pos.offset, 11);
        assert_eq!(pos.timestamp, 11);
        assert_eq!(pos.crc32, crc32fast::hash(b"hello world"));
    }

    #[test]
    fn test_timestamp_never_decreases() {
        let mut pos = LogPosition::new(0, 100, 0);
        pos.advance(b"x", 50);
        assert_eq!(pos.timestamp, 100);
    }

    #[test]
    fn test_checksum_through_does_not_move() {
        let pos = LogPosition::ORIGIN.advanced(b"abc", 1);
        let peek = pos.checksum_through(b"def");
        assert_eq!(pos.offset, 3);
        assert_eq!(peek, crc32fast::hash(b"abcdef"));
    }

    #[test]
    fn test_bytes_since() {
        let a = LogPosition::new(10, 0, 0);
        let b = LogPosition::new(25, 0, 0);
        assert_eq!(b.bytes_since(&a), 15);
        assert_eq!(a.bytes_since(&b), 0);
    }

    proptest! {
        #[test]
        fn prop_chain_is_split_independent(
            data in proptest::collection::vec(any::<u8>(), 0..512),
            split in 0usize..512,
        ) {
            let split = split.min(data.len());
            let mut pos = LogPosition::ORIGIN;
            pos.advance(&data[..split], 1);
            pos.advance(&data[split..], 2);
            prop_assert_eq!(pos.crc32, crc32fast::hash(&data));
            prop_assert_eq!(pos.offset, data.len() as u64);
        }
    }
}
