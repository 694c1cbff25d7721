//! Binlog reader for bootstrap replay.
//!
//! Records are streamed out of a segment one frame at a time, validated
//! against the log position they sit at, and handed to a callback. Reading
//! stops at the first frame that cannot be trusted; the caller decides
//! whether that is a tail to repair or a fatal inconsistency.

use std::io::{BufReader, Read};

use bayes_core::LogPosition;

use crate::format::{check_length, BinlogRecord, BinlogSegment, RecordError};

/// Reason why record reading stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStopReason {
    /// Read every byte of the segment
    EndOfData,
    /// Torn frame at the end of the segment (expected after a crash)
    PartialRecord {
        /// Logical offset of the torn frame
        offset: u64,
    },
    /// Length prefix out of range
    InvalidLength {
        /// Logical offset of the frame
        offset: u64,
        /// Declared length
        length: usize,
    },
    /// Chain CRC mismatch
    ChecksumMismatch {
        /// Logical offset of the frame
        offset: u64,
    },
}

impl ReadStopReason {
    /// Whether reading consumed the whole segment.
    pub fn is_clean(&self) -> bool {
        matches!(self, ReadStopReason::EndOfData)
    }

    /// Logical offset of the rejected frame, if any.
    pub fn offset(&self) -> Option<u64> {
        match self {
            ReadStopReason::EndOfData => None,
            ReadStopReason::PartialRecord { offset }
            | ReadStopReason::InvalidLength { offset, .. }
            | ReadStopReason::ChecksumMismatch { offset } => Some(*offset),
        }
    }
}

/// Result of reading one segment.
#[derive(Debug, Clone)]
pub struct SegmentReadResult {
    /// Position just past the last valid record
    pub end: LogPosition,
    /// Why reading stopped
    pub stop: ReadStopReason,
    /// Records applied
    pub records_read: usize,
    /// Bytes of valid records
    pub bytes_read: u64,
}

/// Binlog reader.
#[derive(Debug, Clone)]
pub struct BinlogReader {
    verify_checksums: bool,
}

impl BinlogReader {
    /// Create a reader; `verify_checksums = false` is the `-D` mode.
    pub fn new(verify_checksums: bool) -> Self {
        BinlogReader { verify_checksums }
    }

    /// Whether chain CRCs are compared.
    pub fn verifies_checksums(&self) -> bool {
        self.verify_checksums
    }

    /// Read records from `from` to the end of `segment`.
    ///
    /// `apply` sees each record after it validated; an error from it aborts
    /// the read. `from` must lie inside the segment.
    pub fn read_segment<F>(
        &self,
        segment: &mut BinlogSegment,
        from: LogPosition,
        mut apply: F,
    ) -> Result<SegmentReadResult, BinlogReadError>
    where
        F: FnMut(&BinlogRecord, &LogPosition) -> Result<(), String>,
    {
        if !segment.covers(from.offset) {
            return Err(BinlogReadError::PositionOutsideSegment {
                offset: from.offset,
                start: segment.start().offset,
                end: segment.logical_end(),
            });
        }

        let physical = segment.physical_offset(from.offset);
        segment.seek_to(physical)?;
        let logical_end = segment.logical_end();

        let mut input = BufReader::with_capacity(64 * 1024, segment.file_mut());
        let mut position = from;
        let mut records_read = 0usize;
        let mut frame = Vec::new();

        let stop = loop {
            if position.offset == logical_end {
                break ReadStopReason::EndOfData;
            }

            let mut len_bytes = [0u8; 4];
            let got = read_up_to(&mut input, &mut len_bytes)?;
            if got < 4 {
                break ReadStopReason::PartialRecord {
                    offset: position.offset,
                };
            }

            let length = u32::from_le_bytes(len_bytes) as usize;
            if check_length(length).is_err() {
                break ReadStopReason::InvalidLength {
                    offset: position.offset,
                    length,
                };
            }

            frame.clear();
            frame.extend_from_slice(&len_bytes);
            frame.resize(4 + length, 0);
            let got = read_up_to(&mut input, &mut frame[4..])?;
            if got < length {
                break ReadStopReason::PartialRecord {
                    offset: position.offset,
                };
            }

            let record = match BinlogRecord::decode(&frame, &position, self.verify_checksums) {
                Ok(record) => record,
                Err(RecordError::ChecksumMismatch { .. }) => {
                    break ReadStopReason::ChecksumMismatch {
                        offset: position.offset,
                    };
                }
                Err(e) if e.is_corruption() => {
                    break ReadStopReason::PartialRecord {
                        offset: position.offset,
                    };
                }
                Err(e) => {
                    return Err(BinlogReadError::Parse {
                        offset: position.offset,
                        source: e,
                    });
                }
            };

            let record_start = position;
            position.advance(&frame, record.timestamp);
            apply(&record, &position).map_err(|detail| BinlogReadError::Apply {
                offset: record_start.offset,
                detail,
            })?;
            records_read += 1;
        };

        Ok(SegmentReadResult {
            bytes_read: position.bytes_since(&from),
            end: position,
            stop,
            records_read,
        })
    }
}

/// Fill as much of `buf` as the input holds.
fn read_up_to<R: Read>(input: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Binlog reader errors.
#[derive(Debug, thiserror::Error)]
pub enum BinlogReadError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Start position not inside the segment
    #[error("log position {offset} outside segment [{start}, {end}]")]
    PositionOutsideSegment {
        /// Requested offset
        offset: u64,
        /// Segment start
        start: u64,
        /// Segment end
        end: u64,
    },

    /// Well-formed frame this build cannot interpret
    #[error("unreadable record at offset {offset}: {source}")]
    Parse {
        /// Logical offset of the record
        offset: u64,
        /// Decoder error
        source: RecordError,
    },

    /// The replay callback rejected a record
    #[error("failed to apply record at offset {offset}: {detail}")]
    Apply {
        /// Logical offset of the record
        offset: u64,
        /// Callback error
        detail: String,
    },
}
