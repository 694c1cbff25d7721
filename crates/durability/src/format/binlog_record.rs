//! Binlog record format.
//!
//! # Record Layout
//!
//! ```text
//! ┌─────────────────┬──────────┬────────────────┬─────────────────────┬───────────────┐
//! │ Length (4 bytes)│ Kind (1) │ Timestamp (8)  │ Payload (variable)  │ Chain CRC (4) │
//! └─────────────────┴──────────┴────────────────┴─────────────────────┴───────────────┘
//! ```
//!
//! `Length` counts every byte after itself. `Chain CRC` is the CRC32 of the
//! whole log stream from offset 0 through the end of the payload, so a record
//! only validates at the exact log position it was written at.
//!
//! Payloads:
//! - teach kinds: word count (4) followed by that many sorted, unique word hashes (8 each)
//! - black list kinds: UTF-8 phrase

use bayes_core::{LogPosition, MAX_RECORD_LEN};
use byteorder::{ByteOrder, LittleEndian};

/// Bytes before the payload: length + kind + timestamp
pub const RECORD_HEADER_SIZE: usize = 4 + 1 + 8;

/// Bytes after the payload: chain CRC
pub const RECORD_TRAILER_SIZE: usize = 4;

/// Smallest legal value of the length field (empty payload)
pub const MIN_RECORD_BODY: usize = 1 + 8 + RECORD_TRAILER_SIZE;

/// Kinds of mutation recorded in the binlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    /// Learn a message as spam
    SetSpam = 1,
    /// Learn a message as ham
    SetHam = 2,
    /// Undo a previous spam learning
    UnsetSpam = 3,
    /// Undo a previous ham learning
    UnsetHam = 4,
    /// Relabel a message learned as spam to ham
    ResetSpam = 5,
    /// Relabel a message learned as ham to spam
    ResetHam = 6,
    /// Add a black list phrase
    BlackListAdd = 7,
    /// Remove a black list phrase
    BlackListDelete = 8,
}

impl RecordKind {
    /// Decode a kind tag.
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => RecordKind::SetSpam,
            2 => RecordKind::SetHam,
            3 => RecordKind::UnsetSpam,
            4 => RecordKind::UnsetHam,
            5 => RecordKind::ResetSpam,
            6 => RecordKind::ResetHam,
            7 => RecordKind::BlackListAdd,
            8 => RecordKind::BlackListDelete,
            _ => return None,
        })
    }

    /// Whether the payload is a word hash list.
    pub fn is_teach(&self) -> bool {
        !matches!(self, RecordKind::BlackListAdd | RecordKind::BlackListDelete)
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            RecordKind::SetSpam => "set_spam",
            RecordKind::SetHam => "set_ham",
            RecordKind::UnsetSpam => "unset_spam",
            RecordKind::UnsetHam => "unset_ham",
            RecordKind::ResetSpam => "reset_spam",
            RecordKind::ResetHam => "reset_ham",
            RecordKind::BlackListAdd => "black_list_add",
            RecordKind::BlackListDelete => "black_list_delete",
        }
    }
}

/// One committed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogRecord {
    /// What the record does
    pub kind: RecordKind,
    /// Unix timestamp (seconds) at append time
    pub timestamp: i64,
    /// Kind-specific payload
    pub payload: Vec<u8>,
}

impl BinlogRecord {
    /// Create a teach record from a word hash list.
    ///
    /// Hashes are sorted and deduplicated so that equal messages produce
    /// byte-identical records.
    pub fn teach(kind: RecordKind, timestamp: i64, words: &[u64]) -> Self {
        debug_assert!(kind.is_teach());
        let mut words = words.to_vec();
        words.sort_unstable();
        words.dedup();

        let mut payload = Vec::with_capacity(4 + words.len() * 8);
        payload.extend_from_slice(&(words.len() as u32).to_le_bytes());
        for word in &words {
            payload.extend_from_slice(&word.to_le_bytes());
        }

        BinlogRecord {
            kind,
            timestamp,
            payload,
        }
    }

    /// Create a black list record.
    pub fn phrase(kind: RecordKind, timestamp: i64, phrase: &str) -> Self {
        debug_assert!(!kind.is_teach());
        BinlogRecord {
            kind,
            timestamp,
            payload: phrase.as_bytes().to_vec(),
        }
    }

    /// Word hashes of a teach record.
    pub fn word_hashes(&self) -> Result<Vec<u64>, RecordError> {
        if !self.kind.is_teach() {
            return Err(RecordError::MalformedPayload(format!(
                "{} carries no word list",
                self.kind.name()
            )));
        }
        decode_word_list(&self.payload)
    }

    /// Phrase of a black list record.
    pub fn phrase_text(&self) -> Result<&str, RecordError> {
        if self.kind.is_teach() {
            return Err(RecordError::MalformedPayload(format!(
                "{} carries no phrase",
                self.kind.name()
            )));
        }
        std::str::from_utf8(&self.payload)
            .map_err(|e| RecordError::MalformedPayload(format!("phrase is not UTF-8: {}", e)))
    }

    /// Total encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.len() + RECORD_TRAILER_SIZE
    }

    /// Serialize the record as it will sit at log position `at`.
    pub fn encode(&self, at: &LogPosition) -> Vec<u8> {
        let body_len = self.encoded_len() - 4;

        let mut frame = Vec::with_capacity(self.encoded_len());
        frame.extend_from_slice(&(body_len as u32).to_le_bytes());
        frame.push(self.kind as u8);
        frame.extend_from_slice(&self.timestamp.to_le_bytes());
        frame.extend_from_slice(&self.payload);

        let crc = at.checksum_through(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    /// Deserialize one complete frame found at log position `at`.
    ///
    /// With `verify` off the chain CRC is not compared (the `-D` mode); the
    /// payload is still validated for its kind.
    pub fn decode(frame: &[u8], at: &LogPosition, verify: bool) -> Result<Self, RecordError> {
        if frame.len() < 4 {
            return Err(RecordError::InsufficientData);
        }

        let length = LittleEndian::read_u32(&frame[0..4]) as usize;
        check_length(length)?;

        if frame.len() < 4 + length {
            return Err(RecordError::InsufficientData);
        }

        let crc_at = 4 + length - RECORD_TRAILER_SIZE;
        let stored = LittleEndian::read_u32(&frame[crc_at..crc_at + 4]);
        if verify {
            let computed = at.checksum_through(&frame[..crc_at]);
            if computed != stored {
                return Err(RecordError::ChecksumMismatch {
                    expected: stored,
                    computed,
                });
            }
        }

        let kind = RecordKind::from_u8(frame[4]).ok_or(RecordError::UnknownKind(frame[4]))?;
        let timestamp = LittleEndian::read_i64(&frame[5..13]);
        let payload = frame[RECORD_HEADER_SIZE..crc_at].to_vec();

        let record = BinlogRecord {
            kind,
            timestamp,
            payload,
        };

        if kind.is_teach() {
            record.word_hashes()?;
        } else {
            record.phrase_text()?;
        }

        Ok(record)
    }
}

/// Validate a length prefix before trusting it to size a read.
pub fn check_length(length: usize) -> Result<(), RecordError> {
    if !(MIN_RECORD_BODY..=MAX_RECORD_LEN).contains(&length) {
        return Err(RecordError::InvalidLength(length));
    }
    Ok(())
}

fn decode_word_list(payload: &[u8]) -> Result<Vec<u64>, RecordError> {
    if payload.len() < 4 {
        return Err(RecordError::MalformedPayload("word list too short".into()));
    }
    let count = LittleEndian::read_u32(&payload[0..4]) as usize;
    let body = &payload[4..];
    if body.len() != count * 8 {
        return Err(RecordError::MalformedPayload(format!(
            "word list declares {} words but carries {} bytes",
            count,
            body.len()
        )));
    }
    Ok(body
        .chunks_exact(8)
        .map(LittleEndian::read_u64)
        .collect())
}

/// Binlog record parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// Not enough bytes for the declared frame
    #[error("Insufficient data to parse record")]
    InsufficientData,

    /// Length prefix outside the legal range
    #[error("Invalid record length: {0}")]
    InvalidLength(usize),

    /// Chain CRC mismatch
    #[error("Checksum mismatch: stored {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Stored CRC
        expected: u32,
        /// Computed CRC
        computed: u32,
    },

    /// Kind tag not known to this build
    #[error("Unknown record kind: {0}")]
    UnknownKind(u8),

    /// Payload does not match its kind
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}

impl RecordError {
    /// Whether this error is the signature of a torn or damaged tail, as
    /// opposed to a record this build cannot interpret.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            RecordError::InsufficientData
                | RecordError::InvalidLength(_)
                | RecordError::ChecksumMismatch { .. }
        )
    }
}
