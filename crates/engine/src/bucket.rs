//! Word buckets
//!
//! The word table is split into N buckets by hash. A bucket is the unit an
//! index stores and the unit loaded from disk on demand.
//!
//! Buckets hold signed net tallies: an `unset` of a word never seen in the
//! same bucket still counts as -1. Tallies add up in any grouping, so the
//! state after a log does not depend on where indexes were cut. Counts are
//! clamped at zero only when read for classification.
//!
//! Blob layout: `count u32 | (hash u64, spam i64, ham i64) × count`, sorted
//! by hash so that equal tables encode to equal bytes.

use std::io::Cursor;
use std::ops::{Add, AddAssign};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rustc_hash::FxHashMap;

/// Bytes per encoded word entry.
const ENTRY_SIZE: usize = 24;

/// Estimated resident bytes per word entry (map slot and overhead).
pub const WORD_ENTRY_BYTES: usize = 48;

/// Spam/ham occurrence counts of one word, as used for classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WordCounts {
    /// Spam messages containing the word
    pub spam: u32,
    /// Ham messages containing the word
    pub ham: u32,
}

impl WordCounts {
    /// Whether the word was never seen.
    pub fn is_empty(&self) -> bool {
        self.spam == 0 && self.ham == 0
    }
}

/// Signed net spam/ham tally of one word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tally {
    /// Net spam teaches
    pub spam: i64,
    /// Net ham teaches
    pub ham: i64,
}

impl Tally {
    /// Tally of one teach step.
    pub fn new(spam: i64, ham: i64) -> Self {
        Tally { spam, ham }
    }

    /// Whether both sides cancel out.
    pub fn is_zero(&self) -> bool {
        self.spam == 0 && self.ham == 0
    }

    /// Counts seen by the classifier: negative tallies read as zero.
    pub fn counts(&self) -> WordCounts {
        let clamp = |v: i64| v.clamp(0, u32::MAX as i64) as u32;
        WordCounts {
            spam: clamp(self.spam),
            ham: clamp(self.ham),
        }
    }
}

impl Add for Tally {
    type Output = Tally;

    fn add(self, other: Tally) -> Tally {
        Tally {
            spam: self.spam.saturating_add(other.spam),
            ham: self.ham.saturating_add(other.ham),
        }
    }
}

impl AddAssign for Tally {
    fn add_assign(&mut self, other: Tally) {
        *self = *self + other;
    }
}

/// Bucket a word hash belongs to.
pub fn bucket_of(hash: u64, bucket_count: u32) -> u32 {
    (hash % bucket_count as u64) as u32
}

/// Word tallies of one bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bucket {
    words: FxHashMap<u64, Tally>,
}

impl Bucket {
    /// Empty bucket.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tally of a word (zero if unknown).
    pub fn get(&self, hash: u64) -> Tally {
        self.words.get(&hash).copied().unwrap_or_default()
    }

    /// Add to a word's tally; a tally that cancels out is removed.
    pub fn add(&mut self, hash: u64, tally: Tally) {
        let entry = self.words.entry(hash).or_default();
        *entry += tally;
        if entry.is_zero() {
            self.words.remove(&hash);
        }
    }

    /// Number of words.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Whether the bucket is empty.
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Estimated resident size.
    pub fn memory_bytes(&self) -> usize {
        std::mem::size_of::<Self>() + self.words.capacity() * WORD_ENTRY_BYTES
    }

    /// Encode to the on-disk blob.
    pub fn encode(&self) -> Vec<u8> {
        let mut entries: Vec<_> = self.words.iter().map(|(h, c)| (*h, *c)).collect();
        entries.sort_unstable_by_key(|(h, _)| *h);

        let mut out = Vec::with_capacity(4 + entries.len() * ENTRY_SIZE);
        // Vec writes are infallible
        let _ = out.write_u32::<LittleEndian>(entries.len() as u32);
        for (hash, tally) in entries {
            let _ = out.write_u64::<LittleEndian>(hash);
            let _ = out.write_i64::<LittleEndian>(tally.spam);
            let _ = out.write_i64::<LittleEndian>(tally.ham);
        }
        out
    }

    /// Decode an on-disk blob. An empty blob is an empty bucket.
    pub fn decode(blob: &[u8]) -> Result<Self, BucketError> {
        if blob.is_empty() {
            return Ok(Bucket::new());
        }

        let mut r = Cursor::new(blob);
        let count = r.read_u32::<LittleEndian>()? as usize;
        if blob.len() != 4 + count * ENTRY_SIZE {
            return Err(BucketError::LengthMismatch {
                count,
                len: blob.len(),
            });
        }

        let mut words = FxHashMap::default();
        words.reserve(count);
        for _ in 0..count {
            let hash = r.read_u64::<LittleEndian>()?;
            let spam = r.read_i64::<LittleEndian>()?;
            let ham = r.read_i64::<LittleEndian>()?;
            words.insert(hash, Tally { spam, ham });
        }
        Ok(Bucket { words })
    }

    /// Iterate over words.
    pub fn iter(&self) -> impl Iterator<Item = (u64, Tally)> + '_ {
        self.words.iter().map(|(h, c)| (*h, *c))
    }
}

/// Bucket decoding errors.
#[derive(Debug, thiserror::Error)]
pub enum BucketError {
    /// Blob shorter than a count
    #[error("truncated bucket: {0}")]
    Truncated(#[from] std::io::Error),
    /// Count disagrees with blob size
    #[error("bucket declares {count} words in {len} bytes")]
    LengthMismatch {
        /// Declared count
        count: usize,
        /// Blob length
        len: usize,
    },
}
