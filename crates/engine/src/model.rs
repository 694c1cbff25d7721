//! Bayes model state
//!
//! Word statistics live in two layers:
//!
//! - **Base buckets**: the counts checkpointed in the index. Loaded from disk
//!   on demand; absent until then. Without an index every bucket is resident
//!   and empty.
//! - **Deltas**: every teach record applied since the index, keyed by word.
//!   Always resident, so learning never waits on disk.
//!
//! Both layers hold signed tallies and a word's count is base + delta,
//! clamped at zero only when the classifier reads it. Because nothing is
//! clamped on the way into an index, the state after a log is the same
//! whether or not an index was cut in the middle of it. Binlog replay and
//! live teaching go through the same [`BayesModel::apply`], which is what
//! makes a restarted server agree with the one that crashed.

use bayes_durability::{BinlogRecord, RecordError, RecordKind};
use rustc_hash::FxHashMap;
use tracing::debug;
use xxhash_rust::xxh3::Xxh3;

use crate::blacklist::BlackList;
use crate::bucket::{bucket_of, Bucket, BucketError, Tally, WordCounts, WORD_ENTRY_BYTES};
use crate::classify::{word_probability, Classification, WordScore};
use crate::message::Message;

/// Default number of buckets for a new replica.
pub const DEFAULT_BUCKET_COUNT: u32 = 64;

#[derive(Debug)]
struct Resident {
    bucket: Bucket,
    last_used: u64,
}

/// Outcome of a classification attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Every needed bucket was resident
    Ready(Classification),
    /// This bucket must be loaded first
    NeedBucket(u32),
}

/// Classifier state.
#[derive(Debug)]
pub struct BayesModel {
    bucket_count: u32,
    buckets: Vec<Option<Resident>>,
    /// Whether absent buckets can be reloaded from an index
    backed_by_index: bool,
    deltas: FxHashMap<u64, Tally>,
    base_messages: Tally,
    message_delta: Tally,
    black_list: BlackList,
    teach_messages: u64,
    tick: u64,
}

impl BayesModel {
    /// Model of a replica without an index: all buckets resident and empty.
    pub fn empty(bucket_count: u32) -> Self {
        let bucket_count = bucket_count.max(1);
        BayesModel {
            bucket_count,
            buckets: (0..bucket_count)
                .map(|_| {
                    Some(Resident {
                        bucket: Bucket::new(),
                        last_used: 0,
                    })
                })
                .collect(),
            backed_by_index: false,
            deltas: FxHashMap::default(),
            base_messages: Tally::default(),
            message_delta: Tally::default(),
            black_list: BlackList::new(),
            teach_messages: 0,
            tick: 0,
        }
    }

    /// Model seeded from an index header; buckets stay on disk.
    ///
    /// Message counts are the signed net totals the index recorded.
    pub fn from_index(
        bucket_count: u32,
        spam_messages: i64,
        ham_messages: i64,
        black_list: &[u8],
    ) -> Result<Self, ModelError> {
        let mut model = Self::empty(bucket_count);
        model.buckets.iter_mut().for_each(|b| *b = None);
        model.backed_by_index = true;
        model.base_messages = Tally::new(spam_messages, ham_messages);
        model.black_list =
            BlackList::decode(black_list).map_err(|e| ModelError::BlackList(e.to_string()))?;
        Ok(model)
    }

    /// Apply one binlog record.
    pub fn apply(&mut self, record: &BinlogRecord) -> Result<(), ModelError> {
        match teach_delta(record.kind) {
            None if record.kind == RecordKind::BlackListAdd => {
                self.black_list.insert(record.phrase_text()?);
            }
            None => {
                self.black_list.remove(record.phrase_text()?);
            }
            Some(step) => {
                for hash in record.word_hashes()? {
                    let delta = self.deltas.entry(hash).or_default();
                    *delta += step;
                    if delta.is_zero() {
                        self.deltas.remove(&hash);
                    }
                }
                self.message_delta += step;
                self.teach_messages += 1;
            }
        }
        Ok(())
    }

    /// Load a bucket read from the index. A bucket already resident is kept.
    pub fn install_bucket(&mut self, bucket: u32, blob: &[u8]) -> Result<(), ModelError> {
        let slot = self
            .buckets
            .get_mut(bucket as usize)
            .ok_or(ModelError::NoSuchBucket(bucket))?;
        if slot.is_none() {
            *slot = Some(Resident {
                bucket: Bucket::decode(blob)?,
                last_used: self.tick,
            });
        }
        Ok(())
    }

    /// Whether a bucket is in memory.
    pub fn is_resident(&self, bucket: u32) -> bool {
        self.buckets
            .get(bucket as usize)
            .is_some_and(|b| b.is_some())
    }

    /// First bucket `message` needs that is not in memory.
    pub fn missing_bucket(&self, message: &Message) -> Option<u32> {
        message
            .words()
            .iter()
            .map(|w| bucket_of(w.hash, self.bucket_count))
            .find(|b| !self.is_resident(*b))
    }

    /// Effective counts of a word, `None` if its bucket is not resident.
    pub fn counts(&self, hash: u64) -> Option<WordCounts> {
        let bucket = bucket_of(hash, self.bucket_count);
        let base = self.buckets[bucket as usize].as_ref()?.bucket.get(hash);
        Some(self.merge(hash, base))
    }

    fn merge(&self, hash: u64, base: Tally) -> WordCounts {
        let delta = self.deltas.get(&hash).copied().unwrap_or_default();
        (base + delta).counts()
    }

    /// Classify a message, or name a bucket that must be loaded first.
    pub fn classify(&mut self, message: &Message) -> Verdict {
        if let Some(bucket) = self.missing_bucket(message) {
            return Verdict::NeedBucket(bucket);
        }

        self.tick += 1;
        let (spam_messages, ham_messages) = self.message_totals();
        let mut scores = Vec::with_capacity(message.words().len());
        for word in message.words() {
            let bucket = bucket_of(word.hash, self.bucket_count) as usize;
            let base = match &mut self.buckets[bucket] {
                Some(resident) => {
                    resident.last_used = self.tick;
                    resident.bucket.get(word.hash)
                }
                None => return Verdict::NeedBucket(bucket as u32),
            };
            let counts = self.merge(word.hash, base);
            scores.push(WordScore {
                word: word.text.clone(),
                hash: word.hash,
                counts,
                probability: word_probability(counts, spam_messages, ham_messages),
            });
        }

        let text = String::from_utf8_lossy(message.text());
        let black_listed = self.black_list.find_in(&text).map(str::to_string);
        Verdict::Ready(Classification::from_scores(scores, black_listed))
    }

    /// Drop least recently used buckets until the model fits `budget` bytes.
    ///
    /// Only buckets that can be reloaded from an index are dropped.
    pub fn evict_idle(&mut self, budget: usize) -> usize {
        if !self.backed_by_index {
            return 0;
        }

        let mut used = self.memory_bytes();
        if used <= budget {
            return 0;
        }

        let mut resident: Vec<(u64, usize)> = self
            .buckets
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.as_ref().map(|r| (r.last_used, i)))
            .collect();
        resident.sort_unstable();

        let mut evicted = 0;
        for (_, i) in resident {
            if used <= budget {
                break;
            }
            if let Some(r) = self.buckets[i].take() {
                used = used.saturating_sub(r.bucket.memory_bytes());
                evicted += 1;
            }
        }
        debug!(target: "bayes::model", evicted, used, budget, "Evicted idle buckets");
        evicted
    }

    /// Encode every bucket with deltas folded in, for a new index.
    ///
    /// Tallies are written unclamped.
    ///
    /// `load` supplies the base blob of buckets that are not resident.
    pub fn snapshot_buckets<F, E>(&self, mut load: F) -> Result<Vec<Vec<u8>>, E>
    where
        F: FnMut(u32) -> Result<Vec<u8>, E>,
        E: From<ModelError>,
    {
        let mut by_bucket: Vec<Vec<(u64, Tally)>> = vec![Vec::new(); self.bucket_count as usize];
        for (hash, delta) in &self.deltas {
            by_bucket[bucket_of(*hash, self.bucket_count) as usize].push((*hash, *delta));
        }

        let mut blobs = Vec::with_capacity(self.bucket_count as usize);
        for (i, deltas) in by_bucket.into_iter().enumerate() {
            let mut bucket = match &self.buckets[i] {
                Some(resident) => resident.bucket.clone(),
                None => Bucket::decode(&load(i as u32)?).map_err(ModelError::from)?,
            };
            for (hash, delta) in deltas {
                bucket.add(hash, delta);
            }
            blobs.push(bucket.encode());
        }
        Ok(blobs)
    }

    /// Effective (spam, ham) message totals, as the classifier sees them.
    pub fn message_totals(&self) -> (u64, u64) {
        let net = self.base_messages + self.message_delta;
        (net.spam.max(0) as u64, net.ham.max(0) as u64)
    }

    /// Signed net (spam, ham) teach counts, as an index records them.
    pub fn net_totals(&self) -> (i64, i64) {
        let net = self.base_messages + self.message_delta;
        (net.spam, net.ham)
    }

    /// Black list.
    pub fn black_list(&self) -> &BlackList {
        &self.black_list
    }

    /// Number of buckets.
    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    /// Buckets currently in memory.
    pub fn resident_buckets(&self) -> usize {
        self.buckets.iter().filter(|b| b.is_some()).count()
    }

    /// Teach records applied since start.
    pub fn teach_messages(&self) -> u64 {
        self.teach_messages
    }

    /// Approximate number of distinct words known in memory.
    pub fn words_count(&self) -> usize {
        let resident: usize = self.buckets.iter().flatten().map(|r| r.bucket.len()).sum();
        resident + self.deltas.len()
    }

    /// Estimated resident size of the model.
    pub fn memory_bytes(&self) -> usize {
        let buckets: usize = self
            .buckets
            .iter()
            .flatten()
            .map(|r| r.bucket.memory_bytes())
            .sum();
        buckets + self.deltas.capacity() * WORD_ENTRY_BYTES + self.black_list.memory_bytes()
    }

    /// Digest of the logical state; equal models have equal digests.
    pub fn state_digest(&self) -> u64 {
        let mut deltas: Vec<_> = self.deltas.iter().map(|(h, d)| (*h, *d)).collect();
        deltas.sort_unstable_by_key(|(h, _)| *h);

        let mut hasher = Xxh3::new();
        let (spam, ham) = self.net_totals();
        hasher.update(&spam.to_le_bytes());
        hasher.update(&ham.to_le_bytes());
        for (hash, delta) in deltas {
            hasher.update(&hash.to_le_bytes());
            hasher.update(&delta.spam.to_le_bytes());
            hasher.update(&delta.ham.to_le_bytes());
        }
        hasher.update(&self.black_list.encode());
        hasher.digest()
    }
}

/// Tally change of a teach record; `None` for black list records.
fn teach_delta(kind: RecordKind) -> Option<Tally> {
    match kind {
        RecordKind::SetSpam => Some(Tally::new(1, 0)),
        RecordKind::SetHam => Some(Tally::new(0, 1)),
        RecordKind::UnsetSpam => Some(Tally::new(-1, 0)),
        RecordKind::UnsetHam => Some(Tally::new(0, -1)),
        // relabel: the message moves to the other class
        RecordKind::ResetSpam => Some(Tally::new(-1, 1)),
        RecordKind::ResetHam => Some(Tally::new(1, -1)),
        RecordKind::BlackListAdd | RecordKind::BlackListDelete => None,
    }
}

/// Model errors.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Record payload unusable
    #[error("bad record: {0}")]
    Record(#[from] RecordError),
    /// Bucket blob unusable
    #[error("bad bucket: {0}")]
    Bucket(#[from] BucketError),
    /// Bucket number out of range
    #[error("no bucket {0}")]
    NoSuchBucket(u32),
    /// Black list section unusable
    #[error("bad black list: {0}")]
    BlackList(String),
}
