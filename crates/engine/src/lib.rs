//! Classifier engine for the Bayes server
//!
//! This crate owns the in-memory state and its durability:
//! - Tokenizer and per-connection message buffers
//! - Bucketed word counts with lazily loaded index buckets
//! - Black list of phrases
//! - Spam probability (naive Bayes combination)
//! - Store: bootstrap, binlog-before-apply mutations, index building
//!
//! Networking lives in `bayes-server`; this crate never blocks on sockets.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod blacklist;
pub mod bucket;
pub mod classify;
pub mod config;
pub mod message;
pub mod model;
pub mod store;
pub mod tokenize;

pub use blacklist::BlackList;
pub use bucket::{Bucket, BucketError, Tally, WordCounts};
pub use classify::{Classification, WordScore, SPAM_THRESHOLD};
pub use config::{EngineConfig, EngineConfigError};
pub use message::Message;
pub use model::{BayesModel, ModelError, Verdict, DEFAULT_BUCKET_COUNT};
pub use store::{BayesStore, BootInfo, StoreError};
pub use tokenize::{tokenize, word_hash, Word};
