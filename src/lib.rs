//! Bayes - durable spam classifier behind a memcache front end
//!
//! Clients stream a message with `set current_text<tag>`, then ask for a
//! verdict with `get test<tag>` or teach the model with `get set_spam<tag>`
//! and friends. Every mutation is logged to a CRC-chained binlog before it is
//! applied, so a restart replays to the exact committed state.
//!
//! # Layout
//!
//! - [`core`]: log positions and size limits
//! - [`durability`]: binlog segments, index files, bootstrap and repair
//! - [`engine`]: tokenizer, word counts, black list, classifier, store
//! - [`server`]: memcache protocol, bucket-read scheduler, event loop

pub use bayes_core as core;
pub use bayes_durability as durability;
pub use bayes_engine as engine;
pub use bayes_server as server;
