//! Index (snapshot) files
//!
//! - `reader`: open and validate an index, lazy bucket reads
//! - `writer`: crash-safe index creation

pub mod reader;
pub mod writer;

pub use reader::{IndexError, IndexFile};
pub use writer::{IndexInfo, IndexSnapshot, IndexWriter};
