//! Core types for the Bayes engine
//!
//! This crate defines the foundational types shared by the durability layer,
//! the classifier model and the server:
//! - LogPosition: committed binlog frontier (offset, timestamp, CRC chain)
//! - Limits: key, value and record size limits

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod limits;
pub mod log_position;

pub use limits::{LimitError, Limits, MAX_KEY_LEN, MAX_RECORD_LEN, MAX_VALUE_LEN};
pub use log_position::{unix_now, LogPosition};
