//! Memcache-protocol front end of the Bayes engine
//!
//! This crate turns a [`bayes_engine::BayesStore`] into a network service:
//! - Protocol: memcache text framing and key-prefix command dispatch
//! - Connections: explicit state machine with generation numbers
//! - Scheduler: test queries suspend on bucket reads and resume exactly once
//! - Server: single-threaded mio loop with cron, signals and graceful
//!   shutdown

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aio;
pub mod cli;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod keys;
pub mod logging;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod signals;
pub mod stats;

pub use aio::{BucketLoader, Completion, DiskReader, QueuedLoader};
pub use config::{ServerConfig, ServerConfigError};
pub use connection::{ConnStatus, Connection, ConnectionTable, PendingGet};
pub use dispatch::Dispatcher;
pub use error::{ExitStatus, ServerError};
pub use scheduler::{ScheduleError, Scheduler};
pub use server::{Server, ServerHandle};
pub use signals::Signals;
pub use stats::{AioStats, CommandStats, NetStats, Outcome};
