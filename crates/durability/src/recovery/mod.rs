//! Bootstrap recovery
//!
//! - `coordinator`: index load, binlog replay, tail repair (BootstrapCoordinator)
//! - `replayer`: segment-chained binlog replay (BinlogReplayer, ReplayError)

pub mod coordinator;
pub mod replayer;

pub use coordinator::{Bootstrap, BootstrapCoordinator, BootstrapError};
pub use replayer::{
    BinlogReplayer, RepairPoint, ReplayError, ReplayOutcome, ReplayReport, ReplayStats,
};
