//! Command accounting
//!
//! Every command handler runs under a [`CommandTimer`]. Elapsed time is
//! always recorded; the command counter only moves when the handler reports
//! [`Outcome::Executed`], so operators can tell malformed requests from
//! executed ones.

use std::time::{Duration, Instant};

/// Whether a command got past validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The command ran (even if it changed nothing)
    Executed,
    /// Malformed, unknown, over a limit, or waiting on disk
    RejectedPreExecution,
}

/// Command class a timer is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Read path (`get`)
    Get,
    /// Write path (`set`, `add`, `replace`)
    Set,
}

/// Counters and timings of one command class.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClassStats {
    /// Executed commands
    pub count: u64,
    /// Total time, executed or not
    pub total_time: Duration,
    /// Longest single command
    pub max_time: Duration,
}

impl ClassStats {
    fn record(&mut self, elapsed: Duration, outcome: Outcome) {
        if outcome == Outcome::Executed {
            self.count += 1;
        }
        self.total_time += elapsed;
        if elapsed > self.max_time {
            self.max_time = elapsed;
        }
    }
}

/// Process-wide command counters.
#[derive(Debug, Clone, Default)]
pub struct CommandStats {
    /// `get` path
    pub get: ClassStats,
    /// `set` path
    pub set: ClassStats,
    /// Requests parsed, of any kind
    pub total_requests: u64,
    /// Stats reports produced
    pub cmd_stats: u64,
    /// `version` commands
    pub cmd_version: u64,
}

impl CommandStats {
    /// Charge one command.
    pub fn record(&mut self, class: CommandClass, elapsed: Duration, outcome: Outcome) {
        match class {
            CommandClass::Get => self.get.record(elapsed, outcome),
            CommandClass::Set => self.set.record(elapsed, outcome),
        }
    }
}

/// Stopwatch for one command.
#[must_use = "a timer records nothing unless finished"]
#[derive(Debug)]
pub struct CommandTimer {
    class: CommandClass,
    started: Instant,
}

impl CommandTimer {
    /// Start timing a command.
    pub fn start(class: CommandClass) -> Self {
        CommandTimer {
            class,
            started: Instant::now(),
        }
    }

    /// Stop the clock and charge the command.
    pub fn finish(self, stats: &mut CommandStats, outcome: Outcome) {
        stats.record(self.class, self.started.elapsed(), outcome);
    }
}

/// Disk read counters.
#[derive(Debug, Clone, Default)]
pub struct AioStats {
    /// Bucket reads submitted
    pub tot_aio_queries: u64,
    /// Bucket reads in flight
    pub active_aio_queries: u64,
    /// Reads that completed after their deadline
    pub expired_aio_queries: u64,
    /// Total read latency
    pub total_aio_time: Duration,
    /// Completions discarded by the generation check
    pub stale_aio_completions: u64,
    /// Waits that ended in a timeout
    pub timed_out_queries: u64,
    /// Requests answered without waiting because no read slot was free
    pub dropped_queries: u64,
}

impl AioStats {
    /// Mean read latency in seconds.
    pub fn avg_aio_query_time(&self) -> f64 {
        if self.tot_aio_queries == 0 {
            return 0.0;
        }
        self.total_aio_time.as_secs_f64() / self.tot_aio_queries as f64
    }
}

/// Connection counters.
#[derive(Debug, Clone, Default)]
pub struct NetStats {
    /// Open connections
    pub active_connections: u64,
    /// Connections accepted since start
    pub accepted_connections: u64,
    /// Connections refused at the connection limit
    pub refused_connections: u64,
    /// Connection limit
    pub max_connections: u64,
}
