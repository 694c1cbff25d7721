//! Async query scheduler
//!
//! A test query that needs a bucket that is not resident suspends its connection
//! here. Each waiter remembers the generation its connection had when it
//! suspended; a completion or timer only resumes the connection if the
//! generation still matches, so a wakeup can never land on a later request
//! that happens to use the same connection slot.
//!
//! One read is submitted per bucket however many connections wait on it.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use bayes_engine::BayesStore;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::aio::{BucketLoader, Completion};
use crate::connection::{ConnStatus, Connection, ConnectionTable};
use crate::stats::AioStats;

/// How long a connection waits for a bucket before it is answered without it.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_millis(500);

/// Reads slower than this are counted as expired.
pub const DEFAULT_AIO_DEADLINE: Duration = Duration::from_millis(700);

#[derive(Debug, Clone, Copy)]
struct PendingQuery {
    conn: usize,
    generation: u64,
}

/// Why a connection could not be suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    /// Every read slot is taken, or there is nothing to read from
    #[error("no read slot available")]
    NoSlot,
}

/// Suspends connections on bucket reads and resumes them.
pub struct Scheduler {
    loader: Option<Box<dyn BucketLoader>>,
    waiters: FxHashMap<u32, Vec<PendingQuery>>,
    in_flight: FxHashMap<u32, Instant>,
    timeouts: BinaryHeap<Reverse<(Instant, usize, u64)>>,
    query_timeout: Duration,
    aio_deadline: Duration,
    stats: AioStats,
}

impl Scheduler {
    /// Scheduler over `loader`; `None` when there is no index to read.
    pub fn new(loader: Option<Box<dyn BucketLoader>>) -> Self {
        Scheduler {
            loader,
            waiters: FxHashMap::default(),
            in_flight: FxHashMap::default(),
            timeouts: BinaryHeap::new(),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            aio_deadline: DEFAULT_AIO_DEADLINE,
            stats: AioStats::default(),
        }
    }

    /// Override the wait timeout.
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Suspend `conn` until `bucket` is loaded or the wait times out.
    pub fn schedule(
        &mut self,
        conn: &mut Connection,
        bucket: u32,
        now: Instant,
    ) -> Result<(), ScheduleError> {
        if !self.in_flight.contains_key(&bucket) {
            let loader = self.loader.as_mut().ok_or(ScheduleError::NoSlot)?;
            if !loader.submit(bucket, now) {
                self.stats.dropped_queries += 1;
                return Err(ScheduleError::NoSlot);
            }
            self.in_flight.insert(bucket, now);
            self.stats.tot_aio_queries += 1;
            self.stats.active_aio_queries = self.in_flight.len() as u64;
        }

        let deadline = now + self.query_timeout;
        self.waiters.entry(bucket).or_default().push(PendingQuery {
            conn: conn.id(),
            generation: conn.generation(),
        });
        self.timeouts
            .push(Reverse((deadline, conn.id(), conn.generation())));
        conn.status = ConnStatus::WaitingOnDisk { deadline, bucket };
        debug!(target: "bayes::aio", conn = conn.id(), bucket, "Waiting on bucket");
        Ok(())
    }

    /// Collect finished reads from the loader.
    pub fn poll_completions(&mut self) -> Vec<Completion> {
        let mut out = Vec::new();
        if let Some(loader) = self.loader.as_mut() {
            loader.poll_completions(&mut out);
        }
        out
    }

    /// Install a finished read and resume its waiters.
    ///
    /// Returns the connections resumed; the caller drives them.
    pub fn on_completion(
        &mut self,
        completion: Completion,
        table: &mut ConnectionTable,
        store: &mut BayesStore,
        now: Instant,
    ) -> Vec<usize> {
        let bucket = completion.bucket;
        let issued_at = self
            .in_flight
            .remove(&bucket)
            .unwrap_or(completion.issued_at);
        let elapsed = now.saturating_duration_since(issued_at);
        self.stats.total_aio_time += elapsed;
        if elapsed > self.aio_deadline {
            self.stats.expired_aio_queries += 1;
        }
        self.stats.active_aio_queries = self.in_flight.len() as u64;

        let failed = match completion.result {
            Ok(blob) => match store.install_bucket(bucket, &blob) {
                Ok(()) => false,
                Err(e) => {
                    warn!(target: "bayes::aio", bucket, error = %e, "Bucket rejected");
                    true
                }
            },
            Err(_) => true,
        };

        let mut resumed = Vec::new();
        for waiter in self.waiters.remove(&bucket).unwrap_or_default() {
            let current = table
                .get(waiter.conn)
                .filter(|c| c.is_waiting())
                .map(Connection::generation);
            if current != Some(waiter.generation) {
                self.stats.stale_aio_completions += 1;
                debug!(
                    target: "bayes::aio",
                    conn = waiter.conn,
                    bucket,
                    "Stale completion discarded"
                );
                continue;
            }
            if table.resume(waiter.conn, failed) {
                resumed.push(waiter.conn);
            }
        }
        resumed
    }

    /// Resume every connection whose wait expired by `now`.
    pub fn on_timeout(&mut self, now: Instant, table: &mut ConnectionTable) -> Vec<usize> {
        let mut resumed = Vec::new();
        while let Some(Reverse((deadline, conn, generation))) = self.timeouts.peek().copied() {
            if deadline > now {
                break;
            }
            self.timeouts.pop();

            let current = table
                .get(conn)
                .filter(|c| c.is_waiting())
                .map(Connection::generation);
            if current == Some(generation) && table.resume(conn, true) {
                self.stats.timed_out_queries += 1;
                debug!(target: "bayes::aio", conn, "Bucket wait timed out");
                resumed.push(conn);
            }
        }
        resumed
    }

    /// Earliest armed deadline.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.timeouts.peek().map(|Reverse((deadline, _, _))| *deadline)
    }

    /// Whether reads are outstanding.
    pub fn has_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Disk read counters.
    pub fn stats(&self) -> &AioStats {
        &self.stats
    }
}
