//! Request dispatch
//!
//! [`Dispatcher::drive`] runs a connection's state machine as far as it
//! can go: it parses buffered requests one at a time and executes them
//! until the input runs dry, the connection suspends on a bucket read, or
//! it closes. A suspended `get` keeps its remaining keys in
//! [`PendingGet`] and the key that needed the bucket is executed again
//! when the connection resumes.
//!
//! A connection resumed by a timeout or a failed read is in timeout until
//! its `get` ends: keys that would need a bucket are skipped, keys that
//! can be answered from memory still are.

use std::fmt::Write as _;
use std::time::Instant;

use bayes_core::Limits;
use bayes_engine::{BayesStore, Verdict};
use tracing::{debug, info, warn};

use crate::connection::{ConnStatus, Connection, ConnectionTable, PendingGet};
use crate::error::ServerError;
use crate::keys::{parse_get_key, parse_store_key, GetCommand, StoreCommand};
use crate::protocol::{
    parse_request, write_end, write_value, Payload, ProtocolError, Request, StoreRequest, VERSION,
};
use crate::scheduler::Scheduler;
use crate::stats::{CommandClass, CommandStats, CommandTimer, NetStats, Outcome};

enum KeyOutcome {
    Answered,
    Suspended,
}

/// Executes requests against the store.
pub struct Dispatcher {
    store: BayesStore,
    scheduler: Scheduler,
    commands: CommandStats,
    net: NetStats,
    limits: Limits,
    started: Instant,
    max_binlog_size: u64,
}

impl Dispatcher {
    /// Dispatcher over an opened store.
    pub fn new(store: BayesStore, scheduler: Scheduler, max_binlog_size: u64) -> Self {
        Dispatcher {
            store,
            scheduler,
            commands: CommandStats::default(),
            net: NetStats::default(),
            limits: Limits::default(),
            started: Instant::now(),
            max_binlog_size,
        }
    }

    /// Run a connection until it needs input, waits on disk, or closes.
    ///
    /// Store failures are returned; they end the server.
    pub fn drive(
        &mut self,
        table: &mut ConnectionTable,
        id: usize,
        now: Instant,
    ) -> Result<(), ServerError> {
        loop {
            let Some(conn) = table.get_mut(id) else {
                return Ok(());
            };
            if conn.status != ConnStatus::Reading {
                break;
            }
            if conn.discard > 0 && !conn.skip_discarded() {
                break;
            }
            if let Some(pending) = conn.pending.take() {
                self.run_get(table, id, pending, now)?;
                continue;
            }

            match parse_request(&conn.input, &self.limits) {
                Err(ProtocolError::Incomplete) => break,
                Err(e) => {
                    debug!(target: "bayes::server", conn = id, error = %e, "Bad request");
                    e.write_reply(&mut conn.output);
                    match e.consumed() {
                        Some(n) => {
                            conn.input.drain(..n);
                        }
                        None => {
                            conn.input.clear();
                            conn.status = ConnStatus::Closed;
                        }
                    }
                }
                Ok((request, used)) => {
                    conn.input.drain(..used);
                    self.commands.total_requests += 1;
                    self.execute(table, id, request, now)?;
                }
            }
        }

        if let Some(conn) = table.get_mut(id) {
            if conn.status == ConnStatus::Reading && !conn.output.is_empty() {
                conn.status = ConnStatus::Writing;
            }
        }
        Ok(())
    }

    fn execute(
        &mut self,
        table: &mut ConnectionTable,
        id: usize,
        request: Request,
        now: Instant,
    ) -> Result<(), ServerError> {
        if let Request::Get(keys) = request {
            return self.run_get(table, id, PendingGet { keys, next: 0 }, now);
        }
        let Some(conn) = table.get_mut(id) else {
            return Ok(());
        };
        match request {
            Request::Get(_) => {}
            Request::Store(store) => self.store_request(conn, store)?,
            Request::Delete { noreply, .. } => {
                if !noreply {
                    conn.output.extend_from_slice(b"NOT_FOUND\r\n");
                }
            }
            Request::Version => {
                self.commands.cmd_version += 1;
                conn.output
                    .extend_from_slice(format!("VERSION {}\r\n", VERSION).as_bytes());
            }
            Request::Stats => {
                self.commands.cmd_stats += 1;
                let report = self.stats_text();
                conn.output.extend_from_slice(report.as_bytes());
                write_end(&mut conn.output);
            }
            Request::Quit => conn.status = ConnStatus::Closed,
        }
        Ok(())
    }

    fn store_request(
        &mut self,
        conn: &mut Connection,
        request: StoreRequest,
    ) -> Result<(), ServerError> {
        let timer = CommandTimer::start(CommandClass::Set);

        let data = match request.payload {
            Payload::TooLarge(size) => {
                debug!(target: "bayes::server", conn = conn.id(), size, "Payload too large");
                conn.discard = size.saturating_add(2);
                conn.skip_discarded();
                None
            }
            Payload::Data(data) => Some(data),
        };

        let (outcome, stored) = match data {
            None => (Outcome::RejectedPreExecution, false),
            Some(data) => match parse_store_key(&request.key) {
                Err(e) => {
                    debug!(target: "bayes::server", key = %request.key, error = %e, "Rejected set");
                    (Outcome::RejectedPreExecution, false)
                }
                Ok(StoreCommand::CurrentText(tag)) => {
                    self.store.release_message(conn.message_bytes);
                    conn.message_bytes = 0;
                    conn.message.clear();
                    if self.store.reserve_message(data.len()) {
                        conn.message.reinit(tag, &data);
                        conn.message_bytes = data.len();
                        (Outcome::Executed, true)
                    } else {
                        warn!(
                            target: "bayes::server",
                            conn = conn.id(),
                            bytes = data.len(),
                            "Memory limit reached, message refused"
                        );
                        (Outcome::RejectedPreExecution, false)
                    }
                }
                Ok(command) => {
                    let phrase = String::from_utf8_lossy(&data);
                    if self.limits.validate_phrase(&phrase).is_err() {
                        (Outcome::RejectedPreExecution, false)
                    } else if command == StoreCommand::AddBlackList {
                        (Outcome::Executed, self.store.add_black_list(&phrase)?)
                    } else {
                        (Outcome::Executed, self.store.delete_black_list(&phrase)?)
                    }
                }
            },
        };

        timer.finish(&mut self.commands, outcome);
        if !request.noreply {
            let reply: &[u8] = if stored { b"STORED\r\n" } else { b"NOT_STORED\r\n" };
            conn.output.extend_from_slice(reply);
        }
        Ok(())
    }

    fn run_get(
        &mut self,
        table: &mut ConnectionTable,
        id: usize,
        mut pending: PendingGet,
        now: Instant,
    ) -> Result<(), ServerError> {
        while pending.next < pending.keys.len() {
            let Some(conn) = table.get_mut(id) else {
                return Ok(());
            };
            match self.get_key(conn, &pending.keys[pending.next], now)? {
                KeyOutcome::Answered => pending.next += 1,
                KeyOutcome::Suspended => {
                    conn.pending = Some(pending);
                    return Ok(());
                }
            }
        }
        if let Some(conn) = table.get_mut(id) {
            conn.in_timeout = false;
            write_end(&mut conn.output);
        }
        Ok(())
    }

    fn get_key(
        &mut self,
        conn: &mut Connection,
        key: &str,
        now: Instant,
    ) -> Result<KeyOutcome, ServerError> {
        let timer = CommandTimer::start(CommandClass::Get);
        let command = match parse_get_key(key) {
            Ok(command) => command,
            Err(e) => {
                debug!(target: "bayes::server", key, error = %e, "Rejected get");
                timer.finish(&mut self.commands, Outcome::RejectedPreExecution);
                return Ok(KeyOutcome::Answered);
            }
        };

        match command {
            GetCommand::Stats => {
                self.commands.cmd_stats += 1;
                let report = self.stats_text();
                let report = report.strip_suffix('\n').unwrap_or(&report);
                write_value(&mut conn.output, key, report.as_bytes());
                return Ok(KeyOutcome::Answered);
            }
            GetCommand::BlackList => {
                let rendered = self.store.model().black_list().render();
                write_value(&mut conn.output, key, rendered.as_bytes());
            }
            GetCommand::Test(tag) | GetCommand::TestProb(tag) | GetCommand::TestDebug(tag) => {
                return self.classify_request(conn, key, command, tag, timer, now);
            }
            teach => {
                if let Some((kind, tag)) = teach.teach() {
                    if conn.message.matches(tag) {
                        self.store.teach(kind, &conn.message)?;
                    }
                }
            }
        }
        timer.finish(&mut self.commands, Outcome::Executed);
        Ok(KeyOutcome::Answered)
    }

    fn classify_request(
        &mut self,
        conn: &mut Connection,
        key: &str,
        command: GetCommand,
        tag: i32,
        timer: CommandTimer,
        now: Instant,
    ) -> Result<KeyOutcome, ServerError> {
        if !conn.message.matches(tag) {
            timer.finish(&mut self.commands, Outcome::Executed);
            return Ok(KeyOutcome::Answered);
        }

        match self.store.classify(&conn.message) {
            Verdict::Ready(classification) => {
                let value = match command {
                    GetCommand::Test(_) => classification.label().to_string(),
                    GetCommand::TestProb(_) => format!("{:.6}", classification.probability),
                    _ => classification.debug_report(),
                };
                write_value(&mut conn.output, key, value.as_bytes());
                timer.finish(&mut self.commands, Outcome::Executed);
                Ok(KeyOutcome::Answered)
            }
            Verdict::NeedBucket(bucket) => {
                timer.finish(&mut self.commands, Outcome::RejectedPreExecution);
                if conn.in_timeout {
                    return Ok(KeyOutcome::Answered);
                }
                match self.scheduler.schedule(conn, bucket, now) {
                    Ok(()) => Ok(KeyOutcome::Suspended),
                    Err(e) => {
                        warn!(target: "bayes::server", conn = conn.id(), bucket, error = %e, "Query dropped");
                        Ok(KeyOutcome::Answered)
                    }
                }
            }
        }
    }

    /// Install finished bucket reads and drive the connections they resume.
    ///
    /// Returns the connections driven.
    pub fn process_completions(
        &mut self,
        table: &mut ConnectionTable,
        now: Instant,
    ) -> Result<Vec<usize>, ServerError> {
        let mut driven = Vec::new();
        for completion in self.scheduler.poll_completions() {
            let resumed = self
                .scheduler
                .on_completion(completion, table, &mut self.store, now);
            for id in resumed {
                self.drive(table, id, now)?;
                driven.push(id);
            }
        }
        Ok(driven)
    }

    /// Resume connections whose bucket wait expired and drive them.
    pub fn process_timeouts(
        &mut self,
        table: &mut ConnectionTable,
        now: Instant,
    ) -> Result<Vec<usize>, ServerError> {
        let resumed = self.scheduler.on_timeout(now, table);
        for &id in &resumed {
            self.drive(table, id, now)?;
        }
        Ok(resumed)
    }

    /// Once-a-second housekeeping: flush the binlog and evict idle buckets.
    pub fn cron(&mut self) -> Result<(), ServerError> {
        self.store.flush()?;
        let evicted = self.store.evict_idle();
        if evicted > 0 {
            debug!(target: "bayes::server", evicted, "Evicted idle buckets");
        }
        Ok(())
    }

    /// Make every appended record durable.
    pub fn sync(&mut self) -> Result<(), ServerError> {
        self.store.sync()?;
        Ok(())
    }

    /// Return a closed connection's memory.
    pub fn release(&mut self, conn: &Connection) {
        self.store.release_message(conn.message_bytes);
    }

    /// Flush and sync the store before exit.
    pub fn shutdown(&mut self) -> Result<(), ServerError> {
        self.store.shutdown()?;
        info!(
            target: "bayes::server",
            position = %self.store.position(),
            requests = self.commands.total_requests,
            "Store shut down"
        );
        Ok(())
    }

    /// The store.
    pub fn store(&self) -> &BayesStore {
        &self.store
    }

    /// The scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Command counters.
    pub fn commands(&self) -> &CommandStats {
        &self.commands
    }

    /// Connection counters, maintained by the event loop.
    pub fn net_mut(&mut self) -> &mut NetStats {
        &mut self.net
    }

    /// Stats report, one `key\tvalue` line per counter.
    pub fn stats_text(&self) -> String {
        let store = &self.store;
        let boot = store.boot();
        let model = store.model();
        let position = store.position();
        let aio = self.scheduler.stats();
        let commands = &self.commands;
        let binlog_path = store
            .binlog()
            .map_or_else(|| "(none)".to_string(), |b| b.segment_path().display().to_string());
        let index_path = boot
            .index_path
            .as_ref()
            .map_or_else(|| "(none)".to_string(), |p| p.display().to_string());

        let mut out = String::new();
        let mut line = |key: &str, value: &dyn std::fmt::Display| {
            let _ = writeln!(out, "{}\t{}", key, value);
        };
        line("heap_used", &store.memory_used());
        line("heap_max", &store.memory_limit());
        line("binlog_original_size", &boot.end.offset);
        line("binlog_loaded_bytes", &boot.replayed.bytes_replayed);
        line(
            "binlog_load_time",
            &format!("{:.6}s", boot.binlog_load_time.as_secs_f64()),
        );
        line("current_binlog_size", &position.offset);
        line(
            "binlog_uncommitted_bytes",
            &store.binlog().map_or(0, |b| b.uncommitted_bytes()),
        );
        line("binlog_path", &binlog_path);
        line("binlog_first_timestamp", &boot.start.timestamp);
        line("binlog_read_timestamp", &boot.end.timestamp);
        line("binlog_last_timestamp", &position.timestamp);
        line("max_binlog_size", &self.max_binlog_size);
        line("index_loaded_bytes", &boot.index_loaded_bytes);
        line("index_size", &boot.index_size);
        line("index_path", &index_path);
        line(
            "index_load_time",
            &format!("{:.6}s", boot.index_load_time.as_secs_f64()),
        );
        line("pid", &std::process::id());
        line("version", &VERSION);
        line("pointer_size", &usize::BITS);
        line("total_requests", &commands.total_requests);
        line("current_memory_used", &store.memory_used());
        line("cmd_get", &commands.get.count);
        line("cmd_set", &commands.set.count);
        line("cmd_stats", &commands.cmd_stats);
        line("cmd_version", &commands.cmd_version);
        line(
            "cmd_get_time",
            &format!("{:.7}", commands.get.total_time.as_secs_f64()),
        );
        line(
            "cmd_set_time",
            &format!("{:.7}", commands.set.total_time.as_secs_f64()),
        );
        line(
            "max_cmd_get_time",
            &format!("{:.7}", commands.get.max_time.as_secs_f64()),
        );
        line(
            "max_cmd_set_time",
            &format!("{:.7}", commands.set.max_time.as_secs_f64()),
        );
        line("teach_messages", &model.teach_messages());
        line("words_cnt", &model.words_count());
        line("tot_aio_queries", &aio.tot_aio_queries);
        line("active_aio_queries", &aio.active_aio_queries);
        line("expired_aio_queries", &aio.expired_aio_queries);
        line(
            "avg_aio_query_time",
            &format!("{:.6}", aio.avg_aio_query_time()),
        );
        line("stale_aio_completions", &aio.stale_aio_completions);
        line("timed_out_aio_queries", &aio.timed_out_queries);
        line("dropped_aio_queries", &aio.dropped_queries);
        line("resident_buckets", &model.resident_buckets());
        line("black_list_size", &model.black_list().len());
        line("limit_max_dynamic_memory", &store.memory_limit());
        line("uptime", &self.started.elapsed().as_secs());
        line("curr_connections", &self.net.active_connections);
        line("total_connections", &self.net.accepted_connections);
        line("rejected_connections", &self.net.refused_connections);
        line("max_connections", &self.net.max_connections);
        out
    }
}
