//! Integration tests for request dispatch
//!
//! Connections are driven in memory; bucket reads go through a
//! `QueuedLoader` so each test decides when (and whether) a read finishes.
//!
//! These tests verify that:
//! - The teach and test cycle works end to end over the protocol
//! - A wakeup for an older request never lands on a newer one
//! - A timed-out test query answers exactly once
//! - Rejected commands are timed but not counted
//! - Oversized payloads are skipped without being buffered
//! - A read finishing after its client left never reaches the slot's next owner

use std::path::Path;
use std::time::{Duration, Instant};

use bayes_durability::{RecordKind, ReplicaPaths};
use bayes_engine::{BayesStore, EngineConfig, Message};
use bayes_server::{ConnStatus, ConnectionTable, Dispatcher, QueuedLoader, Scheduler};
use tempfile::TempDir;

fn paths(dir: &Path) -> ReplicaPaths {
    ReplicaPaths::from_prefix(dir.join("bayes")).unwrap()
}

struct Harness {
    dispatcher: Dispatcher,
    table: ConnectionTable,
    loader: QueuedLoader,
    _dir: TempDir,
}

impl Harness {
    fn new(store: BayesStore, dir: TempDir, slots: usize) -> Self {
        let loader = QueuedLoader::new(slots);
        let scheduler = Scheduler::new(Some(Box::new(loader.clone())));
        Harness {
            dispatcher: Dispatcher::new(store, scheduler, 1 << 30),
            table: ConnectionTable::new(8),
            loader,
            _dir: dir,
        }
    }

    /// A fresh replica with nothing learned.
    fn empty() -> Self {
        let dir = TempDir::new().unwrap();
        let store = BayesStore::open(paths(dir.path()), EngineConfig::for_testing()).unwrap();
        Self::new(store, dir, 4)
    }

    /// A replica whose words live only in its index, none resident.
    fn indexed() -> Self {
        let dir = TempDir::new().unwrap();
        {
            let mut store =
                BayesStore::open(paths(dir.path()), EngineConfig::for_testing()).unwrap();
            let mut spam = Message::new();
            spam.reinit(1, b"cheap pills");
            let mut ham = Message::new();
            ham.reinit(2, b"lunch agenda");
            for _ in 0..3 {
                store.teach(RecordKind::SetSpam, &spam).unwrap();
                store.teach(RecordKind::SetHam, &ham).unwrap();
            }
            store.write_index().unwrap();
            store.shutdown().unwrap();
        }
        let store = BayesStore::open(paths(dir.path()), EngineConfig::for_testing()).unwrap();
        assert_eq!(store.model().resident_buckets(), 0);
        Self::new(store, dir, 4)
    }

    fn connect(&mut self) -> usize {
        self.table.insert().unwrap()
    }

    fn pump(&mut self, id: usize) -> String {
        let mut out = Vec::new();
        loop {
            self.dispatcher
                .drive(&mut self.table, id, Instant::now())
                .unwrap();
            let chunk = match self.table.get_mut(id) {
                Some(conn) => conn.take_output(),
                None => break,
            };
            if chunk.is_empty() {
                break;
            }
            out.extend(chunk);
        }
        String::from_utf8(out).unwrap()
    }

    fn send(&mut self, id: usize, bytes: &[u8]) -> String {
        self.table
            .get_mut(id)
            .unwrap()
            .input
            .extend_from_slice(bytes);
        self.pump(id)
    }

    fn waiting_on(&self, id: usize) -> Option<u32> {
        match self.table.get(id)?.status {
            ConnStatus::WaitingOnDisk { bucket, .. } => Some(bucket),
            _ => None,
        }
    }

    /// Complete the read of `bucket` from the store's index and drive
    /// whoever it resumes.
    fn complete(&mut self, bucket: u32) -> Vec<usize> {
        let index = self.dispatcher.store().index().unwrap().clone();
        assert!(self.loader.complete_from(&index, bucket));
        self.dispatcher
            .process_completions(&mut self.table, Instant::now())
            .unwrap()
    }

    fn expire(&mut self) -> Vec<usize> {
        let later = Instant::now() + Duration::from_secs(5);
        self.dispatcher
            .process_timeouts(&mut self.table, later)
            .unwrap()
    }
}

fn set(key: &str, value: &str) -> Vec<u8> {
    format!("set {} 0 0 {}\r\n{}\r\n", key, value.len(), value).into_bytes()
}

#[test]
fn test_spam_scenario_end_to_end() {
    let mut h = Harness::empty();
    let c = h.connect();

    assert_eq!(h.send(c, &set("current_text7", "buy now!!!")), "STORED\r\n");
    assert_eq!(h.send(c, b"get set_spam7\r\n"), "END\r\n");
    assert_eq!(
        h.send(c, b"get test7\r\n"),
        "VALUE test7 0 4\r\nspam\r\nEND\r\n"
    );
    assert_eq!(h.send(c, b"get reset_spam7\r\n"), "END\r\n");
    assert_eq!(h.send(c, b"get test7\r\n"), "VALUE test7 0 3\r\nham\r\nEND\r\n");

    assert_eq!(h.dispatcher.store().model().message_totals(), (0, 1));
    assert_eq!(h.dispatcher.commands().set.count, 1);
    assert_eq!(h.dispatcher.commands().get.count, 4);
}

#[test]
fn test_tag_mismatch_is_a_no_op() {
    let mut h = Harness::empty();
    let c = h.connect();
    h.send(c, &set("current_text7", "hello world"));

    assert_eq!(h.send(c, b"get set_spam8\r\n"), "END\r\n");
    assert_eq!(h.send(c, b"get test8\r\n"), "END\r\n");
    assert_eq!(h.dispatcher.store().model().teach_messages(), 0);
    assert_eq!(h.dispatcher.commands().get.count, 2);
}

#[test]
fn test_routing_prefix_and_multi_get() {
    let mut h = Harness::empty();
    let c = h.connect();
    h.send(c, &set("^3@current_text5", "pills"));
    h.send(c, b"get 3@set_spam5\r\n");

    let out = h.send(c, b"get ^3@test_prob5 -3@^test5\r\n");
    assert_eq!(
        out,
        "VALUE ^3@test_prob5 0 8\r\n0.990000\r\nVALUE -3@^test5 0 4\r\nspam\r\nEND\r\n"
    );
}

#[test]
fn test_pipelined_requests_answer_in_order() {
    let mut h = Harness::empty();
    let c = h.connect();
    let mut batch = set("current_text1", "abc");
    batch.extend_from_slice(b"version\r\nget test1\r\ndelete x\r\n");
    assert_eq!(
        h.send(c, &batch),
        "STORED\r\nVERSION 0.99\r\nVALUE test1 0 3\r\nham\r\nEND\r\nNOT_FOUND\r\n"
    );
}

#[test]
fn test_black_list_commands() {
    let mut h = Harness::empty();
    let c = h.connect();
    assert_eq!(h.send(c, &set("add_black_list", "Free Casino")), "STORED\r\n");
    assert_eq!(h.send(c, &set("add_black_list", "   ")), "NOT_STORED\r\n");

    h.send(c, &set("current_text2", "visit the free casino now"));
    assert_eq!(
        h.send(c, b"get test_prob2\r\n"),
        "VALUE test_prob2 0 8\r\n1.000000\r\nEND\r\n"
    );
    let listed = h.send(c, b"get black_list\r\n");
    assert!(listed.starts_with("VALUE black_list 0 "));
    assert!(listed.contains("free casino"));

    assert_eq!(
        h.send(c, &set("delete_black_list", "free casino")),
        "STORED\r\n"
    );
    assert_eq!(
        h.send(c, &set("delete_black_list", "free casino")),
        "NOT_STORED\r\n"
    );
    assert_eq!(
        h.send(c, b"get black_list\r\n"),
        "VALUE black_list 0 0\r\n\r\nEND\r\n"
    );
}

#[test]
fn test_long_black_list_phrase_is_accepted() {
    let mut h = Harness::empty();
    let c = h.connect();
    let phrase = ["casino"; 400].join(" ");
    assert!(phrase.len() > 2048);
    assert_eq!(h.send(c, &set("add_black_list", &phrase)), "STORED\r\n");
    assert!(h.send(c, b"get black_list\r\n").contains(&phrase));
    assert_eq!(h.send(c, &set("delete_black_list", &phrase)), "STORED\r\n");
}

#[test]
fn test_rejected_commands_are_not_counted() {
    let mut h = Harness::empty();
    let c = h.connect();

    assert_eq!(h.send(c, b"get set_spamX\r\n"), "END\r\n");
    assert_eq!(h.send(c, b"get nothing_here\r\n"), "END\r\n");
    assert_eq!(h.send(c, &set("current_textX", "abc")), "NOT_STORED\r\n");
    assert_eq!(h.send(c, &set("unknown", "abc")), "NOT_STORED\r\n");

    let commands = h.dispatcher.commands();
    assert_eq!(commands.get.count, 0);
    assert_eq!(commands.set.count, 0);
    assert_eq!(commands.total_requests, 4);

    h.send(c, &set("current_text1", "abc"));
    assert_eq!(h.dispatcher.commands().set.count, 1);
}

#[test]
fn test_stats_key_counts_as_stats_only() {
    let mut h = Harness::empty();
    let c = h.connect();
    let out = h.send(c, b"get stats\r\n");
    assert!(out.starts_with("VALUE stats 0 "));
    assert!(out.contains("heap_used\t"));
    assert!(out.contains("version\t0.99"));
    assert!(out.contains("cmd_stats\t1"));
    assert!(out.ends_with("\r\nEND\r\n"));
    assert!(!out.contains("\n\r\nEND"));
    assert_eq!(h.dispatcher.commands().get.count, 0);

    let out = h.send(c, b"stats\r\n");
    assert!(out.contains("cmd_stats\t2\n"));
    assert!(out.ends_with("\nEND\r\n"));
}

#[test]
fn test_stats_report_fields() {
    let h = Harness::empty();
    let report = h.dispatcher.stats_text();
    let keys: Vec<&str> = report
        .lines()
        .map(|line| line.split('\t').next().unwrap())
        .collect();
    for expected in [
        "heap_used",
        "binlog_original_size",
        "binlog_load_time",
        "current_binlog_size",
        "binlog_path",
        "index_path",
        "pid",
        "total_requests",
        "cmd_get_time",
        "max_cmd_set_time",
        "teach_messages",
        "words_cnt",
        "tot_aio_queries",
        "avg_aio_query_time",
        "limit_max_dynamic_memory",
    ] {
        assert!(keys.contains(&expected), "missing {}", expected);
    }
    assert!(report.lines().all(|line| line.contains('\t')));
    assert!(report.contains("index_path\t(none)"));
}

#[test]
fn test_oversized_payload_is_discarded_unbuffered() {
    let mut h = Harness::empty();
    let c = h.connect();
    let size = 1 << 20;

    let out = h.send(c, format!("set current_text1 0 0 {}\r\n", size).as_bytes());
    assert_eq!(out, "NOT_STORED\r\n");

    let chunk = vec![b'x'; 64 * 1024];
    for _ in 0..size / chunk.len() {
        assert_eq!(h.send(c, &chunk), "");
        assert!(h.table.get(c).unwrap().input.len() <= chunk.len());
    }
    assert_eq!(h.send(c, b"\r\nversion\r\n"), "VERSION 0.99\r\n");
    assert!(h.table.get(c).unwrap().input.is_empty());
}

#[test]
fn test_absurd_payload_size_closes_only_that_connection() {
    let mut h = Harness::empty();
    let c = h.connect();
    let other = h.connect();

    let out = h.send(
        c,
        b"set current_text1 0 0 18446744073709551615\r\nversion\r\n",
    );
    assert_eq!(out, "CLIENT_ERROR bad data chunk\r\n");
    assert!(h.table.get(c).unwrap().is_closed());

    // the largest size still accepted is skipped, not buffered
    let out = h.send(other, b"set current_text1 0 0 2147483647\r\n");
    assert_eq!(out, "NOT_STORED\r\n");
    assert_eq!(h.table.get(other).unwrap().discard, 2_147_483_649);
    assert_eq!(h.dispatcher.commands().set.count, 0);
}

#[test]
fn test_quit_and_unknown_verbs() {
    let mut h = Harness::empty();
    let c = h.connect();
    assert_eq!(h.send(c, b"flush_all\r\n"), "ERROR\r\n");
    assert_eq!(h.send(c, b"quit\r\n"), "");
    assert!(h.table.get(c).unwrap().is_closed());
}

#[test]
fn test_query_loads_buckets_from_index() {
    let mut h = Harness::indexed();
    let c = h.connect();
    h.send(c, &set("current_text1", "cheap pills"));

    assert_eq!(h.send(c, b"get test1\r\n"), "");
    let mut reads = 0;
    while let Some(bucket) = h.waiting_on(c) {
        reads += 1;
        assert_eq!(h.complete(bucket), vec![c]);
        let out = h.pump(c);
        if h.waiting_on(c).is_none() {
            assert_eq!(out, "VALUE test1 0 4\r\nspam\r\nEND\r\n");
        }
    }
    assert!(reads >= 1);
    let aio = h.dispatcher.scheduler().stats();
    assert_eq!(aio.tot_aio_queries, reads);
    assert_eq!(aio.stale_aio_completions, 0);
    assert_eq!(aio.active_aio_queries, 0);
}

#[test]
fn test_timeout_answers_exactly_once() {
    let mut h = Harness::indexed();
    let c = h.connect();
    h.send(c, &set("current_text1", "pills"));

    assert_eq!(h.send(c, b"get test1\r\n"), "");
    let bucket = h.waiting_on(c).unwrap();

    assert_eq!(h.expire(), vec![c]);
    assert_eq!(h.pump(c), "END\r\n");
    assert!(!h.table.get(c).unwrap().in_timeout);

    // the late read resumes nobody and writes nothing
    assert!(h.complete(bucket).is_empty());
    assert_eq!(h.pump(c), "");
    assert!(h.expire().is_empty());

    let aio = h.dispatcher.scheduler().stats();
    assert_eq!(aio.timed_out_queries, 1);
    assert_eq!(aio.stale_aio_completions, 1);

    // the bucket is resident now
    assert_eq!(
        h.send(c, b"get test1\r\n"),
        "VALUE test1 0 4\r\nspam\r\nEND\r\n"
    );
}

#[test]
fn test_stale_wakeup_never_reaches_a_newer_request() {
    let mut h = Harness::indexed();
    let c = h.connect();
    h.send(c, &set("current_text1", "pills"));

    h.send(c, b"get test1\r\n");
    let bucket = h.waiting_on(c).unwrap();
    h.expire();
    assert_eq!(h.pump(c), "END\r\n");

    // a new request waits on the same, still outstanding, read
    assert_eq!(h.send(c, b"get test_prob1\r\n"), "");
    assert_eq!(h.waiting_on(c), Some(bucket));
    assert_eq!(h.loader.submitted(), vec![bucket]);

    // one completion: the old waiter is discarded, the new one resumed once
    assert_eq!(h.complete(bucket), vec![c]);
    let out = h.pump(c);
    assert!(out.starts_with("VALUE test_prob1 0 8\r\n"));
    assert_eq!(out.matches("END\r\n").count(), 1);
    assert_eq!(h.dispatcher.scheduler().stats().stale_aio_completions, 1);
    assert_eq!(h.dispatcher.scheduler().stats().tot_aio_queries, 1);
}

#[test]
fn test_wakeup_for_a_recycled_slot_is_discarded() {
    let mut h = Harness::indexed();
    let c = h.connect();
    h.send(c, &set("current_text1", "pills"));
    h.send(c, b"get test1\r\n");
    let bucket = h.waiting_on(c).unwrap();
    let old_generation = h.table.get(c).unwrap().generation();

    // the waiting client goes away and a new one takes over its slot
    let gone = h.table.remove(c).unwrap();
    h.dispatcher.release(&gone);
    let reused = h.connect();
    assert_eq!(reused, c);
    assert_ne!(h.table.get(reused).unwrap().generation(), old_generation);
    h.send(reused, &set("current_text2", "lunch agenda"));

    // the read finishes: nobody is resumed and the new client sees nothing
    assert!(h.complete(bucket).is_empty());
    assert_eq!(h.pump(reused), "");
    assert_eq!(h.table.get(reused).unwrap().status, ConnStatus::Reading);
    assert!(!h.table.get(reused).unwrap().in_timeout);
    assert_eq!(h.dispatcher.scheduler().stats().stale_aio_completions, 1);

    // the old deadline passing does not touch it either
    assert!(h.expire().is_empty());

    // and its own requests are answered normally
    let mut out = h.send(reused, b"get test2\r\n");
    while let Some(bucket) = h.waiting_on(reused) {
        assert_eq!(h.complete(bucket), vec![reused]);
        out.push_str(&h.pump(reused));
    }
    assert_eq!(out, "VALUE test2 0 3\r\nham\r\nEND\r\n");
}

#[test]
fn test_failed_read_answers_without_value() {
    let mut h = Harness::indexed();
    let c = h.connect();
    h.send(c, &set("current_text1", "pills"));
    h.send(c, b"get black_list test1 stats_nothing\r\n");
    let bucket = h.waiting_on(c).unwrap();

    assert!(h.loader.complete(bucket, Err("disk on fire".to_string())));
    let resumed = h
        .dispatcher
        .process_completions(&mut h.table, Instant::now())
        .unwrap();
    assert_eq!(resumed, vec![c]);
    let out = h.pump(c);
    assert!(out.starts_with("VALUE stats_nothing 0 "));
    assert!(!out.contains("test1"));
    assert!(out.ends_with("END\r\n"));
    assert_eq!(h.dispatcher.store().model().resident_buckets(), 0);
}

#[test]
fn test_closed_connection_releases_message_memory() {
    let mut h = Harness::empty();
    let c = h.connect();
    h.send(c, &set("current_text1", "some text to hold"));
    assert_eq!(h.dispatcher.store().message_bytes(), 17);

    h.send(c, &set("current_text2", "shorter"));
    assert_eq!(h.dispatcher.store().message_bytes(), 7);

    let conn = h.table.remove(c).unwrap();
    h.dispatcher.release(&conn);
    assert_eq!(h.dispatcher.store().message_bytes(), 0);
}
