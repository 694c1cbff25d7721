//! Integration tests for the durable store
//!
//! These tests verify that:
//! - Teaching survives a restart through binlog replay
//! - An index build then restart reproduces the same verdicts
//! - Buckets of an index are loaded on demand
//! - Replay of the same log always produces the same state
//! - Where an index is cut into the log does not change the state

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use bayes_durability::{RecordKind, ReplicaPaths};
use bayes_engine::{word_hash, BayesStore, EngineConfig, Message, StoreError, Verdict, WordCounts};
use proptest::prelude::*;
use tempfile::TempDir;

fn paths(dir: &Path) -> ReplicaPaths {
    ReplicaPaths::from_prefix(dir.join("bayes")).unwrap()
}

fn message(tag: i32, text: &str) -> Message {
    let mut m = Message::new();
    m.reinit(tag, text.as_bytes());
    m
}

/// Classify, loading any missing bucket from the store's index.
fn classify(store: &mut BayesStore, msg: &Message) -> f64 {
    loop {
        match store.classify(msg) {
            Verdict::Ready(c) => return c.probability,
            Verdict::NeedBucket(bucket) => {
                let index = store.index().expect("bucket missing without index").clone();
                let blob = index.read_bucket(bucket).unwrap();
                store.install_bucket(bucket, &blob).unwrap();
            }
        }
    }
}

fn train(store: &mut BayesStore) {
    for _ in 0..3 {
        store
            .teach(RecordKind::SetSpam, &message(1, "cheap pills buy now"))
            .unwrap();
        store
            .teach(RecordKind::SetHam, &message(2, "lunch meeting agenda"))
            .unwrap();
    }
    store.add_black_list("Free Casino").unwrap();
}

#[test]
fn test_teaching_survives_restart() {
    let dir = TempDir::new().unwrap();
    let spam = message(9, "buy cheap pills");

    let before = {
        let mut store = BayesStore::open(paths(dir.path()), EngineConfig::for_testing()).unwrap();
        train(&mut store);
        store.shutdown().unwrap();
        classify(&mut store, &spam)
    };
    assert!(before > 0.9);

    let mut store = BayesStore::open(paths(dir.path()), EngineConfig::for_testing()).unwrap();
    assert_eq!(store.boot().replayed.records_applied, 7);
    assert_eq!(store.model().message_totals(), (3, 3));
    assert_eq!(classify(&mut store, &spam), before);
    assert_eq!(classify(&mut store, &message(1, "free casino tonight")), 1.0);
}

#[test]
fn test_unflushed_records_are_lost_on_crash() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::for_testing();
    {
        let mut store = BayesStore::open(paths(dir.path()), config.clone()).unwrap();
        store.teach(RecordKind::SetSpam, &message(1, "first")).unwrap();
        store.sync().unwrap();
        store.teach(RecordKind::SetSpam, &message(1, "second")).unwrap();
        // dropped without flush: the second record never reached the file
    }
    let store = BayesStore::open(paths(dir.path()), config).unwrap();
    assert_eq!(store.boot().replayed.records_applied, 1);
}

#[test]
fn test_index_then_restart_reproduces_verdicts() {
    let dir = TempDir::new().unwrap();
    let samples = [
        message(1, "buy cheap pills"),
        message(2, "agenda for lunch"),
        message(3, "visit free casino"),
        message(4, "completely unknown words"),
    ];

    let expected: Vec<f64> = {
        let mut store = BayesStore::open(paths(dir.path()), EngineConfig::for_testing()).unwrap();
        train(&mut store);
        store.shutdown().unwrap();
        samples.iter().map(|m| classify(&mut store, m)).collect()
    };

    // build the index the way index mode does
    let info = {
        let mut store =
            BayesStore::open_read_only(paths(dir.path()), EngineConfig::for_testing()).unwrap();
        store.write_index().unwrap()
    };
    assert!(info.path.exists());

    let mut store = BayesStore::open(paths(dir.path()), EngineConfig::for_testing()).unwrap();
    assert_eq!(store.boot().index_path.as_deref(), Some(info.path.as_path()));
    assert_eq!(store.boot().replayed.records_applied, 0);
    assert_eq!(store.model().resident_buckets(), 0);

    let actual: Vec<f64> = samples.iter().map(|m| classify(&mut store, m)).collect();
    assert_eq!(actual, expected);
    assert!(store.model().resident_buckets() > 0);
}

#[test]
fn test_teaching_after_index_replays_on_top() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = BayesStore::open(paths(dir.path()), EngineConfig::for_testing()).unwrap();
        train(&mut store);
        store.write_index().unwrap();
        store
            .teach(RecordKind::ResetSpam, &message(1, "cheap pills buy now"))
            .unwrap();
        store.delete_black_list("free casino").unwrap();
        store.shutdown().unwrap();
    }

    let mut store = BayesStore::open(paths(dir.path()), EngineConfig::for_testing()).unwrap();
    assert_eq!(store.boot().replayed.records_applied, 2);
    assert_eq!(store.model().message_totals(), (2, 4));
    assert!(store.model().black_list().is_empty());
    assert!(classify(&mut store, &message(5, "visit free casino")) < 1.0);
}

#[test]
fn test_read_only_store_refuses_mutations() {
    let dir = TempDir::new().unwrap();
    let mut store =
        BayesStore::open_read_only(paths(dir.path()), EngineConfig::for_testing()).unwrap();
    assert!(store.binlog().is_none());
    assert!(matches!(
        store.teach(RecordKind::SetHam, &message(1, "hello")),
        Err(StoreError::ReadOnly)
    ));
}

#[test]
fn test_black_list_edits() {
    let dir = TempDir::new().unwrap();
    let mut store = BayesStore::open(paths(dir.path()), EngineConfig::for_testing()).unwrap();
    assert!(!store.add_black_list("   ").unwrap());
    assert!(store.add_black_list("spam phrase").unwrap());
    assert!(store.add_black_list("SPAM PHRASE").unwrap());
    assert_eq!(store.model().black_list().len(), 1);
    assert!(!store.delete_black_list("other").unwrap());
    assert!(store.delete_black_list("spam phrase").unwrap());
    // one add and one delete reached the log
    assert_eq!(store.binlog().unwrap().counters().records_appended, 2);
}

#[test]
fn test_memory_ceiling_for_messages() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::for_testing().with_memory_limit_mib(1);
    let mut store = BayesStore::open(paths(dir.path()), config).unwrap();
    assert!(store.reserve_message(4096));
    assert!(!store.reserve_message(2 << 20));
    assert_eq!(store.message_bytes(), 4096);
    store.release_message(4096);
    assert_eq!(store.message_bytes(), 0);
}

#[test]
fn test_torn_tail_is_repaired_on_open() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = BayesStore::open(paths(dir.path()), EngineConfig::for_testing()).unwrap();
        store.teach(RecordKind::SetSpam, &message(1, "one")).unwrap();
        store.shutdown().unwrap();
    }
    let segment = paths(dir.path()).list_segments().unwrap().remove(0).path;
    let mut file = OpenOptions::new().append(true).open(&segment).unwrap();
    file.write_all(&[40, 0, 0, 0, 1, 2]).unwrap();
    drop(file);

    let store = BayesStore::open(paths(dir.path()), EngineConfig::for_testing()).unwrap();
    assert!(store.boot().repaired.is_some());
    assert_eq!(store.boot().replayed.records_applied, 1);

    let store = BayesStore::open(paths(dir.path()), EngineConfig::for_testing()).unwrap();
    assert!(store.boot().repaired.is_none());
}

const WORDS: [&str; 5] = ["alpha", "beta", "gamma", "delta", "epsilon"];

/// Message totals and the counts of every word in [`WORDS`].
fn observe(store: &mut BayesStore) -> ((u64, u64), Vec<Option<WordCounts>>) {
    classify(store, &message(0, &WORDS.join(" ")));
    let counts = WORDS
        .iter()
        .map(|w| store.model().counts(word_hash(w)))
        .collect();
    (store.model().message_totals(), counts)
}

/// Teach `steps`, writing an index after the first `cut` of them when
/// given, then reopen and observe.
fn run_with_cut(
    steps: &[(RecordKind, &str)],
    cut: Option<usize>,
) -> ((u64, u64), Vec<Option<WordCounts>>) {
    let dir = TempDir::new().unwrap();
    {
        let mut store = BayesStore::open(paths(dir.path()), EngineConfig::for_testing()).unwrap();
        for (i, (kind, text)) in steps.iter().enumerate() {
            if cut == Some(i) {
                store.write_index().unwrap();
            }
            store.teach(*kind, &message(0, text)).unwrap();
        }
        store.shutdown().unwrap();
    }
    let mut store = BayesStore::open(paths(dir.path()), EngineConfig::for_testing()).unwrap();
    observe(&mut store)
}

#[test]
fn test_index_cut_after_unset_keeps_state() {
    let steps = [
        (RecordKind::UnsetSpam, "alpha beta"),
        (RecordKind::SetSpam, "alpha beta"),
    ];
    let straight = run_with_cut(&steps, None);
    let cut = run_with_cut(&steps, Some(1));
    assert_eq!(cut, straight);
    assert_eq!(straight.0, (0, 0));
    assert_eq!(straight.1[0], Some(WordCounts::default()));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_index_cut_is_invisible(
        ops in prop::collection::vec((0u8..6, 0usize..4), 1..24),
        cut in any::<prop::sample::Index>(),
    ) {
        let texts = ["alpha beta", "beta gamma", "gamma delta alpha", "epsilon"];
        let kinds = [
            RecordKind::SetSpam,
            RecordKind::SetHam,
            RecordKind::UnsetSpam,
            RecordKind::UnsetHam,
            RecordKind::ResetSpam,
            RecordKind::ResetHam,
        ];
        let steps: Vec<(RecordKind, &str)> = ops
            .iter()
            .map(|(k, t)| (kinds[*k as usize], texts[*t]))
            .collect();
        let cut = cut.index(steps.len());
        prop_assert_eq!(run_with_cut(&steps, Some(cut)), run_with_cut(&steps, None));
    }

    #[test]
    fn prop_replay_is_deterministic(ops in prop::collection::vec((0u8..6, 0usize..4), 1..40)) {
        let dir = TempDir::new().unwrap();
        let texts = ["alpha beta", "beta gamma", "gamma delta alpha", "epsilon"];
        let kinds = [
            RecordKind::SetSpam,
            RecordKind::SetHam,
            RecordKind::UnsetSpam,
            RecordKind::UnsetHam,
            RecordKind::ResetSpam,
            RecordKind::ResetHam,
        ];

        let live = {
            let mut store = BayesStore::open(paths(dir.path()), EngineConfig::for_testing()).unwrap();
            for (kind, text) in &ops {
                store.teach(kinds[*kind as usize], &message(0, texts[*text])).unwrap();
            }
            store.shutdown().unwrap();
            store.model().state_digest()
        };

        let first = BayesStore::open(paths(dir.path()), EngineConfig::for_testing()).unwrap();
        let second = BayesStore::open(paths(dir.path()), EngineConfig::for_testing()).unwrap();
        prop_assert_eq!(first.model().state_digest(), live);
        prop_assert_eq!(second.model().state_digest(), live);
        prop_assert_eq!(first.position(), second.position());
    }
}
