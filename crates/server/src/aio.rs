//! Bucket reads off the event loop
//!
//! The event loop never blocks on the index. Bucket reads go to a
//! [`BucketLoader`]: in production a [`DiskReader`] thread doing positional
//! reads on the shared index file, in tests a [`QueuedLoader`] the test
//! completes by hand. Completions are collected by the loop, which is woken
//! through a `mio::Waker` when one is ready.
//!
//! The reader thread only touches the index file and its own queues.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use bayes_durability::IndexFile;
use mio::Waker;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

/// A finished bucket read.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Bucket read
    pub bucket: u32,
    /// Blob, or why the read failed
    pub result: Result<Vec<u8>, String>,
    /// When the read was submitted
    pub issued_at: Instant,
}

/// Source of bucket reads.
pub trait BucketLoader: Send {
    /// Submit a read. `false` when every read slot is taken.
    fn submit(&mut self, bucket: u32, now: Instant) -> bool;

    /// Move finished reads into `out`.
    fn poll_completions(&mut self, out: &mut Vec<Completion>);

    /// Reads submitted and not yet collected.
    fn in_flight(&self) -> usize;
}

struct ReaderShared {
    requests: Mutex<VecDeque<(u32, Instant)>>,
    work_ready: Condvar,
    completions: Mutex<Vec<Completion>>,
    shutdown: AtomicBool,
}

/// Background thread reading buckets from an index file.
pub struct DiskReader {
    shared: Arc<ReaderShared>,
    worker: Option<JoinHandle<()>>,
    slots: usize,
    in_flight: usize,
}

impl DiskReader {
    /// Start a reader over `index` with `slots` concurrent reads.
    ///
    /// `waker` is woken after each completion.
    pub fn spawn(
        index: Arc<IndexFile>,
        slots: usize,
        waker: Option<Arc<Waker>>,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(ReaderShared {
            requests: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            completions: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("bayes-aio".to_string())
            .spawn(move || reader_loop(&worker_shared, &index, waker.as_deref()))?;

        Ok(DiskReader {
            shared,
            worker: Some(worker),
            slots: slots.max(1),
            in_flight: 0,
        })
    }
}

fn reader_loop(shared: &ReaderShared, index: &IndexFile, waker: Option<&Waker>) {
    loop {
        let (bucket, issued_at) = {
            let mut requests = shared.requests.lock();
            loop {
                if let Some(request) = requests.pop_front() {
                    break request;
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                shared.work_ready.wait(&mut requests);
            }
        };

        let result = index.read_bucket(bucket).map_err(|e| e.to_string());
        if let Err(e) = &result {
            warn!(target: "bayes::aio", bucket, error = %e, "Bucket read failed");
        }
        shared.completions.lock().push(Completion {
            bucket,
            result,
            issued_at,
        });

        if let Some(waker) = waker {
            if let Err(e) = waker.wake() {
                warn!(target: "bayes::aio", error = %e, "Failed to wake event loop");
            }
        }
    }
}

impl BucketLoader for DiskReader {
    fn submit(&mut self, bucket: u32, now: Instant) -> bool {
        if self.in_flight >= self.slots {
            return false;
        }
        self.shared.requests.lock().push_back((bucket, now));
        self.shared.work_ready.notify_one();
        self.in_flight += 1;
        true
    }

    fn poll_completions(&mut self, out: &mut Vec<Completion>) {
        let mut done = self.shared.completions.lock();
        self.in_flight = self.in_flight.saturating_sub(done.len());
        out.append(&mut done);
    }

    fn in_flight(&self) -> usize {
        self.in_flight
    }
}

impl Drop for DiskReader {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        {
            let _requests = self.shared.requests.lock();
            self.shared.work_ready.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(target: "bayes::aio", "Reader thread panicked");
            }
        }
        debug!(target: "bayes::aio", "Reader stopped");
    }
}

#[derive(Debug, Default)]
struct QueuedState {
    submitted: Vec<(u32, Instant)>,
    ready: Vec<Completion>,
    in_flight: usize,
}

/// Loader whose reads complete only when told to.
///
/// Clones share state, so a test keeps one handle while the scheduler owns
/// another.
#[derive(Debug, Clone)]
pub struct QueuedLoader {
    state: Arc<Mutex<QueuedState>>,
    slots: usize,
}

impl QueuedLoader {
    /// Loader with `slots` concurrent reads.
    pub fn new(slots: usize) -> Self {
        QueuedLoader {
            state: Arc::new(Mutex::new(QueuedState::default())),
            slots,
        }
    }

    /// Buckets submitted and not yet completed, oldest first.
    pub fn submitted(&self) -> Vec<u32> {
        self.state.lock().submitted.iter().map(|(b, _)| *b).collect()
    }

    /// Finish the oldest outstanding read of `bucket` with `result`.
    pub fn complete(&self, bucket: u32, result: Result<Vec<u8>, String>) -> bool {
        let mut state = self.state.lock();
        let Some(pos) = state.submitted.iter().position(|(b, _)| *b == bucket) else {
            return false;
        };
        let (_, issued_at) = state.submitted.remove(pos);
        state.ready.push(Completion {
            bucket,
            result,
            issued_at,
        });
        true
    }

    /// Finish a read from `index`.
    pub fn complete_from(&self, index: &IndexFile, bucket: u32) -> bool {
        self.complete(bucket, index.read_bucket(bucket).map_err(|e| e.to_string()))
    }
}

impl BucketLoader for QueuedLoader {
    fn submit(&mut self, bucket: u32, now: Instant) -> bool {
        let mut state = self.state.lock();
        if state.in_flight >= self.slots {
            return false;
        }
        state.submitted.push((bucket, now));
        state.in_flight += 1;
        true
    }

    fn poll_completions(&mut self, out: &mut Vec<Completion>) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(state.ready.len());
        out.append(&mut state.ready);
    }

    fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }
}
