//! Durable classifier store
//!
//! Ties the model to its files: bootstrap from index and binlog, append
//! every mutation to the binlog before applying it, build indexes, and
//! keep the memory ceiling.
//!
//! Mutations go through the same [`BayesModel::apply`] replay uses, so the
//! state after a restart is the state before it.

use std::cell::RefCell;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bayes_core::{unix_now, LogPosition};
use bayes_durability::{
    BinlogError, BinlogRecord, BinlogWriter, BootstrapCoordinator, BootstrapError, IndexError,
    IndexFile, IndexInfo, IndexSnapshot, IndexWriter, RecordKind, RepairPoint, ReplayStats,
    ReplicaPaths,
};
use tracing::{debug, info};

use crate::blacklist::normalize_phrase;
use crate::config::{EngineConfig, EngineConfigError};
use crate::message::Message;
use crate::model::{BayesModel, ModelError, Verdict};

/// What bootstrap found, for stats and logs.
#[derive(Debug, Clone)]
pub struct BootInfo {
    /// Index loaded, if any
    pub index_path: Option<PathBuf>,
    /// Size of that index
    pub index_size: u64,
    /// Index bytes held in memory (header, directory, black list)
    pub index_loaded_bytes: u64,
    /// Time spent opening the index
    pub index_load_time: Duration,
    /// Position replay started from
    pub start: LogPosition,
    /// Position replay reached
    pub end: LogPosition,
    /// Replay statistics
    pub replayed: ReplayStats,
    /// Time spent replaying
    pub binlog_load_time: Duration,
    /// Truncated tail, if bootstrap repaired one
    pub repaired: Option<RepairPoint>,
    /// Replica UUID
    pub replica_id: [u8; 16],
}

/// Classifier model bound to its replica files.
pub struct BayesStore {
    paths: ReplicaPaths,
    config: EngineConfig,
    model: BayesModel,
    index: Option<Arc<IndexFile>>,
    binlog: Option<BinlogWriter>,
    boot: BootInfo,
    message_bytes: usize,
}

impl BayesStore {
    /// Bootstrap a replica and open its binlog for appending.
    pub fn open(paths: ReplicaPaths, config: EngineConfig) -> Result<Self, StoreError> {
        Self::bootstrap(paths, config, true)
    }

    /// Bootstrap a replica without touching its binlog.
    ///
    /// A damaged tail is left in place and mutations are refused. Used to
    /// build indexes.
    pub fn open_read_only(paths: ReplicaPaths, config: EngineConfig) -> Result<Self, StoreError> {
        let config = config.with_repair(false);
        Self::bootstrap(paths, config, false)
    }

    fn bootstrap(
        paths: ReplicaPaths,
        config: EngineConfig,
        writable: bool,
    ) -> Result<Self, StoreError> {
        config.validate()?;

        let coordinator = BootstrapCoordinator::new(paths.clone(), config.binlog.clone())
            .with_repair(config.repair && writable);

        let model = RefCell::new(BayesModel::empty(config.bucket_count));
        let boot = coordinator.bootstrap(
            |index| {
                let header = index.header();
                let seeded = BayesModel::from_index(
                    header.bucket_count,
                    header.spam_messages,
                    header.ham_messages,
                    index.black_list(),
                )
                .map_err(|e| e.to_string())?;
                *model.borrow_mut() = seeded;
                Ok(())
            },
            |record| model.borrow_mut().apply(record).map_err(|e| e.to_string()),
        )?;

        let binlog = if writable {
            Some(coordinator.open_writer(&boot)?)
        } else {
            None
        };

        let info = BootInfo {
            index_path: boot.index.as_ref().map(|i| i.path().to_path_buf()),
            index_size: boot.index.as_ref().map_or(0, |i| i.file_size()),
            index_loaded_bytes: boot.index.as_ref().map_or(0, |i| i.loaded_bytes()),
            index_load_time: boot.index_load_time,
            start: boot.start,
            end: boot.position,
            replayed: boot.stats,
            binlog_load_time: boot.binlog_load_time,
            repaired: boot.repaired.clone(),
            replica_id: boot.replica_id,
        };

        let model = model.into_inner();
        info!(
            target: "bayes::store",
            buckets = model.bucket_count(),
            resident = model.resident_buckets(),
            black_list = model.black_list().len(),
            position = %info.end,
            "Store ready"
        );

        Ok(BayesStore {
            paths,
            config,
            model,
            index: boot.index.map(Arc::new),
            binlog,
            boot: info,
            message_bytes: 0,
        })
    }

    /// Log and apply a teach command for `message`.
    pub fn teach(&mut self, kind: RecordKind, message: &Message) -> Result<(), StoreError> {
        debug_assert!(kind.is_teach());
        let record = BinlogRecord::teach(kind, unix_now(), &message.word_hashes());
        self.commit(&record)
    }

    /// Black-list a phrase. `false` if nothing is left of it after
    /// normalization.
    pub fn add_black_list(&mut self, phrase: &str) -> Result<bool, StoreError> {
        let Some(phrase) = normalize_phrase(phrase) else {
            return Ok(false);
        };
        if !self.model.black_list().contains(&phrase) {
            let record = BinlogRecord::phrase(RecordKind::BlackListAdd, unix_now(), &phrase);
            self.commit(&record)?;
        }
        Ok(true)
    }

    /// Remove a phrase from the black list. `false` if it was not listed.
    pub fn delete_black_list(&mut self, phrase: &str) -> Result<bool, StoreError> {
        let Some(phrase) = normalize_phrase(phrase) else {
            return Ok(false);
        };
        if !self.model.black_list().contains(&phrase) {
            return Ok(false);
        }
        let record = BinlogRecord::phrase(RecordKind::BlackListDelete, unix_now(), &phrase);
        self.commit(&record)?;
        Ok(true)
    }

    fn commit(&mut self, record: &BinlogRecord) -> Result<(), StoreError> {
        let binlog = self.binlog.as_mut().ok_or(StoreError::ReadOnly)?;
        binlog.append(record)?;
        self.model.apply(record)?;
        Ok(())
    }

    /// Classify `message`, or name a bucket to load first.
    pub fn classify(&mut self, message: &Message) -> Verdict {
        self.model.classify(message)
    }

    /// Install a bucket read from the index.
    pub fn install_bucket(&mut self, bucket: u32, blob: &[u8]) -> Result<(), StoreError> {
        self.model.install_bucket(bucket, blob)?;
        Ok(())
    }

    /// Account for a message buffer of `bytes`; `false` if it would break
    /// the memory ceiling.
    pub fn reserve_message(&mut self, bytes: usize) -> bool {
        if self.memory_used().saturating_add(bytes) > self.config.memory_limit {
            return false;
        }
        self.message_bytes += bytes;
        true
    }

    /// Return a message buffer's bytes.
    pub fn release_message(&mut self, bytes: usize) {
        self.message_bytes = self.message_bytes.saturating_sub(bytes);
    }

    /// Drop idle buckets until the store fits its ceiling.
    pub fn evict_idle(&mut self) -> usize {
        let budget = self.config.memory_limit.saturating_sub(self.message_bytes);
        self.model.evict_idle(budget)
    }

    /// Write buffered binlog records to the OS.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        if let Some(binlog) = &mut self.binlog {
            binlog.flush()?;
        }
        Ok(())
    }

    /// Make every appended record durable.
    pub fn sync(&mut self) -> Result<(), StoreError> {
        if let Some(binlog) = &mut self.binlog {
            binlog.sync()?;
        }
        Ok(())
    }

    /// Write an index of the current state at the current log position.
    ///
    /// The binlog is synced first so the index never points past the
    /// durable log.
    pub fn write_index(&mut self) -> Result<IndexInfo, StoreError> {
        self.sync()?;
        let position = self.position();

        let index = self.index.clone();
        let buckets = self.model.snapshot_buckets(|bucket| match &index {
            Some(index) => index.read_bucket(bucket).map_err(StoreError::from),
            None => Err(StoreError::Model(ModelError::NoSuchBucket(bucket))),
        })?;
        let (spam_messages, ham_messages) = self.model.net_totals();

        let snapshot = IndexSnapshot {
            replica_id: self.boot.replica_id,
            position,
            spam_messages,
            ham_messages,
            black_list: self.model.black_list().encode(),
            buckets,
        };
        let written = IndexWriter::new(self.paths.clone())?.write(&snapshot)?;
        info!(
            target: "bayes::store",
            path = %written.path.display(),
            position = %written.position,
            size = written.size,
            "Index written"
        );
        Ok(written)
    }

    /// Current end of committed history (including buffered records).
    pub fn position(&self) -> LogPosition {
        match &self.binlog {
            Some(binlog) => binlog.position(),
            None => self.boot.end,
        }
    }

    /// Dynamic memory in use: model plus message buffers.
    pub fn memory_used(&self) -> usize {
        self.model.memory_bytes() + self.message_bytes
    }

    /// Memory ceiling in bytes.
    pub fn memory_limit(&self) -> usize {
        self.config.memory_limit
    }

    /// Bytes held by message buffers.
    pub fn message_bytes(&self) -> usize {
        self.message_bytes
    }

    /// The model.
    pub fn model(&self) -> &BayesModel {
        &self.model
    }

    /// Index buckets are read from, if any.
    pub fn index(&self) -> Option<&Arc<IndexFile>> {
        self.index.as_ref()
    }

    /// Binlog writer, `None` when read-only.
    pub fn binlog(&self) -> Option<&BinlogWriter> {
        self.binlog.as_ref()
    }

    /// Bootstrap report.
    pub fn boot(&self) -> &BootInfo {
        &self.boot
    }

    /// Replica layout.
    pub fn paths(&self) -> &ReplicaPaths {
        &self.paths
    }

    /// Flush and sync before the process exits.
    pub fn shutdown(&mut self) -> Result<(), StoreError> {
        self.sync()?;
        debug!(target: "bayes::store", position = %self.position(), "Store closed");
        Ok(())
    }
}

/// Store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Configuration invalid
    #[error("invalid configuration: {0}")]
    Config(#[from] EngineConfigError),

    /// Bootstrap failed
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    /// Binlog append or sync failed
    #[error("binlog: {0}")]
    Binlog(#[from] BinlogError),

    /// Index read failed
    #[error("index: {0}")]
    Index(#[from] IndexError),

    /// Model rejected data
    #[error(transparent)]
    Model(#[from] ModelError),

    /// I/O error writing an index
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Mutation on a read-only store
    #[error("store is read-only")]
    ReadOnly,
}

impl StoreError {
    /// Whether bootstrap failed truncating a damaged tail.
    pub fn is_truncate_failure(&self) -> bool {
        matches!(self, StoreError::Bootstrap(e) if e.is_truncate_failure())
    }
}
