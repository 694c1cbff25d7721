//! Crash-safe index writer
//!
//! Uses the write-fsync-rename pattern:
//! 1. Write to a temporary file (`.<name>.tmp`) in the replica directory
//! 2. fsync the temporary file
//! 3. Atomic rename to `<prefix>.<offset>.idx`
//! 4. fsync the directory
//!
//! A crash leaves either the complete index or none at all.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use bayes_core::LogPosition;
use tracing::info;

use crate::format::{DirEntry, IndexHeader, DIR_ENTRY_SIZE, INDEX_HEADER_SIZE};
use crate::replica::ReplicaPaths;

/// Everything an index stores.
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    /// Replica UUID
    pub replica_id: [u8; 16],
    /// Log position the state corresponds to
    pub position: LogPosition,
    /// Net spam teach count
    pub spam_messages: i64,
    /// Net ham teach count
    pub ham_messages: i64,
    /// Encoded black list
    pub black_list: Vec<u8>,
    /// Encoded buckets, one per bucket number
    pub buckets: Vec<Vec<u8>>,
}

/// Result of a successful index write.
#[derive(Debug, Clone)]
pub struct IndexInfo {
    /// Final path
    pub path: PathBuf,
    /// Log position checkpointed
    pub position: LogPosition,
    /// File size
    pub size: u64,
}

/// Index writer with crash-safe semantics.
pub struct IndexWriter {
    paths: ReplicaPaths,
}

impl IndexWriter {
    /// Create a writer for a replica, creating its directory if needed.
    pub fn new(paths: ReplicaPaths) -> io::Result<Self> {
        std::fs::create_dir_all(paths.dir())?;
        Ok(IndexWriter { paths })
    }

    /// Write an index at `snapshot.position`.
    pub fn write(&self, snapshot: &IndexSnapshot) -> io::Result<IndexInfo> {
        if snapshot.buckets.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "index needs at least one bucket",
            ));
        }

        let final_path = self.paths.index_path(snapshot.position.offset);
        let file_name = final_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("index");
        let temp_path = self.paths.dir().join(format!(".{}.tmp", file_name));

        // a leftover from a crashed attempt is never valid
        if temp_path.exists() {
            std::fs::remove_file(&temp_path)?;
        }

        let bucket_count = snapshot.buckets.len();
        let data_start = INDEX_HEADER_SIZE as u64
            + (bucket_count * DIR_ENTRY_SIZE) as u64
            + snapshot.black_list.len() as u64;

        let mut meta = Vec::with_capacity(bucket_count * DIR_ENTRY_SIZE + snapshot.black_list.len());
        let mut offset = data_start;
        for blob in &snapshot.buckets {
            let entry = DirEntry {
                offset,
                len: blob.len() as u32,
                crc: crc32fast::hash(blob),
            };
            entry.encode_into(&mut meta);
            offset = entry.end();
        }
        meta.extend_from_slice(&snapshot.black_list);

        let header = IndexHeader {
            replica_id: snapshot.replica_id,
            position: snapshot.position,
            bucket_count: bucket_count as u32,
            spam_messages: snapshot.spam_messages,
            ham_messages: snapshot.ham_messages,
            black_list_len: snapshot.black_list.len() as u32,
            meta_crc: crc32fast::hash(&meta),
        };

        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)?;
        let mut out = BufWriter::new(file);
        out.write_all(&header.to_bytes())?;
        out.write_all(&meta)?;
        for blob in &snapshot.buckets {
            out.write_all(blob)?;
        }
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&temp_path, &final_path)?;
        File::open(self.paths.dir())?.sync_all()?;

        info!(
            target: "bayes::index",
            path = %final_path.display(),
            position = %snapshot.position,
            buckets = bucket_count,
            size = offset,
            "Wrote index"
        );

        Ok(IndexInfo {
            path: final_path,
            position: snapshot.position,
            size: offset,
        })
    }
}
