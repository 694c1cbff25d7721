//! Index reader
//!
//! Opening an index validates everything except the bucket blobs: header,
//! directory and black list (via the meta CRC), and that every blob lies
//! inside the file. Blobs are fetched on demand with positional reads, so
//! one open handle can serve a background reader thread while the event
//! loop holds it too.

use std::fs::File;
use std::io::{BufReader, Read};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::format::{
    DirEntry, IndexFormatError, IndexHeader, DIR_ENTRY_SIZE, INDEX_HEADER_SIZE,
};

/// An open, validated index file.
#[derive(Debug)]
pub struct IndexFile {
    path: PathBuf,
    file: File,
    file_size: u64,
    header: IndexHeader,
    directory: Vec<DirEntry>,
    black_list: Vec<u8>,
}

impl IndexFile {
    /// Open and validate an index.
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();

        if file_size < INDEX_HEADER_SIZE as u64 {
            return Err(IndexError::FileTooSmall { size: file_size });
        }

        let mut reader = BufReader::new(&file);
        let mut header_bytes = [0u8; INDEX_HEADER_SIZE];
        reader.read_exact(&mut header_bytes)?;
        let header = IndexHeader::from_bytes(&header_bytes)?;

        let meta_len = header.bucket_count as u64 * DIR_ENTRY_SIZE as u64
            + header.black_list_len as u64;
        if INDEX_HEADER_SIZE as u64 + meta_len > file_size {
            return Err(IndexError::FileTooSmall { size: file_size });
        }

        let mut meta = vec![0u8; meta_len as usize];
        reader.read_exact(&mut meta)?;
        drop(reader);

        let computed = crc32fast::hash(&meta);
        if computed != header.meta_crc {
            return Err(IndexError::MetaChecksumMismatch {
                expected: header.meta_crc,
                computed,
            });
        }

        let dir_len = header.bucket_count as usize * DIR_ENTRY_SIZE;
        let directory = DirEntry::decode_all(&meta[..dir_len], header.bucket_count as usize)?;
        let black_list = meta[dir_len..].to_vec();

        let data_start = header.data_start();
        for (bucket, entry) in directory.iter().enumerate() {
            if entry.offset < data_start || entry.end() > file_size {
                return Err(IndexError::BucketOutOfBounds {
                    bucket: bucket as u32,
                    offset: entry.offset,
                    len: entry.len,
                    file_size,
                });
            }
        }

        Ok(IndexFile {
            path: path.to_path_buf(),
            file,
            file_size,
            header,
            directory,
            black_list,
        })
    }

    /// Read and verify one bucket blob.
    pub fn read_bucket(&self, bucket: u32) -> Result<Vec<u8>, IndexError> {
        let entry = self
            .directory
            .get(bucket as usize)
            .ok_or(IndexError::NoSuchBucket {
                bucket,
                count: self.header.bucket_count,
            })?;

        let mut blob = vec![0u8; entry.len as usize];
        self.file.read_exact_at(&mut blob, entry.offset)?;

        let computed = crc32fast::hash(&blob);
        if computed != entry.crc {
            return Err(IndexError::BucketChecksumMismatch {
                bucket,
                expected: entry.crc,
                computed,
            });
        }
        Ok(blob)
    }

    /// Parsed header.
    pub fn header(&self) -> &IndexHeader {
        &self.header
    }

    /// Bucket directory.
    pub fn directory(&self) -> &[DirEntry] {
        &self.directory
    }

    /// Raw black list section.
    pub fn black_list(&self) -> &[u8] {
        &self.black_list
    }

    /// Index path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Index file size.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Bytes of header, directory and black list held in memory.
    pub fn loaded_bytes(&self) -> u64 {
        self.header.data_start()
    }
}

/// Index read errors
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Header or directory malformed
    #[error("{0}")]
    Format(#[from] IndexFormatError),

    /// File shorter than its own header claims
    #[error("Index file too small: {size} bytes")]
    FileTooSmall {
        /// File size
        size: u64,
    },

    /// Directory or black list corrupted
    #[error("Index meta checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    MetaChecksumMismatch {
        /// Stored CRC
        expected: u32,
        /// Computed CRC
        computed: u32,
    },

    /// A bucket blob lies outside the file
    #[error("Bucket {bucket} at {offset}+{len} outside index of {file_size} bytes")]
    BucketOutOfBounds {
        /// Bucket number
        bucket: u32,
        /// Blob offset
        offset: u64,
        /// Blob length
        len: u32,
        /// File size
        file_size: u64,
    },

    /// Bucket number out of range
    #[error("No bucket {bucket} (index has {count})")]
    NoSuchBucket {
        /// Requested bucket
        bucket: u32,
        /// Bucket count
        count: u32,
    },

    /// Bucket blob corrupted
    #[error("Bucket {bucket} checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    BucketChecksumMismatch {
        /// Bucket number
        bucket: u32,
        /// Stored CRC
        expected: u32,
        /// Computed CRC
        computed: u32,
    },
}
