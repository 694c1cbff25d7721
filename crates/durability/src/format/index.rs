//! Index (snapshot) file format.
//!
//! # File Layout
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ Header (80 bytes)                    │
//! ├──────────────────────────────────────┤
//! │ Bucket directory (16 bytes × N)      │
//! ├──────────────────────────────────────┤
//! │ Black list (newline separated UTF-8) │
//! ├──────────────────────────────────────┤
//! │ Bucket blobs                         │
//! └──────────────────────────────────────┘
//! ```
//!
//! # Header Layout
//!
//! ```text
//! 0..4    magic "BYSI"
//! 4..8    format version
//! 8..24   replica UUID
//! 24..32  checkpoint log offset
//! 32..40  checkpoint log timestamp
//! 40..44  checkpoint chain CRC
//! 44..48  bucket count N
//! 48..56  net spam message count (signed)
//! 56..64  net ham message count (signed)
//! 64..68  black list length
//! 68..72  CRC32 of directory + black list
//! 72..76  reserved (zero)
//! 76..80  CRC32 of bytes 0..76
//! ```
//!
//! Each directory entry is `offset u64 | len u32 | crc u32` and names the
//! absolute file offset of one bucket blob. Buckets are read lazily, so their
//! CRCs are checked when they are loaded rather than at open.

use std::io::{Cursor, Read, Write};

use bayes_core::LogPosition;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

/// Magic bytes for index header
pub const INDEX_MAGIC: [u8; 4] = *b"BYSI";

/// Current index format version
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// Index header size in bytes
pub const INDEX_HEADER_SIZE: usize = 80;

/// Directory entry size in bytes
pub const DIR_ENTRY_SIZE: usize = 16;

/// Upper bound on the bucket count accepted from disk.
pub const MAX_BUCKETS: u32 = 1 << 20;

/// Index file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    /// Replica UUID
    pub replica_id: [u8; 16],
    /// Log position the index checkpoints
    pub position: LogPosition,
    /// Number of buckets
    pub bucket_count: u32,
    /// Net spam teach count; negative when more were unlearned
    pub spam_messages: i64,
    /// Net ham teach count
    pub ham_messages: i64,
    /// Black list section length
    pub black_list_len: u32,
    /// CRC32 of directory + black list
    pub meta_crc: u32,
}

impl IndexHeader {
    /// Serialize header to bytes.
    pub fn to_bytes(&self) -> [u8; INDEX_HEADER_SIZE] {
        let mut bytes = [0u8; INDEX_HEADER_SIZE];
        {
            let mut w = Cursor::new(&mut bytes[..]);
            // writes into a fixed array cannot fail
            let _ = self.write_fields(&mut w);
        }
        let crc = crc32fast::hash(&bytes[0..76]);
        bytes[76..80].copy_from_slice(&crc.to_le_bytes());
        bytes
    }

    fn write_fields<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(&INDEX_MAGIC)?;
        w.write_u32::<LittleEndian>(INDEX_FORMAT_VERSION)?;
        w.write_all(&self.replica_id)?;
        w.write_u64::<LittleEndian>(self.position.offset)?;
        w.write_i64::<LittleEndian>(self.position.timestamp)?;
        w.write_u32::<LittleEndian>(self.position.crc32)?;
        w.write_u32::<LittleEndian>(self.bucket_count)?;
        w.write_i64::<LittleEndian>(self.spam_messages)?;
        w.write_i64::<LittleEndian>(self.ham_messages)?;
        w.write_u32::<LittleEndian>(self.black_list_len)?;
        w.write_u32::<LittleEndian>(self.meta_crc)?;
        w.write_u32::<LittleEndian>(0)?;
        Ok(())
    }

    /// Deserialize and validate a header.
    pub fn from_bytes(bytes: &[u8; INDEX_HEADER_SIZE]) -> Result<Self, IndexFormatError> {
        let stored = LittleEndian::read_u32(&bytes[76..80]);
        if crc32fast::hash(&bytes[0..76]) != stored {
            return Err(IndexFormatError::HeaderChecksumMismatch);
        }

        let mut r = Cursor::new(&bytes[..]);
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if magic != INDEX_MAGIC {
            return Err(IndexFormatError::InvalidMagic);
        }
        let version = r.read_u32::<LittleEndian>()?;
        if version != INDEX_FORMAT_VERSION {
            return Err(IndexFormatError::UnsupportedVersion(version));
        }

        let mut replica_id = [0u8; 16];
        r.read_exact(&mut replica_id)?;
        let offset = r.read_u64::<LittleEndian>()?;
        let timestamp = r.read_i64::<LittleEndian>()?;
        let crc32 = r.read_u32::<LittleEndian>()?;
        let bucket_count = r.read_u32::<LittleEndian>()?;
        if bucket_count == 0 || bucket_count > MAX_BUCKETS {
            return Err(IndexFormatError::InvalidBucketCount(bucket_count));
        }

        Ok(IndexHeader {
            replica_id,
            position: LogPosition::new(offset, timestamp, crc32),
            bucket_count,
            spam_messages: r.read_i64::<LittleEndian>()?,
            ham_messages: r.read_i64::<LittleEndian>()?,
            black_list_len: r.read_u32::<LittleEndian>()?,
            meta_crc: r.read_u32::<LittleEndian>()?,
        })
    }

    /// File offset where bucket blobs may begin.
    pub fn data_start(&self) -> u64 {
        INDEX_HEADER_SIZE as u64
            + self.bucket_count as u64 * DIR_ENTRY_SIZE as u64
            + self.black_list_len as u64
    }
}

/// Location and checksum of one bucket blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirEntry {
    /// Absolute file offset
    pub offset: u64,
    /// Blob length
    pub len: u32,
    /// CRC32 of the blob
    pub crc: u32,
}

impl DirEntry {
    /// Append the entry to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        // Vec writes are infallible
        let _ = out.write_u64::<LittleEndian>(self.offset);
        let _ = out.write_u32::<LittleEndian>(self.len);
        let _ = out.write_u32::<LittleEndian>(self.crc);
    }

    /// Decode a directory of `count` entries.
    pub fn decode_all(bytes: &[u8], count: usize) -> Result<Vec<DirEntry>, IndexFormatError> {
        let mut r = Cursor::new(bytes);
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(DirEntry {
                offset: r.read_u64::<LittleEndian>()?,
                len: r.read_u32::<LittleEndian>()?,
                crc: r.read_u32::<LittleEndian>()?,
            });
        }
        Ok(entries)
    }

    /// End offset of the blob.
    pub fn end(&self) -> u64 {
        self.offset + self.len as u64
    }
}

/// Index format errors.
#[derive(Debug, thiserror::Error)]
pub enum IndexFormatError {
    /// Header CRC does not match
    #[error("index header checksum mismatch")]
    HeaderChecksumMismatch,
    /// Not an index file
    #[error("invalid index magic bytes")]
    InvalidMagic,
    /// Written by an incompatible build
    #[error("unsupported index format version {0}")]
    UnsupportedVersion(u32),
    /// Bucket count out of range
    #[error("invalid bucket count {0}")]
    InvalidBucketCount(u32),
    /// Short read while decoding
    #[error("truncated index structure: {0}")]
    Truncated(#[from] std::io::Error),
}
