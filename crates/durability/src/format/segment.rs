//! Binlog segment format.
//!
//! # Segment Layout
//!
//! ```text
//! ┌────────────────────────────┐
//! │ Header (48 bytes)          │
//! ├────────────────────────────┤
//! │ Record 1                   │
//! ├────────────────────────────┤
//! │ ...                        │
//! └────────────────────────────┘
//! ```
//!
//! # Header Layout
//!
//! ```text
//! 0..4    magic "BYSB"
//! 4..8    format version
//! 8..24   replica UUID
//! 24..32  starting log offset
//! 32..40  starting log timestamp
//! 40..44  starting chain CRC
//! 44..48  CRC32 of bytes 0..44
//! ```
//!
//! Segment headers are not part of the logical log: a segment starting at
//! logical offset `s` stores the byte at logical offset `p` at physical
//! offset `SEGMENT_HEADER_SIZE + (p - s)`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bayes_core::LogPosition;
use byteorder::{ByteOrder, LittleEndian};

/// Magic bytes for segment header
pub const SEGMENT_MAGIC: [u8; 4] = *b"BYSB";

/// Current segment format version
pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Segment header size in bytes
pub const SEGMENT_HEADER_SIZE: usize = 48;

/// Segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Magic bytes
    pub magic: [u8; 4],

    /// Format version for forward compatibility
    pub format_version: u32,

    /// Replica UUID shared by every file of the replica
    pub replica_id: [u8; 16],

    /// Log position of the first byte stored in this segment
    pub start: LogPosition,
}

impl SegmentHeader {
    /// Create a new segment header.
    pub fn new(replica_id: [u8; 16], start: LogPosition) -> Self {
        SegmentHeader {
            magic: SEGMENT_MAGIC,
            format_version: SEGMENT_FORMAT_VERSION,
            replica_id,
            start,
        }
    }

    /// Serialize header to bytes.
    pub fn to_bytes(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut bytes = [0u8; SEGMENT_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4..8].copy_from_slice(&self.format_version.to_le_bytes());
        bytes[8..24].copy_from_slice(&self.replica_id);
        bytes[24..32].copy_from_slice(&self.start.offset.to_le_bytes());
        bytes[32..40].copy_from_slice(&self.start.timestamp.to_le_bytes());
        bytes[40..44].copy_from_slice(&self.start.crc32.to_le_bytes());
        let crc = crc32fast::hash(&bytes[0..44]);
        bytes[44..48].copy_from_slice(&crc.to_le_bytes());
        bytes
    }

    /// Deserialize and validate a header.
    pub fn from_bytes(bytes: &[u8; SEGMENT_HEADER_SIZE]) -> Result<Self, SegmentHeaderError> {
        let stored = LittleEndian::read_u32(&bytes[44..48]);
        let computed = crc32fast::hash(&bytes[0..44]);
        if stored != computed {
            return Err(SegmentHeaderError::ChecksumMismatch);
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        if magic != SEGMENT_MAGIC {
            return Err(SegmentHeaderError::InvalidMagic);
        }

        let format_version = LittleEndian::read_u32(&bytes[4..8]);
        if format_version != SEGMENT_FORMAT_VERSION {
            return Err(SegmentHeaderError::UnsupportedVersion(format_version));
        }

        let mut replica_id = [0u8; 16];
        replica_id.copy_from_slice(&bytes[8..24]);

        Ok(SegmentHeader {
            magic,
            format_version,
            replica_id,
            start: LogPosition::new(
                LittleEndian::read_u64(&bytes[24..32]),
                LittleEndian::read_i64(&bytes[32..40]),
                LittleEndian::read_u32(&bytes[40..44]),
            ),
        })
    }
}

/// Segment header validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SegmentHeaderError {
    /// Header CRC does not match
    #[error("segment header checksum mismatch")]
    ChecksumMismatch,
    /// Not a binlog segment
    #[error("invalid segment magic bytes")]
    InvalidMagic,
    /// Written by an incompatible build
    #[error("unsupported segment format version {0}")]
    UnsupportedVersion(u32),
}

impl From<SegmentHeaderError> for std::io::Error {
    fn from(e: SegmentHeaderError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e)
    }
}

/// Binlog segment file handle.
///
/// Only the last segment of a replica is ever opened for appending; every
/// earlier segment is immutable.
#[derive(Debug)]
pub struct BinlogSegment {
    /// File handle
    file: File,

    /// Path to segment file
    path: PathBuf,

    /// Parsed header
    header: SegmentHeader,

    /// Physical file size (header included)
    size: u64,

    /// Whether this segment is closed (immutable)
    closed: bool,
}

impl BinlogSegment {
    /// Create a new segment and write its header.
    ///
    /// The header goes to `.<name>.tmp` first and is synced, then renamed
    /// into place and the directory synced, so a crash leaves either no
    /// segment or one with a complete header.
    pub fn create(path: &Path, replica_id: [u8; 16], start: LogPosition) -> std::io::Result<Self> {
        if path.exists() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("segment {} already exists", path.display()),
            ));
        }
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = dir.join(format!(".{}.tmp", file_name));

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .read(true)
            .open(&temp_path)?;

        let header = SegmentHeader::new(replica_id, start);
        file.write_all(&header.to_bytes())?;
        file.sync_all()?;

        std::fs::rename(&temp_path, path)?;
        File::open(dir)?.sync_all()?;

        Ok(BinlogSegment {
            file,
            path: path.to_path_buf(),
            header,
            size: SEGMENT_HEADER_SIZE as u64,
            closed: false,
        })
    }

    /// Open an existing segment for reading.
    pub fn open_read(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Self::from_file(file, path, true)
    }

    /// Open an existing segment for appending.
    pub fn open_append(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::from_file(file, path, false)
    }

    fn from_file(mut file: File, path: &Path, closed: bool) -> std::io::Result<Self> {
        let mut header_bytes = [0u8; SEGMENT_HEADER_SIZE];
        file.read_exact(&mut header_bytes)?;
        let header = SegmentHeader::from_bytes(&header_bytes)?;

        let size = file.seek(SeekFrom::End(0))?;

        Ok(BinlogSegment {
            file,
            path: path.to_path_buf(),
            header,
            size,
            closed,
        })
    }

    /// Parsed header.
    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// Log position of the first byte in this segment.
    pub fn start(&self) -> LogPosition {
        self.header.start
    }

    /// Replica UUID.
    pub fn replica_id(&self) -> [u8; 16] {
        self.header.replica_id
    }

    /// Get current segment size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Get the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logical offset just past the last byte on disk.
    pub fn logical_end(&self) -> u64 {
        self.header.start.offset + (self.size - SEGMENT_HEADER_SIZE as u64)
    }

    /// Whether a logical offset falls inside `[start, logical_end]`.
    pub fn covers(&self, offset: u64) -> bool {
        offset >= self.header.start.offset && offset <= self.logical_end()
    }

    /// Physical file offset of a logical offset inside this segment.
    pub fn physical_offset(&self, logical: u64) -> u64 {
        SEGMENT_HEADER_SIZE as u64 + (logical - self.header.start.offset)
    }

    /// Write bytes to the end of the segment.
    pub fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        if self.closed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "Cannot write to closed segment",
            ));
        }

        self.file.write_all(data)?;
        self.size += data.len() as u64;
        Ok(())
    }

    /// Sync segment data to disk.
    pub fn sync(&mut self) -> std::io::Result<()> {
        self.file.sync_data()
    }

    /// Mark segment as closed (immutable), syncing first.
    pub fn close(&mut self) -> std::io::Result<()> {
        if !self.closed {
            self.file.sync_all()?;
            self.closed = true;
        }
        Ok(())
    }

    /// Check if segment is closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Get mutable reference to file (for reading).
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// Seek to a physical position.
    pub fn seek_to(&mut self, position: u64) -> std::io::Result<u64> {
        self.file.seek(SeekFrom::Start(position))
    }
}

/// Truncate a segment file at a physical offset and make it durable.
///
/// Never cuts into the header.
pub fn truncate_segment(path: &Path, physical_offset: u64) -> std::io::Result<()> {
    if physical_offset < SEGMENT_HEADER_SIZE as u64 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!(
                "refusing to truncate {} inside its header (offset {})",
                path.display(),
                physical_offset
            ),
        ));
    }
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(physical_offset)?;
    file.sync_all()?;
    Ok(())
}
