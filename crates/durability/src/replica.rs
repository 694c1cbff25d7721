//! Replica file layout
//!
//! A replica is every index and binlog file sharing one path prefix:
//!
//! ```text
//! data/
//! ├── bayes.00000000000000000000.bin   # binlog segment starting at offset 0
//! ├── bayes.00000000000001048576.bin   # next segment after rotation
//! ├── bayes.00000000000000524288.idx   # index checkpointed at offset 524288
//! └── ...
//! ```
//!
//! The numeric field is zero-padded so lexical and numeric order agree.

use std::path::{Path, PathBuf};

const SEGMENT_EXT: &str = "bin";
const INDEX_EXT: &str = "idx";

/// A file of the replica, identified by the log offset in its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaFile {
    /// Full path
    pub path: PathBuf,
    /// Log offset encoded in the file name
    pub offset: u64,
    /// Size on disk when listed
    pub size: u64,
}

/// Paths of one replica.
#[derive(Debug, Clone)]
pub struct ReplicaPaths {
    /// Directory holding the files
    dir: PathBuf,
    /// File name stem shared by every file
    stem: String,
    /// Index given explicitly on the command line, if any
    explicit_index: Option<PathBuf>,
}

impl ReplicaPaths {
    /// Paths for a prefix such as `data/bayes`.
    pub fn from_prefix(prefix: impl AsRef<Path>) -> Result<Self, ReplicaPathError> {
        let prefix = prefix.as_ref();
        let stem = prefix
            .file_name()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ReplicaPathError::InvalidPrefix {
                path: prefix.to_path_buf(),
            })?
            .to_string();

        let dir = match prefix.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        Ok(ReplicaPaths {
            dir,
            stem,
            explicit_index: None,
        })
    }

    /// Paths for a command line argument.
    ///
    /// The argument is either a prefix or an explicit index file
    /// `<prefix>.<offset>.idx`, in which case that index is used for
    /// bootstrap instead of the most recent one.
    pub fn from_arg(arg: impl AsRef<Path>) -> Result<Self, ReplicaPathError> {
        let arg = arg.as_ref();
        if let Some(name) = arg.file_name().and_then(|s| s.to_str()) {
            if let Some((stem, _)) = split_name(name, INDEX_EXT) {
                let prefix = arg.with_file_name(stem);
                let mut paths = Self::from_prefix(prefix)?;
                paths.explicit_index = Some(arg.to_path_buf());
                return Ok(paths);
            }
        }
        Self::from_prefix(arg)
    }

    /// Directory holding the replica files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The shared file name stem.
    pub fn stem(&self) -> &str {
        &self.stem
    }

    /// Index named on the command line, if any.
    pub fn explicit_index(&self) -> Option<&Path> {
        self.explicit_index.as_deref()
    }

    /// Path of the segment starting at `offset`.
    pub fn segment_path(&self, offset: u64) -> PathBuf {
        self.dir
            .join(format!("{}.{:020}.{}", self.stem, offset, SEGMENT_EXT))
    }

    /// Path of the index checkpointed at `offset`.
    pub fn index_path(&self, offset: u64) -> PathBuf {
        self.dir
            .join(format!("{}.{:020}.{}", self.stem, offset, INDEX_EXT))
    }

    /// All segments, ordered by starting offset.
    pub fn list_segments(&self) -> std::io::Result<Vec<ReplicaFile>> {
        self.list(SEGMENT_EXT)
    }

    /// All indexes, ordered by checkpoint offset.
    pub fn list_indexes(&self) -> std::io::Result<Vec<ReplicaFile>> {
        self.list(INDEX_EXT)
    }

    /// The index bootstrap should load: the explicit one, else the most recent.
    pub fn bootstrap_index(&self) -> std::io::Result<Option<PathBuf>> {
        if let Some(explicit) = &self.explicit_index {
            return Ok(Some(explicit.clone()));
        }
        Ok(self.list_indexes()?.pop().map(|f| f.path))
    }

    fn list(&self, ext: &str) -> std::io::Result<Vec<ReplicaFile>> {
        let mut files = Vec::new();
        if !self.dir.exists() {
            return Ok(files);
        }

        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some((stem, offset)) = split_name(name, ext) else {
                continue;
            };
            if stem != self.stem {
                continue;
            }
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            files.push(ReplicaFile {
                path: entry.path(),
                offset,
                size: metadata.len(),
            });
        }

        files.sort_by_key(|f| f.offset);
        Ok(files)
    }
}

/// Split `<stem>.<20 digits>.<ext>` into stem and offset.
fn split_name<'a>(name: &'a str, ext: &str) -> Option<(&'a str, u64)> {
    let rest = name.strip_suffix(ext)?.strip_suffix('.')?;
    let (stem, digits) = rest.rsplit_once('.')?;
    if stem.is_empty() || digits.len() != 20 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((stem, digits.parse().ok()?))
}

/// Replica path errors
#[derive(Debug, thiserror::Error)]
pub enum ReplicaPathError {
    /// Prefix has no usable file name
    #[error("Invalid replica prefix {path}")]
    InvalidPrefix {
        /// Rejected path
        path: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_names() {
        let paths = ReplicaPaths::from_prefix("/data/bayes").unwrap();
        assert_eq!(
            paths.segment_path(0),
            PathBuf::from("/data/bayes.00000000000000000000.bin")
        );
        assert_eq!(
            paths.index_path(1234),
            PathBuf::from("/data/bayes.00000000000000001234.idx")
        );
    }

    #[test]
    fn test_bare_prefix_uses_current_dir() {
        let paths = ReplicaPaths::from_prefix("bayes").unwrap();
        assert_eq!(paths.dir(), Path::new("."));
        assert_eq!(paths.stem(), "bayes");
    }

    #[test]
    fn test_explicit_index_argument() {
        let paths = ReplicaPaths::from_arg("/data/bayes.00000000000000000777.idx").unwrap();
        assert_eq!(paths.stem(), "bayes");
        assert_eq!(paths.dir(), Path::new("/data"));
        assert_eq!(
            paths.explicit_index(),
            Some(Path::new("/data/bayes.00000000000000000777.idx"))
        );
    }

    #[test]
    fn test_split_name() {
        assert_eq!(
            split_name("a.b.00000000000000000010.bin", "bin"),
            Some(("a.b", 10))
        );
        assert_eq!(split_name("bayes.10.bin", "bin"), None);
        assert_eq!(split_name("bayes.00000000000000000010.idx", "bin"), None);
        assert_eq!(split_name(".00000000000000000010.bin", "bin"), None);
    }

    #[test]
    fn test_listing_filters_and_sorts() {
        let dir = tempdir().unwrap();
        let paths = ReplicaPaths::from_prefix(dir.path().join("bayes")).unwrap();

        std::fs::write(paths.segment_path(200), b"b").unwrap();
        std::fs::write(paths.segment_path(0), b"a").unwrap();
        std::fs::write(paths.index_path(150), b"i").unwrap();
        std::fs::write(dir.path().join("other.00000000000000000000.bin"), b"x").unwrap();
        std::fs::write(dir.path().join("bayes.tmp"), b"x").unwrap();

        let segments = paths.list_segments().unwrap();
        assert_eq!(
            segments.iter().map(|s| s.offset).collect::<Vec<_>>(),
            vec![0, 200]
        );
        assert_eq!(
            paths.bootstrap_index().unwrap(),
            Some(paths.index_path(150))
        );
    }

    #[test]
    fn test_missing_dir_lists_nothing() {
        let paths = ReplicaPaths::from_prefix("/nonexistent/dir/bayes").unwrap();
        assert!(paths.list_segments().unwrap().is_empty());
        assert_eq!(paths.bootstrap_index().unwrap(), None);
    }
}
