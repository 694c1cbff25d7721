//! Binlog configuration.

/// Binlog configuration parameters.
#[derive(Debug, Clone)]
pub struct BinlogConfig {
    /// Maximum segment size in bytes (default: 1GB).
    ///
    /// Once the active segment reaches this size the writer closes it and
    /// starts a new one at the current log position.
    pub max_segment_size: u64,

    /// Buffered bytes that force a write before the next cron flush
    /// (default: 256KB).
    pub flush_threshold: usize,

    /// Verify record chain CRCs on replay (default: true).
    ///
    /// Disabled by `-D`. Framing is still validated.
    pub verify_checksums: bool,
}

impl Default for BinlogConfig {
    fn default() -> Self {
        BinlogConfig {
            max_segment_size: 1 << 30,
            flush_threshold: 256 * 1024,
            verify_checksums: true,
        }
    }
}

impl BinlogConfig {
    /// Create a new binlog configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum segment size (builder pattern).
    pub fn with_max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size = size;
        self
    }

    /// Set flush threshold (builder pattern).
    pub fn with_flush_threshold(mut self, bytes: usize) -> Self {
        self.flush_threshold = bytes;
        self
    }

    /// Enable or disable chain CRC verification (builder pattern).
    pub fn with_verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), BinlogConfigError> {
        if self.max_segment_size < 1024 {
            return Err(BinlogConfigError::SegmentSizeTooSmall);
        }
        if self.flush_threshold as u64 > self.max_segment_size {
            return Err(BinlogConfigError::FlushThresholdExceedsSegment);
        }
        Ok(())
    }

    /// Create a configuration optimized for testing (small segments).
    pub fn for_testing() -> Self {
        BinlogConfig {
            max_segment_size: 4 * 1024,
            flush_threshold: 1024,
            verify_checksums: true,
        }
    }
}

/// Binlog configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BinlogConfigError {
    /// Segment size is too small (minimum 1KB).
    #[error("Binlog segment size must be at least 1KB")]
    SegmentSizeTooSmall,

    /// Flush threshold exceeds segment size.
    #[error("Flush threshold cannot exceed segment size")]
    FlushThresholdExceedsSegment,
}
