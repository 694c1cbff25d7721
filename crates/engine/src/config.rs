//! Engine configuration.

use bayes_durability::{BinlogConfig, BinlogConfigError};

use crate::model::DEFAULT_BUCKET_COUNT;

/// Engine configuration parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Dynamic memory ceiling in bytes (default: 1GiB).
    ///
    /// Message buffers beyond it are refused and idle buckets evicted.
    pub memory_limit: usize,

    /// Buckets of a replica created without an index (default: 64).
    pub bucket_count: u32,

    /// Truncate a damaged binlog tail on bootstrap (default: true).
    pub repair: bool,

    /// Binlog parameters.
    pub binlog: BinlogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            memory_limit: 1 << 30,
            bucket_count: DEFAULT_BUCKET_COUNT,
            repair: true,
            binlog: BinlogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create an engine configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the memory ceiling in MiB (builder pattern).
    pub fn with_memory_limit_mib(mut self, mib: usize) -> Self {
        self.memory_limit = mib.saturating_mul(1 << 20);
        self
    }

    /// Set bucket count for new replicas (builder pattern).
    pub fn with_bucket_count(mut self, buckets: u32) -> Self {
        self.bucket_count = buckets;
        self
    }

    /// Enable or disable tail repair (builder pattern).
    pub fn with_repair(mut self, repair: bool) -> Self {
        self.repair = repair;
        self
    }

    /// Set binlog parameters (builder pattern).
    pub fn with_binlog(mut self, binlog: BinlogConfig) -> Self {
        self.binlog = binlog;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), EngineConfigError> {
        if self.memory_limit < (1 << 20) {
            return Err(EngineConfigError::MemoryLimitTooSmall);
        }
        if self.bucket_count == 0 || self.bucket_count > bayes_durability::format::MAX_BUCKETS {
            return Err(EngineConfigError::InvalidBucketCount(self.bucket_count));
        }
        self.binlog.validate()?;
        Ok(())
    }

    /// Create a configuration for tests: small segments, few buckets.
    pub fn for_testing() -> Self {
        EngineConfig {
            memory_limit: 16 << 20,
            bucket_count: 8,
            repair: true,
            binlog: BinlogConfig::for_testing(),
        }
    }
}

/// Engine configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineConfigError {
    /// Memory ceiling below 1MiB
    #[error("memory limit must be at least 1MiB")]
    MemoryLimitTooSmall,

    /// Bucket count out of range
    #[error("invalid bucket count {0}")]
    InvalidBucketCount(u32),

    /// Binlog parameters invalid
    #[error(transparent)]
    Binlog(#[from] BinlogConfigError),
}
