//! Size limits for keys, values and log records
//!
//! These limits are enforced by protocol dispatch before any buffer is
//! allocated and by the binlog reader when it decides whether a length
//! prefix is plausible.

use thiserror::Error;

/// Largest value payload accepted on the wire, in bytes (1 MiB).
///
/// A declared payload of `size` is accepted only if `size + 1 < MAX_VALUE_LEN`.
pub const MAX_VALUE_LEN: usize = 1 << 20;

/// Largest key accepted on the wire, in bytes.
pub const MAX_KEY_LEN: usize = 250;

/// Largest binlog record body (everything after the length prefix).
pub const MAX_RECORD_LEN: usize = 4 * MAX_VALUE_LEN;

/// Size limits enforced by the engine.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum key length in bytes (default: 250)
    pub max_key_len: usize,

    /// Maximum value payload in bytes (default: 1 MiB, exclusive of the terminator)
    pub max_value_len: usize,

    /// Maximum black list phrase length in bytes (default: `MAX_VALUE_LEN`,
    /// so any payload the protocol accepts is a valid phrase)
    pub max_phrase_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_key_len: MAX_KEY_LEN,
            max_value_len: MAX_VALUE_LEN,
            max_phrase_len: MAX_VALUE_LEN,
        }
    }
}

impl Limits {
    /// Create limits with small values for testing
    pub fn with_small_limits() -> Self {
        Limits {
            max_key_len: 64,
            max_value_len: 256,
            max_phrase_len: 32,
        }
    }

    /// Validate a key length
    pub fn validate_key(&self, key: &[u8]) -> Result<(), LimitError> {
        if key.len() > self.max_key_len {
            return Err(LimitError::KeyTooLong {
                actual: key.len(),
                max: self.max_key_len,
            });
        }
        Ok(())
    }

    /// Validate a declared payload size
    ///
    /// The payload plus its terminator must fit strictly below the limit.
    pub fn validate_value_len(&self, size: usize) -> Result<(), LimitError> {
        if size.saturating_add(1) >= self.max_value_len {
            return Err(LimitError::ValueTooLarge {
                actual: size,
                max: self.max_value_len,
            });
        }
        Ok(())
    }

    /// Validate a black list phrase length
    pub fn validate_phrase(&self, phrase: &str) -> Result<(), LimitError> {
        if phrase.len() > self.max_phrase_len {
            return Err(LimitError::PhraseTooLong {
                actual: phrase.len(),
                max: self.max_phrase_len,
            });
        }
        Ok(())
    }
}

/// Limit violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimitError {
    /// Key exceeds maximum length
    #[error("key too long: {actual} bytes (max {max})")]
    KeyTooLong {
        /// Actual length
        actual: usize,
        /// Maximum allowed
        max: usize,
    },

    /// Declared value size reaches the maximum
    #[error("value too large: {actual} bytes (max {max})")]
    ValueTooLarge {
        /// Declared length
        actual: usize,
        /// Maximum allowed
        max: usize,
    },

    /// Black list phrase exceeds maximum length
    #[error("phrase too long: {actual} bytes (max {max})")]
    PhraseTooLong {
        /// Actual length
        actual: usize,
        /// Maximum allowed
        max: usize,
    },
}
