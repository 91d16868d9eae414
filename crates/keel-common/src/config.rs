//! Database configuration.

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_LOCK_TIMEOUT_NANOS, DEFAULT_MAX_CACHED_NODES, DEFAULT_PAGE_SIZE, DEFAULT_SEGMENT_SIZE,
    MAX_PAGE_SIZE, MIN_CACHED_NODES, MIN_PAGE_SIZE,
};
use crate::error::{KeelError, KeelResult};

/// Durability mode for commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurabilityMode {
    /// Sync data and the header to disk on every commit.
    Sync,
    /// Let the OS flush in its own time. Commits are not crash-durable.
    NoSync,
}

/// Configuration for a KeelDB database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// Page size in bytes. Must be a power of two in `[512, 65536]` and a
    /// multiple of the filesystem block size.
    pub page_size: usize,
    /// Maximum number of tree nodes kept in the cache.
    pub max_cached_nodes: usize,
    /// Default lock wait timeout in nanoseconds. `-1` means no wait,
    /// `i64::MAX` means wait forever.
    pub lock_timeout_nanos: i64,
    /// Durability mode for commits.
    pub durability: DurabilityMode,
    /// Term-log segment capacity in bytes.
    pub segment_size: usize,
    /// Read the cache-priming set on open. Off by default; the priming
    /// order is a configuration hook, not a guessed behavior.
    pub prime_cache_on_open: bool,
    /// Maintain per-tree stored entry counts. Off by default.
    pub maintain_stored_counts: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_cached_nodes: DEFAULT_MAX_CACHED_NODES,
            lock_timeout_nanos: DEFAULT_LOCK_TIMEOUT_NANOS,
            durability: DurabilityMode::Sync,
            segment_size: DEFAULT_SEGMENT_SIZE,
            prime_cache_on_open: false,
            maintain_stored_counts: false,
        }
    }
}

impl DbConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> KeelResult<()> {
        if self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
            || !self.page_size.is_power_of_two()
        {
            return Err(KeelError::invalid_argument(format!(
                "page size must be a power of two in [{}, {}], got {}",
                MIN_PAGE_SIZE, MAX_PAGE_SIZE, self.page_size
            )));
        }
        if self.max_cached_nodes < MIN_CACHED_NODES {
            return Err(KeelError::invalid_argument(format!(
                "node cache must hold at least {} nodes, got {}",
                MIN_CACHED_NODES, self.max_cached_nodes
            )));
        }
        if self.segment_size == 0 {
            return Err(KeelError::invalid_argument("segment size must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(DbConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_page_size() {
        let mut config = DbConfig::default();
        config.page_size = 3000;
        assert!(config.validate().is_err());

        config.page_size = 256;
        assert!(config.validate().is_err());

        config.page_size = 131072;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_tiny_cache() {
        let mut config = DbConfig::default();
        config.max_cached_nodes = 4;
        assert!(config.validate().is_err());
    }
}
