//! System-wide constants for KeelDB.

// =============================================================================
// Page Constants
// =============================================================================

/// Default page size in bytes (4 KB).
///
/// Matches the common filesystem block size.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Minimum page size in bytes.
pub const MIN_PAGE_SIZE: usize = 512;

/// Maximum page size in bytes (64 KB).
///
/// Node search vectors address entries with 2-byte offsets, which caps
/// tree pages at 64 KiB.
pub const MAX_PAGE_SIZE: usize = 65536;

/// Size of a database header image. The header is replicated
/// `page_size / HEADER_SIZE` times within its page.
pub const HEADER_SIZE: usize = 512;

/// Size of the page-manager state embedded in each database header.
pub const MANAGER_HEADER_SIZE: usize = 96;

/// Size of the opaque "extra" commit data block in each database header.
pub const EXTRA_COMMIT_DATA_SIZE: usize = 256;

// =============================================================================
// Tree Constants
// =============================================================================

/// Size of the node page header.
pub const NODE_HEADER_SIZE: usize = 20;

/// Size of one search-vector slot (a little-endian u16 entry offset).
pub const SEARCH_VECTOR_SLOT_SIZE: usize = 2;

/// Default maximum number of cached tree nodes.
pub const DEFAULT_MAX_CACHED_NODES: usize = 10_000;

/// Minimum number of cached tree nodes. The cache must be able to hold a
/// full root-to-leaf path plus siblings mid-split.
pub const MIN_CACHED_NODES: usize = 32;

// =============================================================================
// Lock Constants
// =============================================================================

/// Default lock timeout in nanoseconds (1 second).
pub const DEFAULT_LOCK_TIMEOUT_NANOS: i64 = 1_000_000_000;

/// Number of lock-table stripes. Power of two.
pub const LOCK_STRIPES: usize = 64;

// =============================================================================
// Term Log Constants
// =============================================================================

/// Default term-log segment capacity in bytes (1 MB).
pub const DEFAULT_SEGMENT_SIZE: usize = 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_bounds() {
        assert!(MIN_PAGE_SIZE.is_power_of_two());
        assert!(MAX_PAGE_SIZE.is_power_of_two());
        assert!(DEFAULT_PAGE_SIZE >= MIN_PAGE_SIZE && DEFAULT_PAGE_SIZE <= MAX_PAGE_SIZE);
        assert_eq!(DEFAULT_PAGE_SIZE % HEADER_SIZE, 0);
    }

    #[test]
    fn test_lock_stripes_power_of_two() {
        assert!(LOCK_STRIPES.is_power_of_two());
    }
}
