//! The durable page database.
//!
//! Pages are managed copy-on-write with periodic commits. A page
//! visible to the last good commit is never overwritten until the next
//! commit has durably succeeded. Two header copies on pages 0 and 1
//! alternate as commit targets: commit *n* writes the header to page
//! `n & 1`, so a torn header write always leaves the previous commit
//! intact.
//!
//! # Header layout (512 bytes, replicated across its page)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//!   0       8   magic
//!   8      16   database id (random, assigned at creation)
//!  24       4   page size
//!  28       4   commit number
//!  32       4   CRC-32 over these 512 bytes with this field zeroed
//!  36      96   page-manager header
//! 132     124   reserved
//! 256     256   opaque extra commit data
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, warn};

use keel_common::config::DbConfig;
use keel_common::constants::{EXTRA_COMMIT_DATA_SIZE, HEADER_SIZE, MANAGER_HEADER_SIZE};
use keel_common::error::{KeelError, KeelResult};
use keel_common::sync::{CommitLock, CommitReadGuard, Latch};
use keel_common::types::PageId;

use crate::array::{FilePageArray, PageArray};
use crate::manager::PageManager;

/// Magic value identifying a KeelDB page database.
pub const DB_MAGIC: u64 = 0x314244_4C45454B; // "KEELDB1\0" little-endian

const MAGIC_OFFSET: usize = 0;
const DATABASE_ID_OFFSET: usize = 8;
const PAGE_SIZE_OFFSET: usize = 24;
const COMMIT_NUMBER_OFFSET: usize = 28;
const CHECKSUM_OFFSET: usize = 32;
const MANAGER_OFFSET: usize = 36;
const EXTRA_OFFSET: usize = 256;

/// Flushes dirty user pages before the header is committed.
///
/// Contract: when `prepare` returns, every page dirtied under the
/// commit in progress has been written to the page array. The callback
/// may return a replacement for the header's 256-byte extra block,
/// computed after the flush.
pub trait CommitCallback {
    /// Called after the free-list snapshot is staged and before the
    /// header is made durable.
    fn prepare(&self) -> KeelResult<Option<Vec<u8>>>;
}

impl<F: Fn() -> KeelResult<Option<Vec<u8>>>> CommitCallback for F {
    fn prepare(&self) -> KeelResult<Option<Vec<u8>>> {
        self()
    }
}

struct HeaderState {
    commit_number: u32,
}

/// The durable page database: copy-on-write pages plus the two-header
/// commit protocol.
pub struct PageDb {
    array: Arc<dyn PageArray>,
    manager: PageManager,
    commit_lock: CommitLock,
    header_latch: Latch<HeaderState>,
    database_id: [u8; 16],
    page_size: usize,
    extra: Latch<[u8; EXTRA_COMMIT_DATA_SIZE]>,
    closed: AtomicBool,
}

struct ParsedHeader {
    database_id: [u8; 16],
    commit_number: u32,
    manager: [u8; MANAGER_HEADER_SIZE],
    extra: [u8; EXTRA_COMMIT_DATA_SIZE],
}

enum HeaderProblem {
    Unreadable,
    PageSizeMismatch(u32),
}

impl PageDb {
    /// Opens a page database over a single backing file.
    ///
    /// An empty backing (or `destroy`) creates a fresh database: a new
    /// random id is generated and two seed commits run so both headers
    /// verify. Otherwise both headers are read and the one with the
    /// higher commit number (modulo-32 comparison) wins.
    pub fn open(path: impl AsRef<Path>, config: &DbConfig, destroy: bool) -> KeelResult<PageDb> {
        config.validate()?;
        let array: Arc<dyn PageArray> =
            Arc::new(FilePageArray::open(path, config.page_size)?);

        if destroy {
            array.set_page_count(0)?;
        }

        if array.is_empty()? {
            Self::create(array, config)
        } else {
            Self::recover(array, config)
        }
    }

    fn create(array: Arc<dyn PageArray>, config: &DbConfig) -> KeelResult<PageDb> {
        let mut database_id = [0u8; 16];
        rand::thread_rng().fill(&mut database_id[..]);

        let db = PageDb {
            manager: PageManager::new(Arc::clone(&array)),
            commit_lock: CommitLock::new(),
            // Two seed commits land on commit numbers u32::MAX and 0,
            // covering header pages 1 and 0 respectively.
            header_latch: Latch::new(HeaderState {
                commit_number: u32::MAX - 1,
            }),
            database_id,
            page_size: config.page_size,
            extra: Latch::new([0u8; EXTRA_COMMIT_DATA_SIZE]),
            array,
            closed: AtomicBool::new(false),
        };

        db.commit(None, None)?;
        db.commit(None, None)?;
        debug_assert_eq!(db.commit_number(), 0);
        debug!(database_id = ?db.database_id, "created fresh page database");
        Ok(db)
    }

    fn recover(array: Arc<dyn PageArray>, config: &DbConfig) -> KeelResult<PageDb> {
        let header0 = Self::read_header(&*array, PageId::HEADER_0, config.page_size as u32);
        let header1 = Self::read_header(&*array, PageId::HEADER_1, config.page_size as u32);

        let (winner, header) = match (header0, header1) {
            (Err(HeaderProblem::Unreadable), Err(HeaderProblem::Unreadable)) => {
                return Err(KeelError::corruption("both database headers are unreadable"));
            }
            (Err(HeaderProblem::PageSizeMismatch(actual)), _)
            | (_, Err(HeaderProblem::PageSizeMismatch(actual))) => {
                return Err(KeelError::corruption(format!(
                    "database uses page size {}, configured {}",
                    actual, config.page_size
                )));
            }
            (Ok(h), Err(HeaderProblem::Unreadable)) => {
                warn!("header 1 is unreadable; recovering from header 0");
                (0u64, h)
            }
            (Err(HeaderProblem::Unreadable), Ok(h)) => {
                warn!("header 0 is unreadable; recovering from header 1");
                (1u64, h)
            }
            (Ok(a), Ok(b)) => {
                if a.commit_number == b.commit_number {
                    return Err(KeelError::corruption(format!(
                        "both headers claim commit number {}",
                        a.commit_number
                    )));
                }
                // Modulo-32 comparison: the signed difference decides.
                if a.commit_number.wrapping_sub(b.commit_number) as i32 > 0 {
                    (0u64, a)
                } else {
                    (1u64, b)
                }
            }
        };
        debug!(
            header = winner,
            commit_number = header.commit_number,
            "recovered page database"
        );

        let manager = PageManager::reopen(Arc::clone(&array), &header.manager)?;
        Ok(PageDb {
            array,
            manager,
            commit_lock: CommitLock::new(),
            header_latch: Latch::new(HeaderState {
                commit_number: header.commit_number,
            }),
            database_id: header.database_id,
            page_size: config.page_size,
            extra: Latch::new(header.extra),
            closed: AtomicBool::new(false),
        })
    }

    fn read_header(
        array: &dyn PageArray,
        id: PageId,
        expected_page_size: u32,
    ) -> Result<ParsedHeader, HeaderProblem> {
        let mut buf = [0u8; HEADER_SIZE];
        if array.read_partial(id, 0, &mut buf).is_err() {
            return Err(HeaderProblem::Unreadable);
        }

        let magic = u64::from_le_bytes(buf[MAGIC_OFFSET..MAGIC_OFFSET + 8].try_into().unwrap());
        if magic != DB_MAGIC {
            return Err(HeaderProblem::Unreadable);
        }

        let stored = u32::from_le_bytes(
            buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].try_into().unwrap(),
        );
        let mut zeroed = buf;
        zeroed[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].fill(0);
        if crc32fast::hash(&zeroed) != stored {
            return Err(HeaderProblem::Unreadable);
        }

        let page_size = u32::from_le_bytes(
            buf[PAGE_SIZE_OFFSET..PAGE_SIZE_OFFSET + 4].try_into().unwrap(),
        );
        if page_size != expected_page_size {
            return Err(HeaderProblem::PageSizeMismatch(page_size));
        }

        let mut database_id = [0u8; 16];
        database_id.copy_from_slice(&buf[DATABASE_ID_OFFSET..DATABASE_ID_OFFSET + 16]);
        let commit_number = u32::from_le_bytes(
            buf[COMMIT_NUMBER_OFFSET..COMMIT_NUMBER_OFFSET + 4]
                .try_into()
                .unwrap(),
        );
        let mut manager = [0u8; MANAGER_HEADER_SIZE];
        manager.copy_from_slice(&buf[MANAGER_OFFSET..MANAGER_OFFSET + MANAGER_HEADER_SIZE]);
        let mut extra = [0u8; EXTRA_COMMIT_DATA_SIZE];
        extra.copy_from_slice(&buf[EXTRA_OFFSET..EXTRA_OFFSET + EXTRA_COMMIT_DATA_SIZE]);

        Ok(ParsedHeader {
            database_id,
            commit_number,
            manager,
            extra,
        })
    }

    /// Returns the 16-byte database identity, fixed at creation.
    #[must_use]
    pub fn database_id(&self) -> &[u8; 16] {
        &self.database_id
    }

    /// Returns the page size.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the current commit number.
    pub fn commit_number(&self) -> u32 {
        self.header_latch.read().commit_number
    }

    /// Returns the total page count, headers included.
    pub fn total_page_count(&self) -> u64 {
        self.manager.total_page_count()
    }

    /// Returns the 256-byte extra block recorded by the last commit.
    pub fn extra_commit_data(&self) -> [u8; EXTRA_COMMIT_DATA_SIZE] {
        *self.extra.read()
    }

    /// Returns true after [`close`](Self::close) or a fatal failure.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> KeelResult<()> {
        if self.is_closed() {
            return Err(KeelError::Closed);
        }
        Ok(())
    }

    /// Closes the database. Every subsequent call fails.
    pub fn close(&self) -> KeelResult<()> {
        self.closed.store(true, Ordering::Release);
        self.array.close()
    }

    fn fail_close<T>(&self, result: KeelResult<T>) -> KeelResult<T> {
        if result.is_err() {
            self.closed.store(true, Ordering::Release);
            let _ = self.array.close();
        }
        result
    }

    /// Acquires the read side of the commit lock, blocking any commit
    /// from reaching its quiescent point.
    pub fn commit_lock_shared(&self) -> CommitReadGuard<'_> {
        self.commit_lock.acquire_shared()
    }

    /// Allocates a page.
    pub fn alloc_page(&self) -> KeelResult<PageId> {
        self.check_open()?;
        let _guard = self.commit_lock.acquire_shared();
        let result = self.manager.alloc();
        self.fail_close(result)
    }

    /// Deletes a page: reusable only after the next commit completes.
    pub fn delete_page(&self, id: PageId) -> KeelResult<()> {
        self.check_open()?;
        let _guard = self.commit_lock.acquire_shared();
        let result = self.manager.delete(id);
        self.fail_close(result)
    }

    /// Recycles a page: immediately reusable, no rollback protection.
    pub fn recycle_page(&self, id: PageId) -> KeelResult<()> {
        self.check_open()?;
        let _guard = self.commit_lock.acquire_shared();
        let result = self.manager.recycle(id);
        self.fail_close(result)
    }

    /// Reads a full page.
    pub fn read_page(&self, id: PageId, buf: &mut [u8]) -> KeelResult<()> {
        self.check_open()?;
        let result = self.array.read_page(id, buf);
        self.fail_close(result)
    }

    /// Reads part of a page.
    pub fn read_partial(&self, id: PageId, start: usize, buf: &mut [u8]) -> KeelResult<()> {
        self.check_open()?;
        let result = self.array.read_partial(id, start, buf);
        self.fail_close(result)
    }

    /// Writes a full page. Header pages are not user-writable.
    pub fn write_page(&self, id: PageId, buf: &[u8]) -> KeelResult<()> {
        self.check_open()?;
        if id.is_header() {
            return Err(KeelError::invalid_argument(format!(
                "page {} is a database header",
                id
            )));
        }
        let result = self.array.write_page(id, buf);
        self.fail_close(result)
    }

    /// Commits all changes made since the previous commit.
    ///
    /// The protocol: reach a quiescent point under the commit lock's
    /// write side, downgrade, stage the free-list snapshot, let the
    /// callback flush dirty pages, then sync everything and durably
    /// write the header for the new commit number.
    pub fn commit(
        &self,
        extra: Option<&[u8]>,
        callback: Option<&dyn CommitCallback>,
    ) -> KeelResult<u32> {
        self.check_open()?;
        if let Some(extra) = extra {
            if extra.len() > EXTRA_COMMIT_DATA_SIZE {
                return Err(KeelError::invalid_argument(format!(
                    "extra commit data is limited to {} bytes",
                    EXTRA_COMMIT_DATA_SIZE
                )));
            }
        }

        let exclusive = self.commit_lock.acquire_exclusive();
        let _shared = exclusive.downgrade();

        let result = self.commit_locked(extra, callback);
        if result.is_err() {
            self.manager.commit_abort();
        }
        self.fail_close(result)
    }

    fn commit_locked(
        &self,
        extra: Option<&[u8]>,
        callback: Option<&dyn CommitCallback>,
    ) -> KeelResult<u32> {
        let start = std::time::Instant::now();
        let new_commit = self.header_latch.read().commit_number.wrapping_add(1);

        let mut header = vec![0u8; self.page_size];
        header[MAGIC_OFFSET..MAGIC_OFFSET + 8].copy_from_slice(&DB_MAGIC.to_le_bytes());
        header[DATABASE_ID_OFFSET..DATABASE_ID_OFFSET + 16].copy_from_slice(&self.database_id);
        header[PAGE_SIZE_OFFSET..PAGE_SIZE_OFFSET + 4]
            .copy_from_slice(&(self.page_size as u32).to_le_bytes());
        header[COMMIT_NUMBER_OFFSET..COMMIT_NUMBER_OFFSET + 4]
            .copy_from_slice(&new_commit.to_le_bytes());

        self.manager
            .commit_start(&mut header[MANAGER_OFFSET..MANAGER_OFFSET + MANAGER_HEADER_SIZE])?;

        let mut prepared_extra = None;
        if let Some(callback) = callback {
            prepared_extra = callback.prepare()?;
            if let Some(extra) = &prepared_extra {
                if extra.len() > EXTRA_COMMIT_DATA_SIZE {
                    return Err(KeelError::invalid_argument(format!(
                        "extra commit data is limited to {} bytes",
                        EXTRA_COMMIT_DATA_SIZE
                    )));
                }
            }
        }

        {
            let mut stored = self.extra.write();
            let extra = prepared_extra.as_deref().or(extra);
            if let Some(extra) = extra {
                stored[..extra.len()].copy_from_slice(extra);
                stored[extra.len()..].fill(0);
            }
            header[EXTRA_OFFSET..EXTRA_OFFSET + EXTRA_COMMIT_DATA_SIZE]
                .copy_from_slice(&stored[..]);
        }

        let checksum = crc32fast::hash(&header[..HEADER_SIZE]);
        header[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_le_bytes());

        // Duplicate the header image across its page for forensic recovery.
        let (first, rest) = header.split_at_mut(HEADER_SIZE);
        for copy in rest.chunks_mut(HEADER_SIZE) {
            copy.copy_from_slice(first);
        }

        // All data pages (including length metadata) must be durable
        // before the header that references them.
        self.array.sync(true)?;
        self.array
            .write_page_durably(PageId::new(u64::from(new_commit & 1)), &header)?;

        self.header_latch.write().commit_number = new_commit;
        self.manager.commit_end();

        debug!(
            commit_number = new_commit,
            elapsed_us = start.elapsed().as_micros() as u64,
            "committed"
        );
        Ok(new_commit)
    }
}

impl std::fmt::Debug for PageDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageDb")
            .field("page_size", &self.page_size)
            .field("commit_number", &self.commit_number())
            .field("total_pages", &self.total_page_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(page_size: usize) -> DbConfig {
        DbConfig {
            page_size,
            ..DbConfig::default()
        }
    }

    #[test]
    fn test_fresh_database() {
        let dir = tempdir().unwrap();
        let db = PageDb::open(dir.path().join("keel.db"), &config(4096), false).unwrap();

        // Two seed commits leave the commit number at 0 and both headers
        // valid.
        assert_eq!(db.commit_number(), 0);
        assert_ne!(*db.database_id(), [0u8; 16]);
        assert_eq!(db.total_page_count(), 2);

        for id in [PageId::HEADER_0, PageId::HEADER_1] {
            let mut buf = [0u8; HEADER_SIZE];
            db.read_partial(id, 0, &mut buf).unwrap();
            let stored =
                u32::from_le_bytes(buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].try_into().unwrap());
            buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].fill(0);
            assert_eq!(crc32fast::hash(&buf), stored);
        }
    }

    #[test]
    fn test_reopen_keeps_identity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keel.db");

        let (id, commit) = {
            let db = PageDb::open(&path, &config(4096), false).unwrap();
            let page = db.alloc_page().unwrap();
            let data = vec![7u8; 4096];
            db.write_page(page, &data).unwrap();
            db.commit(None, None).unwrap();
            (*db.database_id(), db.commit_number())
        };

        let db = PageDb::open(&path, &config(4096), false).unwrap();
        assert_eq!(*db.database_id(), id);
        assert_eq!(db.commit_number(), commit);
    }

    #[test]
    fn test_page_size_mismatch_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keel.db");
        {
            PageDb::open(&path, &config(4096), false).unwrap();
        }
        let err = PageDb::open(&path, &config(8192), false).unwrap_err();
        assert!(matches!(err, KeelError::Corruption { .. }));
    }

    #[test]
    fn test_header_pages_not_writable() {
        let dir = tempdir().unwrap();
        let db = PageDb::open(dir.path().join("keel.db"), &config(4096), false).unwrap();
        let buf = vec![0u8; 4096];
        assert!(db.write_page(PageId::new(0), &buf).is_err());
        assert!(db.write_page(PageId::new(1), &buf).is_err());
        assert!(db.delete_page(PageId::new(1)).is_err());
    }

    #[test]
    fn test_delete_respects_commit_boundary() {
        let dir = tempdir().unwrap();
        let db = PageDb::open(dir.path().join("keel.db"), &config(4096), false).unwrap();

        let page = db.alloc_page().unwrap();
        db.delete_page(page).unwrap();
        assert_ne!(db.alloc_page().unwrap(), page);

        db.commit(None, None).unwrap();
        assert_eq!(db.alloc_page().unwrap(), page);

        let recycled = db.alloc_page().unwrap();
        db.recycle_page(recycled).unwrap();
        assert_eq!(db.alloc_page().unwrap(), recycled);
    }

    #[test]
    fn test_extra_commit_data_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keel.db");
        {
            let db = PageDb::open(&path, &config(4096), false).unwrap();
            db.commit(Some(b"registry state"), None).unwrap();
        }
        let db = PageDb::open(&path, &config(4096), false).unwrap();
        let extra = db.extra_commit_data();
        assert_eq!(&extra[..14], b"registry state");
        assert!(extra[14..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_commit_callback_runs_before_header() {
        use std::sync::atomic::AtomicU32;

        let dir = tempdir().unwrap();
        let db = PageDb::open(dir.path().join("keel.db"), &config(4096), false).unwrap();

        let calls = AtomicU32::new(0);
        let callback = || -> KeelResult<Option<Vec<u8>>> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        };
        db.commit(None, Some(&callback)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_destroy_resets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keel.db");
        let first_id = {
            let db = PageDb::open(&path, &config(4096), false).unwrap();
            *db.database_id()
        };
        let db = PageDb::open(&path, &config(4096), true).unwrap();
        assert_ne!(*db.database_id(), first_id);
        assert_eq!(db.commit_number(), 0);
    }

    #[test]
    fn test_closed_database_rejects_everything() {
        let dir = tempdir().unwrap();
        let db = PageDb::open(dir.path().join("keel.db"), &config(4096), false).unwrap();
        db.close().unwrap();
        assert!(db.alloc_page().is_err());
        assert!(db.commit(None, None).is_err());
        let mut buf = vec![0u8; 4096];
        assert!(db.read_page(PageId::new(0), &mut buf).is_err());
    }
}
