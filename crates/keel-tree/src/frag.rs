//! Out-of-line storage for oversized keys and values.
//!
//! A fragmented field's entry carries `(full length, first page)`; the
//! bytes live in a chain of indirect pages, each laid out as an 8-byte
//! next-page pointer followed by data. Chains are immutable once
//! written: rewriting a value builds a new chain and frees the old one,
//! which keeps the copy-on-write commit contract intact.

use std::sync::Arc;

use keel_common::error::{KeelError, KeelResult};
use keel_common::types::PageId;
use keel_store::PageDb;

/// Reads, writes, and frees fragment chains.
pub struct FragmentStore {
    db: Arc<PageDb>,
}

impl FragmentStore {
    /// Creates a fragment store over the page database.
    #[must_use]
    pub fn new(db: Arc<PageDb>) -> Self {
        Self { db }
    }

    /// Returns the underlying page database.
    #[must_use]
    pub fn db(&self) -> &Arc<PageDb> {
        &self.db
    }

    fn data_per_page(&self) -> usize {
        self.db.page_size() - 8
    }

    /// Writes `data` into a fresh chain, returning its first page.
    pub fn write_new(&self, data: &[u8]) -> KeelResult<PageId> {
        debug_assert!(!data.is_empty());
        let per_page = self.data_per_page();
        let page_size = self.db.page_size();

        let pages: Vec<PageId> = (0..data.len().div_ceil(per_page))
            .map(|_| self.db.alloc_page())
            .collect::<KeelResult<_>>()?;

        let mut page = vec![0u8; page_size];
        for (i, chunk) in data.chunks(per_page).enumerate() {
            page.fill(0);
            let next = pages.get(i + 1).copied().unwrap_or(PageId::NONE);
            page[0..8].copy_from_slice(&next.as_u64().to_le_bytes());
            page[8..8 + chunk.len()].copy_from_slice(chunk);
            self.db.write_page(pages[i], &page)?;
        }
        Ok(pages[0])
    }

    /// Reads the full chain.
    pub fn read_all(&self, first_page: PageId, len: u64) -> KeelResult<Vec<u8>> {
        let mut out = vec![0u8; len as usize];
        let n = self.read_at(first_page, len, 0, &mut out)?;
        debug_assert_eq!(n as u64, len);
        Ok(out)
    }

    /// Random-access read within the chain. Returns the bytes read,
    /// short only at the end of the value.
    pub fn read_at(
        &self,
        first_page: PageId,
        len: u64,
        at: u64,
        buf: &mut [u8],
    ) -> KeelResult<usize> {
        if at >= len {
            return Ok(0);
        }
        let per_page = self.data_per_page() as u64;
        let want = buf.len().min((len - at) as usize);

        // Walk to the page holding the offset.
        let mut page_id = first_page;
        let mut skip = at / per_page;
        while skip > 0 {
            page_id = self.next_of(page_id)?;
            skip -= 1;
        }

        let mut filled = 0usize;
        let mut offset_in_page = (at % per_page) as usize;
        while filled < want {
            let chunk = (want - filled).min(per_page as usize - offset_in_page);
            self.db
                .read_partial(page_id, 8 + offset_in_page, &mut buf[filled..filled + chunk])?;
            filled += chunk;
            offset_in_page = 0;
            if filled < want {
                page_id = self.next_of(page_id)?;
            }
        }
        Ok(want)
    }

    /// Frees every page of the chain, rollback-protected.
    pub fn free(&self, first_page: PageId, len: u64) -> KeelResult<()> {
        let per_page = self.data_per_page() as u64;
        let pages = len.div_ceil(per_page);
        let mut page_id = first_page;
        for i in 0..pages {
            let next = if i + 1 < pages {
                self.next_of(page_id)?
            } else {
                PageId::NONE
            };
            self.db.delete_page(page_id)?;
            page_id = next;
        }
        Ok(())
    }

    fn next_of(&self, page_id: PageId) -> KeelResult<PageId> {
        let mut next = [0u8; 8];
        self.db.read_partial(page_id, 0, &mut next)?;
        let next = PageId::new(u64::from_le_bytes(next));
        if !next.is_valid() {
            return Err(KeelError::corruption(format!(
                "fragment chain broken at page {}",
                page_id
            )));
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_common::config::DbConfig;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, FragmentStore) {
        let dir = tempdir().unwrap();
        let config = DbConfig {
            page_size: 512,
            ..DbConfig::default()
        };
        let db = PageDb::open(dir.path().join("frag.db"), &config, false).unwrap();
        (dir, FragmentStore::new(Arc::new(db)))
    }

    #[test]
    fn test_round_trip_single_page() {
        let (_dir, store) = store();
        let data = b"short fragment".to_vec();
        let first = store.write_new(&data).unwrap();
        assert_eq!(store.read_all(first, data.len() as u64).unwrap(), data);
    }

    #[test]
    fn test_round_trip_multi_page() {
        let (_dir, store) = store();
        let data: Vec<u8> = (0..3000).map(|i| (i % 251) as u8).collect();
        let first = store.write_new(&data).unwrap();
        assert_eq!(store.read_all(first, data.len() as u64).unwrap(), data);
    }

    #[test]
    fn test_random_access_read() {
        let (_dir, store) = store();
        let data: Vec<u8> = (0..2000).map(|i| (i % 251) as u8).collect();
        let first = store.write_new(&data).unwrap();

        let mut buf = [0u8; 100];
        let n = store.read_at(first, 2000, 700, &mut buf).unwrap();
        assert_eq!(n, 100);
        assert_eq!(&buf[..], &data[700..800]);

        // Reads past the end come back short.
        let n = store.read_at(first, 2000, 1950, &mut buf).unwrap();
        assert_eq!(n, 50);
        assert_eq!(&buf[..50], &data[1950..]);

        let n = store.read_at(first, 2000, 2000, &mut buf).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_free_returns_pages_after_commit() {
        let (_dir, store) = store();
        let data = vec![7u8; 1500];
        let first = store.write_new(&data).unwrap();
        store.free(first, 1500).unwrap();

        store.db().commit(None, None).unwrap();
        // The chain's first page is reusable now.
        let reused = store.db().alloc_page().unwrap();
        assert_eq!(reused, first);
    }
}
