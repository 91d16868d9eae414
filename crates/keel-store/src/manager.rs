//! Free-list page allocation with rollback protection.
//!
//! Two logical free lists exist:
//!
//! - **regular**: durable. A page deleted here stays *pending* until the
//!   next commit completes, so a crash rolls the deletion back and the
//!   page is still reachable from the previous commit.
//! - **recycle**: non-durable. A recycled page may be handed back by the
//!   very next allocation; callers forfeit rollback protection.
//!
//! At `commit_start` the reusable and pending entries are serialized
//! into a chain of list pages and the chain head is recorded in the
//! 96-byte manager header. `commit_end` promotes the pending entries
//! and recycles the previous commit's chain pages.
//!
//! # Manager header layout (96 bytes)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//!   0       8   total_pages (allocation high-water, headers included)
//!   8       8   chain_head (page id of first list page, 0 = none)
//!  16       8   chain_entries (free page ids recorded in the chain)
//!  24       8   chain_pages (length of the chain itself)
//!  32      64   reserved
//! ```
//!
//! # List page layout
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//!   0       8   next list page id (0 = end of chain)
//!   8       4   entry count in this page
//!  12       4   reserved
//!  16       8n  free page ids
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use keel_common::constants::MANAGER_HEADER_SIZE;
use keel_common::error::{KeelError, KeelResult};
use keel_common::types::PageId;

use crate::array::PageArray;

const LIST_PAGE_HEADER: usize = 16;

struct ManagerInner {
    /// Allocation high-water mark; pages `[0, total_pages)` exist.
    total_pages: u64,
    /// Reusable as of the last completed commit.
    free: VecDeque<u64>,
    /// Deleted since the last completed commit; reusable after the next.
    pending: VecDeque<u64>,
    /// Immediately reusable, no rollback protection.
    recycle: Vec<u64>,
    /// List pages backing the last durable free-list snapshot.
    live_chain: Vec<u64>,
    /// Snapshot staged by `commit_start`, promoted by `commit_end`.
    staged: Option<Staged>,
}

struct Staged {
    chain: Vec<u64>,
    pending_taken: usize,
}

/// Free-list and allocation over a [`PageArray`].
///
/// Callers serialize mutating calls against commits by holding the read
/// side of the page database's commit lock.
pub struct PageManager {
    array: Arc<dyn PageArray>,
    inner: Mutex<ManagerInner>,
}

impl PageManager {
    /// Creates a manager for a fresh database: pages 0 and 1 are the
    /// headers, nothing is free.
    pub fn new(array: Arc<dyn PageArray>) -> Self {
        Self {
            array,
            inner: Mutex::new(ManagerInner {
                total_pages: 2,
                free: VecDeque::new(),
                pending: VecDeque::new(),
                recycle: Vec::new(),
                live_chain: Vec::new(),
                staged: None,
            }),
        }
    }

    /// Rebuilds a manager from the 96-byte header region of a committed
    /// database header.
    pub fn reopen(array: Arc<dyn PageArray>, header: &[u8]) -> KeelResult<Self> {
        debug_assert!(header.len() >= MANAGER_HEADER_SIZE);
        let total_pages = u64::from_le_bytes(header[0..8].try_into().unwrap());
        let chain_head = u64::from_le_bytes(header[8..16].try_into().unwrap());
        let chain_entries = u64::from_le_bytes(header[16..24].try_into().unwrap());
        let chain_pages = u64::from_le_bytes(header[24..32].try_into().unwrap());

        if total_pages < 2 {
            return Err(KeelError::corruption(format!(
                "manager header claims {} total pages",
                total_pages
            )));
        }

        let mut free = VecDeque::with_capacity(chain_entries as usize);
        let mut live_chain = Vec::with_capacity(chain_pages as usize);
        let mut next = chain_head;
        let page_size = array.page_size();
        let mut page = vec![0u8; page_size];
        while next != 0 {
            if live_chain.len() as u64 >= chain_pages {
                return Err(KeelError::corruption("free-list chain longer than recorded"));
            }
            live_chain.push(next);
            array.read_page(PageId::new(next), &mut page)?;
            let following = u64::from_le_bytes(page[0..8].try_into().unwrap());
            let count = u32::from_le_bytes(page[8..12].try_into().unwrap()) as usize;
            if LIST_PAGE_HEADER + count * 8 > page_size {
                return Err(KeelError::corruption("free-list page overflows its capacity"));
            }
            for i in 0..count {
                let off = LIST_PAGE_HEADER + i * 8;
                free.push_back(u64::from_le_bytes(page[off..off + 8].try_into().unwrap()));
            }
            next = following;
        }
        if free.len() as u64 != chain_entries {
            return Err(KeelError::corruption(format!(
                "free-list chain holds {} entries, header recorded {}",
                free.len(),
                chain_entries
            )));
        }

        Ok(Self {
            array,
            inner: Mutex::new(ManagerInner {
                total_pages,
                free,
                pending: VecDeque::new(),
                recycle: Vec::new(),
                live_chain,
                staged: None,
            }),
        })
    }

    /// Allocates a page: recycle list first, then the committed regular
    /// list, then extends the array.
    pub fn alloc(&self) -> KeelResult<PageId> {
        let mut inner = self.inner.lock();
        if let Some(id) = inner.recycle.pop() {
            return Ok(PageId::new(id));
        }
        if let Some(id) = inner.free.pop_front() {
            return Ok(PageId::new(id));
        }
        let id = inner.total_pages;
        inner.total_pages += 1;
        Ok(PageId::new(id))
    }

    /// Returns a page to the regular free list. It becomes reusable only
    /// after the next commit completes.
    pub fn delete(&self, id: PageId) -> KeelResult<()> {
        let mut inner = self.inner.lock();
        Self::check_id(&inner, id)?;
        inner.pending.push_back(id.as_u64());
        Ok(())
    }

    /// Returns a page to the recycle list: immediately reusable, no
    /// rollback protection.
    pub fn recycle(&self, id: PageId) -> KeelResult<()> {
        let mut inner = self.inner.lock();
        Self::check_id(&inner, id)?;
        inner.recycle.push(id.as_u64());
        Ok(())
    }

    fn check_id(inner: &ManagerInner, id: PageId) -> KeelResult<()> {
        if id.is_header() || id.as_u64() >= inner.total_pages {
            return Err(KeelError::invalid_argument(format!(
                "page id {} is not a live data page",
                id
            )));
        }
        Ok(())
    }

    /// Total pages, headers included.
    pub fn total_page_count(&self) -> u64 {
        self.inner.lock().total_pages
    }

    /// Pages reusable without extending the array.
    pub fn free_page_count(&self) -> u64 {
        let inner = self.inner.lock();
        (inner.free.len() + inner.recycle.len()) as u64
    }

    /// Serializes the free-list snapshot for the commit in progress into
    /// `header` (the 96-byte manager region of the database header).
    ///
    /// The snapshot covers the reusable list plus everything pending at
    /// this instant: once the commit lands, those deletions are final.
    pub fn commit_start(&self, header: &mut [u8]) -> KeelResult<()> {
        debug_assert!(header.len() >= MANAGER_HEADER_SIZE);
        let mut inner = self.inner.lock();
        let pending_taken = inner.pending.len();
        let entries: Vec<u64> = inner
            .free
            .iter()
            .chain(inner.pending.iter().take(pending_taken))
            .copied()
            .collect();

        let page_size = self.array.page_size();
        let capacity = (page_size - LIST_PAGE_HEADER) / 8;
        let mut chain: Vec<u64> = Vec::new();

        // Allocate the chain outside the regular list so the snapshot
        // never references its own storage.
        let needed = entries.len().div_ceil(capacity);
        for _ in 0..needed {
            let id = match inner.recycle.pop() {
                Some(id) => id,
                None => {
                    let id = inner.total_pages;
                    inner.total_pages += 1;
                    id
                }
            };
            chain.push(id);
        }

        let mut page = vec![0u8; page_size];
        for (i, chunk) in entries.chunks(capacity).enumerate() {
            page.fill(0);
            let next = chain.get(i + 1).copied().unwrap_or(0);
            page[0..8].copy_from_slice(&next.to_le_bytes());
            page[8..12].copy_from_slice(&(chunk.len() as u32).to_le_bytes());
            for (j, id) in chunk.iter().enumerate() {
                let off = LIST_PAGE_HEADER + j * 8;
                page[off..off + 8].copy_from_slice(&id.to_le_bytes());
            }
            self.array.write_page(PageId::new(chain[i]), &page)?;
        }

        header[0..8].copy_from_slice(&inner.total_pages.to_le_bytes());
        header[8..16].copy_from_slice(&chain.first().copied().unwrap_or(0).to_le_bytes());
        header[16..24].copy_from_slice(&(entries.len() as u64).to_le_bytes());
        header[24..32].copy_from_slice(&(chain.len() as u64).to_le_bytes());
        header[32..MANAGER_HEADER_SIZE].fill(0);

        inner.staged = Some(Staged {
            chain,
            pending_taken,
        });
        Ok(())
    }

    /// Retires the previous free-list snapshot: its chain pages are
    /// recycled and the pending deletions covered by `commit_start`
    /// become reusable.
    pub fn commit_end(&self) {
        let mut inner = self.inner.lock();
        let staged = match inner.staged.take() {
            Some(staged) => staged,
            None => return,
        };
        let old_chain = std::mem::replace(&mut inner.live_chain, staged.chain);
        inner.recycle.extend(old_chain);
        for _ in 0..staged.pending_taken {
            if let Some(id) = inner.pending.pop_front() {
                inner.free.push_back(id);
            }
        }
    }

    /// Drops the staged snapshot after a failed commit. The pending list
    /// is untouched; the staged chain pages are recycled.
    pub fn commit_abort(&self) {
        let mut inner = self.inner.lock();
        if let Some(staged) = inner.staged.take() {
            inner.recycle.extend(staged.chain);
        }
    }
}
