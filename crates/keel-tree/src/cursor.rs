//! The tree cursor.
//!
//! A cursor owns a stack of frames, one per tree level, each binding
//! `(node, position, version)`. Latches are never held between cursor
//! operations: every operation relatches and compares the recorded
//! version, re-descending from the bound key on drift. Stubs left by a
//! root shrink read as empty and force the same re-descent.
//!
//! Mutations run through the cursor: the whole path is write-latched
//! hand-over-hand and copy-on-write dirtied top-down, then the leaf is
//! edited. A leaf without room splits: the sibling is created and a
//! split descriptor installed under the leaf latch, the latch is
//! released, and the parent absorbs the split in a second step while
//! descents route through the descriptor.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use keel_common::constants::NODE_HEADER_SIZE;
use keel_common::error::{KeelError, KeelResult};
use keel_common::types::PageId;
use keel_txn::{LockResult, Txn};

use crate::node::{
    compare_field_key, encode_fragmented, encode_inline, Field, Node, NodeInner, NodeReadGuard,
    NodeWriteGuard, Split, FRAGMENT_REF_SIZE, HIGH_EXTREMITY, LOW_EXTREMITY, TYPE_INTERNAL,
};
use crate::tree::Tree;

/// One level of the cursor's binding.
pub(crate) struct Frame {
    pub(crate) node: Arc<Node>,
    /// Entry index in a leaf, child descent position in an internal
    /// node.
    pub(crate) pos: usize,
    pub(crate) version: u64,
}

/// A cursor over one tree.
pub struct TreeCursor {
    pub(crate) tree: Tree,
    txn: Option<Txn>,
    pub(crate) frames: Vec<Frame>,
    key: Option<Vec<u8>>,
    /// True when the bound key exists at the leaf frame's position.
    found: bool,
}

enum Seek {
    Ge,
    Gt,
    Le,
    Lt,
}

enum EdgeOutcome {
    Positioned,
    EmptyLeaf,
    Drift,
}

impl TreeCursor {
    pub(crate) fn new(tree: Tree, txn: Option<Txn>) -> TreeCursor {
        TreeCursor {
            tree,
            txn,
            frames: Vec::new(),
            key: None,
            found: false,
        }
    }

    /// Returns the bound key, if positioned.
    #[must_use]
    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    /// Unbinds the cursor, releasing its frames.
    pub fn reset(&mut self) {
        self.frames.clear();
        self.key = None;
        self.found = false;
    }

    /// Returns true when the bound key currently exists.
    pub fn exists(&mut self) -> KeelResult<bool> {
        let Some(key) = self.key.clone() else {
            return Ok(false);
        };
        let guard = self.leaf_guard(&key)?;
        drop(guard);
        Ok(self.found)
    }

    pub(crate) fn leaf_page_id(&self) -> Option<PageId> {
        self.frames.last().map(|f| f.node.id())
    }

    // =========================================================================
    // Descent
    // =========================================================================

    /// Positions the cursor at `key`, whether or not it exists.
    pub fn find(&mut self, key: &[u8]) -> KeelResult<()> {
        self.tree.check_key(key)?;
        let guard = self.descend(key)?;
        drop(guard);
        self.key = Some(key.to_vec());
        Ok(())
    }

    /// Positions at `key`, trying the bound leaf before a full descent.
    pub fn find_nearby(&mut self, key: &[u8]) -> KeelResult<()> {
        self.tree.check_key(key)?;
        if let Some(frame) = self.frames.last() {
            let node = Arc::clone(&frame.node);
            let guard = node.read();
            if guard.version == frame.version && !guard.is_stub() && self.leaf_covers(&guard, key)?
            {
                let search = guard.binary_search(key, &self.tree.db.core.frags)?;
                let (pos, found) = match search {
                    Ok(i) => (i, true),
                    Err(i) => (i, false),
                };
                drop(guard);
                let frame = self.frames.last_mut().unwrap();
                frame.pos = pos;
                self.found = found;
                self.key = Some(key.to_vec());
                return Ok(());
            }
        }
        self.find(key)
    }

    /// True when `key` falls inside the leaf's covered range, so a
    /// local search is conclusive.
    fn leaf_covers(&self, guard: &NodeReadGuard, key: &[u8]) -> KeelResult<bool> {
        let count = guard.entry_count();
        if count == 0 {
            return Ok(guard.has_low_extremity() && guard.has_high_extremity());
        }
        let frags = &self.tree.db.core.frags;
        let above_first = guard.has_low_extremity()
            || guard.compare_key_at(0, key, frags)? != CmpOrdering::Greater;
        if !above_first {
            return Ok(false);
        }
        let below_last = guard.has_high_extremity()
            || guard.compare_key_at(count - 1, key, frags)? != CmpOrdering::Less;
        Ok(below_last)
    }

    /// Full lock-coupled descent to the leaf for `key`. Fills the
    /// frame stack and the `found` flag, returning the leaf guard.
    fn descend(&mut self, key: &[u8]) -> KeelResult<NodeReadGuard> {
        let frags_db = self.tree.db.clone();
        let frags = &frags_db.core.frags;
        'restart: loop {
            self.frames.clear();
            let mut node = self.tree.root_node()?;
            let mut guard = node.read();
            loop {
                if guard.is_stub() {
                    drop(guard);
                    continue 'restart;
                }
                if let Some(split) = &guard.split {
                    let go_sibling = {
                        let cmp = compare_field_key(&split.separator, 0, key, frags)?;
                        if split.sibling_on_left {
                            cmp == CmpOrdering::Greater
                        } else {
                            cmp != CmpOrdering::Greater
                        }
                    };
                    if go_sibling {
                        let sibling = Arc::clone(&split.sibling);
                        let sibling_guard = sibling.read();
                        drop(guard);
                        node = sibling;
                        guard = sibling_guard;
                        continue;
                    }
                }
                if guard.is_leaf() {
                    let search = guard.binary_search(key, frags)?;
                    let (pos, found) = match search {
                        Ok(i) => (i, true),
                        Err(i) => (i, false),
                    };
                    self.frames.push(Frame {
                        node: Arc::clone(&node),
                        pos,
                        version: guard.version,
                    });
                    self.found = found;
                    return Ok(guard);
                }
                let pos = NodeInner::internal_pos(guard.binary_search(key, frags)?);
                let child_id = guard.child_at(pos);
                let child = self.tree.load_child(child_id)?;
                let child_guard = child.read();
                self.frames.push(Frame {
                    node: Arc::clone(&node),
                    pos,
                    version: guard.version,
                });
                drop(guard);
                node = child;
                guard = child_guard;
            }
        }
    }

    /// Relatches the bound leaf, re-descending if it drifted.
    fn leaf_guard(&mut self, key: &[u8]) -> KeelResult<NodeReadGuard> {
        if let Some(frame) = self.frames.last() {
            let node = Arc::clone(&frame.node);
            let guard = node.read();
            if guard.version == frame.version && !guard.is_stub() {
                return Ok(guard);
            }
        }
        self.descend(key)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Loads the value at the bound key, honoring the transaction's
    /// isolation level.
    pub fn load(&mut self) -> KeelResult<Option<Vec<u8>>> {
        let key = self
            .key
            .clone()
            .ok_or_else(|| KeelError::illegal_state("cursor is not positioned"))?;

        let wants_lock = self
            .txn
            .as_ref()
            .map(|txn| txn.isolation().locks_reads())
            .unwrap_or(false);
        let mut locked = false;

        let value = loop {
            let guard = self.leaf_guard(&key)?;
            if wants_lock && !locked {
                // Try without waiting while latched; on contention,
                // release the latch, wait for the lock, and re-verify.
                let txn = self.txn.as_ref().unwrap();
                let result = self.acquire_read_lock(txn, &key, -1)?;
                if result == LockResult::TimedOut {
                    drop(guard);
                    let txn = self.txn.clone().unwrap();
                    let result =
                        self.acquire_read_lock(&txn, &key, txn.lock_timeout_nanos())?;
                    self.check_lock(&txn, result)?;
                    locked = true;
                    continue;
                }
                self.check_lock(txn, result)?;
                locked = true;
            }
            let frame = self.frames.last().unwrap();
            let value = if self.found {
                Some(guard.value_at(frame.pos).to_vec(&self.tree.db.core.frags)?)
            } else {
                None
            };
            break value;
        };

        if let Some(txn) = &self.txn {
            if txn.isolation().releases_read_locks() {
                self.tree
                    .db
                    .core
                    .locks
                    .unlock(txn, self.tree.state.id, &key);
            }
        }
        Ok(value)
    }

    fn acquire_read_lock(
        &self,
        txn: &Txn,
        key: &[u8],
        timeout_nanos: i64,
    ) -> KeelResult<LockResult> {
        let locks = &self.tree.db.core.locks;
        let tree = self.tree.state.id;
        if txn.isolation().reads_upgradable() {
            locks.try_lock_upgradable(txn, tree, key, timeout_nanos)
        } else {
            locks.try_lock_shared(txn, tree, key, timeout_nanos)
        }
    }

    fn check_lock(&self, txn: &Txn, result: LockResult) -> KeelResult<()> {
        match result {
            r if r.is_held() => Ok(()),
            LockResult::Illegal => Err(KeelError::LockFailed {
                txn_id: txn.id(),
                reason: keel_common::error::LockFailReason::IllegalUpgrade,
            }),
            _ => Err(KeelError::LockFailed {
                txn_id: txn.id(),
                reason: keel_common::error::LockFailReason::Timeout,
            }),
        }
    }

    /// Returns the logical length of the value at the bound key.
    pub fn value_length(&mut self) -> KeelResult<Option<u64>> {
        let key = self
            .key
            .clone()
            .ok_or_else(|| KeelError::illegal_state("cursor is not positioned"))?;
        let guard = self.leaf_guard(&key)?;
        if !self.found {
            return Ok(None);
        }
        let frame = self.frames.last().unwrap();
        Ok(Some(guard.value_at(frame.pos).len()))
    }

    /// Random-access read inside the value. Returns the bytes read, or
    /// `None` when the key does not exist.
    pub fn value_read(&mut self, at: u64, buf: &mut [u8]) -> KeelResult<Option<usize>> {
        let key = self
            .key
            .clone()
            .ok_or_else(|| KeelError::illegal_state("cursor is not positioned"))?;
        let guard = self.leaf_guard(&key)?;
        if !self.found {
            return Ok(None);
        }
        let frame = self.frames.last().unwrap();
        let frags = &self.tree.db.core.frags;
        match guard.value_at(frame.pos) {
            Field::Inline(bytes) => {
                if at >= bytes.len() as u64 {
                    return Ok(Some(0));
                }
                let n = buf.len().min(bytes.len() - at as usize);
                buf[..n].copy_from_slice(&bytes[at as usize..at as usize + n]);
                Ok(Some(n))
            }
            Field::Fragmented { len, first_page } => {
                Ok(Some(frags.read_at(first_page, len, at, buf)?))
            }
        }
    }

    /// Random-access write inside the value, extending it as needed.
    /// The value is rewritten through the store path.
    pub fn value_write(&mut self, at: u64, data: &[u8]) -> KeelResult<()> {
        let mut value = self.load()?.ok_or_else(|| {
            KeelError::illegal_state("cannot write into a value that does not exist")
        })?;
        let end = at as usize + data.len();
        if value.len() < end {
            value.resize(end, 0);
        }
        value[at as usize..end].copy_from_slice(data);
        self.store(Some(&value))?;
        Ok(())
    }

    /// Truncates the value to zero length.
    pub fn value_clear(&mut self) -> KeelResult<()> {
        if self.load()?.is_some() {
            self.store(Some(b""))?;
        }
        Ok(())
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Positions at the first entry. Returns false on an empty tree.
    pub fn first(&mut self) -> KeelResult<bool> {
        self.seek_edge(true)
    }

    /// Positions at the last entry. Returns false on an empty tree.
    pub fn last(&mut self) -> KeelResult<bool> {
        self.seek_edge(false)
    }

    /// Positions at the smallest key `>= key`.
    pub fn find_ge(&mut self, key: &[u8]) -> KeelResult<bool> {
        self.tree.check_key(key)?;
        self.seek(Seek::Ge, key)
    }

    /// Positions at the smallest key `> key`.
    pub fn find_gt(&mut self, key: &[u8]) -> KeelResult<bool> {
        self.tree.check_key(key)?;
        self.seek(Seek::Gt, key)
    }

    /// Positions at the largest key `<= key`.
    pub fn find_le(&mut self, key: &[u8]) -> KeelResult<bool> {
        self.tree.check_key(key)?;
        self.seek(Seek::Le, key)
    }

    /// Positions at the largest key `< key`.
    pub fn find_lt(&mut self, key: &[u8]) -> KeelResult<bool> {
        self.tree.check_key(key)?;
        self.seek(Seek::Lt, key)
    }

    /// Advances to the next entry. Walks right within the leaf when
    /// the binding is still valid, otherwise re-descends.
    pub fn next(&mut self) -> KeelResult<bool> {
        let key = self
            .key
            .clone()
            .ok_or_else(|| KeelError::illegal_state("cursor is not positioned"))?;

        if let Some(frame) = self.frames.last() {
            let node = Arc::clone(&frame.node);
            let guard = node.read();
            if guard.version == frame.version && !guard.is_stub() {
                let idx = if self.found { frame.pos + 1 } else { frame.pos };
                if idx < guard.entry_count() {
                    let next_key = guard.key_at(idx).to_vec(&self.tree.db.core.frags)?;
                    drop(guard);
                    self.frames.last_mut().unwrap().pos = idx;
                    self.found = true;
                    self.key = Some(next_key);
                    return Ok(true);
                }
            }
        }
        self.seek(Seek::Gt, &key)
    }

    /// Advances to the next entry, stopping past `limit`. Returns
    /// false (and unbinds) when the next key would exceed the limit.
    pub fn next_le(&mut self, limit: &[u8]) -> KeelResult<bool> {
        if !self.next()? {
            return Ok(false);
        }
        if self.key.as_deref().map_or(true, |key| key > limit) {
            self.reset();
            return Ok(false);
        }
        Ok(true)
    }

    /// Steps back to the previous entry.
    pub fn previous(&mut self) -> KeelResult<bool> {
        let key = self
            .key
            .clone()
            .ok_or_else(|| KeelError::illegal_state("cursor is not positioned"))?;

        if let Some(frame) = self.frames.last() {
            let node = Arc::clone(&frame.node);
            let guard = node.read();
            if guard.version == frame.version && !guard.is_stub() && frame.pos > 0 {
                let idx = frame.pos - 1;
                let prev_key = guard.key_at(idx).to_vec(&self.tree.db.core.frags)?;
                drop(guard);
                self.frames.last_mut().unwrap().pos = idx;
                self.found = true;
                self.key = Some(prev_key);
                return Ok(true);
            }
        }
        self.seek(Seek::Lt, &key)
    }

    /// Skips `amount` entries forward (positive) or backward.
    pub fn skip(&mut self, amount: i64) -> KeelResult<bool> {
        let mut remaining = amount;
        while remaining > 0 {
            if !self.next()? {
                return Ok(false);
            }
            remaining -= 1;
        }
        while remaining < 0 {
            if !self.previous()? {
                return Ok(false);
            }
            remaining += 1;
        }
        Ok(true)
    }

    fn seek(&mut self, op: Seek, key: &[u8]) -> KeelResult<bool> {
        loop {
            let guard = self.descend(key)?;
            let count = guard.entry_count();
            let frame_pos = self.frames.last().unwrap().pos;
            let found = self.found;

            let idx = match op {
                Seek::Ge => (found || frame_pos < count).then_some(frame_pos),
                Seek::Gt => {
                    let i = if found { frame_pos + 1 } else { frame_pos };
                    (i < count).then_some(i)
                }
                Seek::Le => {
                    if found {
                        Some(frame_pos)
                    } else if frame_pos > 0 {
                        Some(frame_pos - 1)
                    } else {
                        None
                    }
                }
                Seek::Lt => (frame_pos > 0).then(|| frame_pos - 1),
            };

            if let Some(idx) = idx {
                let bound = guard.key_at(idx).to_vec(&self.tree.db.core.frags)?;
                drop(guard);
                self.frames.last_mut().unwrap().pos = idx;
                self.found = true;
                self.key = Some(bound);
                return Ok(true);
            }

            let forward = matches!(op, Seek::Ge | Seek::Gt);
            drop(guard);
            match self.climb(forward)? {
                Some(positioned) => return Ok(positioned),
                None => continue,
            }
        }
    }

    /// From an exhausted leaf frame, climbs to the nearest ancestor
    /// with a sibling subtree in the travel direction and descends its
    /// edge. `Ok(None)` means a frame drifted and the caller restarts.
    fn climb(&mut self, forward: bool) -> KeelResult<Option<bool>> {
        'climb: loop {
            // The exhausted leaf is popped; ancestors remain.
            self.frames.pop();
            loop {
                let Some(frame) = self.frames.last() else {
                    self.found = false;
                    return Ok(Some(false));
                };
                let node = Arc::clone(&frame.node);
                let pos = frame.pos;
                let guard = node.read();
                if guard.version != frame.version || guard.is_stub() || !guard.is_internal() {
                    return Ok(None);
                }
                let count = guard.entry_count();
                let next_pos = if forward {
                    (pos < count).then_some(pos + 1)
                } else {
                    (pos > 0).then(|| pos - 1)
                };
                let Some(next_pos) = next_pos else {
                    drop(guard);
                    self.frames.pop();
                    continue;
                };
                self.frames.last_mut().unwrap().pos = next_pos;
                let child_id = guard.child_at(next_pos);
                match self.edge_descend(Some(guard), child_id, forward)? {
                    EdgeOutcome::Positioned => return Ok(Some(true)),
                    EdgeOutcome::EmptyLeaf => continue 'climb,
                    EdgeOutcome::Drift => return Ok(None),
                }
            }
        }
    }

    /// Descends to the minimum (forward) or maximum edge of a subtree,
    /// extending the frame stack. An empty leaf is pushed as a frame
    /// so the climb can continue past it.
    fn edge_descend(
        &mut self,
        parent_guard: Option<NodeReadGuard>,
        child_id: PageId,
        min_edge: bool,
    ) -> KeelResult<EdgeOutcome> {
        let mut node = self.tree.load_child(child_id)?;
        let mut guard = node.read();
        drop(parent_guard);
        loop {
            if guard.is_stub() {
                return Ok(EdgeOutcome::Drift);
            }
            if let Some(split) = &guard.split {
                let go_sibling = split.sibling_on_left == min_edge;
                if go_sibling {
                    let sibling = Arc::clone(&split.sibling);
                    let sibling_guard = sibling.read();
                    drop(guard);
                    node = sibling;
                    guard = sibling_guard;
                    continue;
                }
            }
            let count = guard.entry_count();
            if guard.is_leaf() {
                if count == 0 {
                    self.frames.push(Frame {
                        node: Arc::clone(&node),
                        pos: 0,
                        version: guard.version,
                    });
                    return Ok(EdgeOutcome::EmptyLeaf);
                }
                let idx = if min_edge { 0 } else { count - 1 };
                let key = guard.key_at(idx).to_vec(&self.tree.db.core.frags)?;
                self.frames.push(Frame {
                    node: Arc::clone(&node),
                    pos: idx,
                    version: guard.version,
                });
                self.found = true;
                self.key = Some(key);
                return Ok(EdgeOutcome::Positioned);
            }
            let pos = if min_edge { 0 } else { count };
            let next_id = guard.child_at(pos);
            let child = self.tree.load_child(next_id)?;
            let child_guard = child.read();
            self.frames.push(Frame {
                node: Arc::clone(&node),
                pos,
                version: guard.version,
            });
            drop(guard);
            node = child;
            guard = child_guard;
        }
    }

    fn seek_edge(&mut self, min_edge: bool) -> KeelResult<bool> {
        loop {
            self.frames.clear();
            self.key = None;
            self.found = false;
            let root = self.tree.root_node()?;

            // Seed the stack with the root as a zero-depth subtree and
            // reuse the edge descent. The root frame is synthesized by
            // descending from its own id.
            let root_guard = root.read();
            if root_guard.is_stub() {
                drop(root_guard);
                continue;
            }
            if root_guard.is_leaf() && root_guard.split.is_none() {
                let count = root_guard.entry_count();
                if count == 0 {
                    drop(root_guard);
                    return Ok(false);
                }
                let idx = if min_edge { 0 } else { count - 1 };
                let key = root_guard.key_at(idx).to_vec(&self.tree.db.core.frags)?;
                self.frames.push(Frame {
                    node: Arc::clone(&root),
                    pos: idx,
                    version: root_guard.version,
                });
                drop(root_guard);
                self.found = true;
                self.key = Some(key);
                return Ok(true);
            }
            if root_guard.split.is_some() {
                // A root mid-split routes like any other node; retry
                // until the split finishes or descend handles it.
                drop(root_guard);
                std::thread::yield_now();
                continue;
            }
            let count = root_guard.entry_count();
            let pos = if min_edge { 0 } else { count };
            let child_id = root_guard.child_at(pos);
            self.frames.push(Frame {
                node: Arc::clone(&root),
                pos,
                version: root_guard.version,
            });
            match self.edge_descend(Some(root_guard), child_id, min_edge)? {
                EdgeOutcome::Positioned => return Ok(true),
                EdgeOutcome::EmptyLeaf => match self.climb(min_edge)? {
                    Some(positioned) => return Ok(positioned),
                    None => continue,
                },
                EdgeOutcome::Drift => continue,
            }
        }
    }

    /// Positions at a uniformly-ish random entry, biased by descent.
    /// Returns false on an empty tree.
    pub fn random(&mut self) -> KeelResult<bool> {
        for _ in 0..8 {
            let mut node = self.tree.root_node()?;
            self.frames.clear();
            self.found = false;
            let mut guard = node.read();
            loop {
                if guard.is_stub() || guard.split.is_some() {
                    break;
                }
                let count = guard.entry_count();
                if guard.is_leaf() {
                    if count == 0 {
                        break;
                    }
                    let idx = rand::random::<usize>() % count;
                    let key = guard.key_at(idx).to_vec(&self.tree.db.core.frags)?;
                    self.frames.push(Frame {
                        node: Arc::clone(&node),
                        pos: idx,
                        version: guard.version,
                    });
                    self.found = true;
                    self.key = Some(key);
                    return Ok(true);
                }
                let pos = rand::random::<usize>() % (count + 1);
                let child_id = guard.child_at(pos);
                let child = self.tree.load_child(child_id)?;
                let child_guard = child.read();
                self.frames.push(Frame {
                    node: Arc::clone(&node),
                    pos,
                    version: guard.version,
                });
                drop(guard);
                node = child;
                guard = child_guard;
            }
        }
        self.first()
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Stores a value at the bound key; `None` deletes. Returns the
    /// previous value.
    pub fn store(&mut self, value: Option<&[u8]>) -> KeelResult<Option<Vec<u8>>> {
        let key = self
            .key
            .clone()
            .ok_or_else(|| KeelError::illegal_state("cursor is not positioned"))?;

        if let Some(txn) = &self.txn {
            let result = self
                .tree
                .db
                .core
                .locks
                .lock_exclusive(txn, self.tree.state.id, &key)?;
            self.check_lock(txn, result)?;
        }

        let db = self.tree.db.clone();
        let pagedb = Arc::clone(&db.core.pagedb);
        let _commit_guard = pagedb.commit_lock_shared();
        let frags = &db.core.frags;

        // The value field (and its fragment chain) is encoded once,
        // even if splits force a retry. The key field is built lazily:
        // a replace reuses the entry's existing key.
        let capacity = db.core.config.page_size - NODE_HEADER_SIZE;
        let max_entry = capacity / 2 - 2;
        let max_inline_key = (capacity / 4).min(0x7fff) - 2;
        let key_field_len = if key.len() <= max_inline_key {
            2 + key.len()
        } else {
            2 + FRAGMENT_REF_SIZE
        };
        let value_field = match value {
            Some(value) => {
                let oversized = value.len() > 0x7fff
                    || key_field_len + 2 + value.len() > max_entry;
                Some(if !value.is_empty() && oversized {
                    let first = frags.write_new(value)?;
                    encode_fragmented(value.len() as u64, first)
                } else {
                    encode_inline(value)
                })
            }
            None => None,
        };
        let mut key_field: Option<Vec<u8>> = None;

        let old = loop {
            let guard = self.descend(&key)?;
            drop(guard);
            let Some(mut leaf) = self.dirty_path()? else {
                continue;
            };

            let search = leaf.binary_search(&key, frags)?;
            match (&value_field, search) {
                (None, Err(_)) => {
                    self.found = false;
                    break None;
                }
                (None, Ok(i)) => {
                    let old = self.take_old_value(&leaf, i, true)?;
                    leaf.delete_entry(i);
                    self.found = false;
                    self.sync_leaf_frame(&leaf, i);
                    self.rebalance_after_delete(leaf)?;
                    break Some(old);
                }
                (Some(value_field), Ok(i)) => {
                    let needed = leaf.raw_key_at(i).len() + value_field.len();
                    if leaf.usable_space() + leaf.entry_size(i) >= needed + 2 {
                        // The entry keeps its key; only the old value
                        // chain is released.
                        let old = self.take_old_value(&leaf, i, false)?;
                        leaf.leaf_replace_value(i, value_field);
                        self.found = true;
                        self.sync_leaf_frame(&leaf, i);
                        break Some(old);
                    }
                    // No room even after reclaiming the old entry:
                    // delete and fall into the split insert path. The
                    // freshly encoded key field replaces the old key,
                    // chain included.
                    let old = self.take_old_value(&leaf, i, true)?;
                    leaf.delete_entry(i);
                    if key_field.is_none() {
                        key_field = Some(build_key_field(frags, &key, max_inline_key)?);
                    }
                    let kf = key_field.as_deref().unwrap();
                    self.split_insert(leaf, i, kf, value_field)?;
                    self.find(&key)?;
                    break Some(old);
                }
                (Some(value_field), Err(i)) => {
                    if key_field.is_none() {
                        key_field = Some(build_key_field(frags, &key, max_inline_key)?);
                    }
                    let kf = key_field.as_deref().unwrap();
                    let size = kf.len() + value_field.len();
                    if leaf.fits(size) {
                        leaf.leaf_insert(i, kf, value_field);
                    } else if leaf.could_fit(size) {
                        leaf.compact();
                        leaf.leaf_insert(i, kf, value_field);
                    } else {
                        self.split_insert(leaf, i, kf, value_field)?;
                        self.find(&key)?;
                        break None;
                    }
                    self.found = true;
                    self.sync_leaf_frame(&leaf, i);
                    break None;
                }
            }
        };

        if !self.tree.state.triggers.is_empty() {
            self.tree.state.triggers.fire(&key, old.as_deref(), value);
        }
        Ok(old)
    }

    /// Stores and also commits the enclosing transaction's redo intent.
    /// Redo logging lives with replication; structurally this is a
    /// store.
    pub fn commit(&mut self, value: Option<&[u8]>) -> KeelResult<Option<Vec<u8>>> {
        self.store(value)
    }

    /// Moves the current entry into `target`'s tree, deleting it here.
    pub fn transfer_to(&mut self, target: &mut TreeCursor) -> KeelResult<bool> {
        let Some(key) = self.key.clone() else {
            return Ok(false);
        };
        let Some(value) = self.load()? else {
            return Ok(false);
        };
        target.find(&key)?;
        target.store(Some(&value))?;
        self.store(None)?;
        Ok(true)
    }

    fn take_old_value(
        &self,
        leaf: &NodeWriteGuard,
        i: usize,
        free_key: bool,
    ) -> KeelResult<Vec<u8>> {
        let frags = &self.tree.db.core.frags;
        let old = leaf.value_at(i).to_vec(frags)?;
        // Out-of-line chains of a removed field go back to the free
        // list, rollback-protected.
        if let Field::Fragmented { len, first_page } = leaf.value_at(i) {
            frags.free(first_page, len)?;
        }
        if free_key {
            if let Field::Fragmented { len, first_page } = leaf.key_at(i) {
                frags.free(first_page, len)?;
            }
        }
        Ok(old)
    }

    fn sync_leaf_frame(&mut self, leaf: &NodeWriteGuard, pos: usize) {
        if let Some(frame) = self.frames.last_mut() {
            frame.pos = pos;
            frame.version = leaf.version;
        }
    }

    /// Write-latches the whole path hand-over-hand, dirtying each node
    /// copy-on-write and rewriting child ids top-down. Returns the leaf
    /// guard, or `None` when a frame drifted and the caller must
    /// re-descend.
    pub(crate) fn dirty_path(&mut self) -> KeelResult<Option<NodeWriteGuard>> {
        let core = &self.tree.db.core;
        let mut parent: Option<NodeWriteGuard> = None;
        for depth in 0..self.frames.len() {
            let node = Arc::clone(&self.frames[depth].node);
            let mut guard = node.write();
            if guard.version != self.frames[depth].version
                || guard.is_stub()
                || guard.split.is_some()
            {
                return Ok(None);
            }
            if depth > 0 {
                // A frame bound through an in-flight split references a
                // sibling its parent does not link yet. Wait it out.
                let linked = parent
                    .as_ref()
                    .expect("parent guard held while validating a child")
                    .child_at(self.frames[depth - 1].pos);
                if linked != node.id() {
                    return Ok(None);
                }
            }
            if !guard.dirty {
                let old = node.id();
                let new = core.pagedb.alloc_page()?;
                core.pagedb.delete_page(old)?;
                core.map.rekey(old, new);
                node.set_id(new);
                guard.dirty = true;
                if depth > 0 {
                    let pos = self.frames[depth - 1].pos;
                    parent
                        .as_mut()
                        .expect("parent guard held while dirtying a child")
                        .set_child_at(pos, new);
                }
            }
            if depth == self.frames.len() - 1 {
                return Ok(Some(guard));
            }
            parent = Some(guard);
        }
        Ok(None)
    }

    /// Splits the leaf around the insertion, installs the descriptor,
    /// inserts the entry into the proper half, and lets the ancestors
    /// absorb the split.
    fn split_insert(
        &mut self,
        mut leaf: NodeWriteGuard,
        insert_pos: usize,
        key_field: &[u8],
        value_field: &[u8],
    ) -> KeelResult<()> {
        let db = self.tree.db.clone();
        let core = &db.core;
        let frags = &core.frags;
        let incoming = key_field.len() + value_field.len();

        let sibling_page = core.pagedb.alloc_page()?;
        let sibling = Node::new(
            sibling_page,
            vec![0u8; core.config.page_size].into_boxed_slice(),
            true,
        );
        {
            let mut sibling_guard = sibling.write();
            let separator = leaf.split_leaf(&mut sibling_guard, insert_pos, incoming);

            // The incoming entry lands on whichever side its key
            // sorts into.
            let key = field_bytes(key_field, frags)?;
            let go_right =
                compare_field_key(&separator, 0, &key, frags)? != CmpOrdering::Greater;
            let target = if go_right { &mut *sibling_guard } else { &mut *leaf };
            let search = target.binary_search(&key, frags)?;
            let at = search.unwrap_err();
            let size = key_field.len() + value_field.len();
            if !target.fits(size) {
                target.compact();
            }
            target.leaf_insert(at, key_field, value_field);

            leaf.split = Some(Split {
                sibling: Arc::clone(&sibling),
                separator,
                sibling_on_left: false,
            });
        }
        core.map.insert(Arc::clone(&sibling));
        drop(leaf);

        self.finish_split_at(self.frames.len() - 1)
    }

    /// Absorbs the split at `depth` into its parent, splitting the
    /// parent in turn when it lacks room.
    pub(crate) fn finish_split_at(&mut self, depth: usize) -> KeelResult<()> {
        let core = self.tree.db.clone();
        let frags = &core.core.frags;
        let mut depth = depth;
        loop {
            if depth == 0 {
                return self.finish_split_root();
            }
            let parent = Arc::clone(&self.frames[depth - 1].node);
            let child = Arc::clone(&self.frames[depth].node);

            let mut parent_guard = parent.write();
            if parent_guard.split.is_some() {
                drop(parent_guard);
                self.finish_split_at(depth - 1)?;
                continue;
            }
            let mut child_guard = child.write();
            let Some(split) = child_guard.split.take() else {
                return Ok(());
            };

            let separator_key = field_bytes(&split.separator, frags)?;
            let key_index = match parent_guard.binary_search(&separator_key, frags)? {
                Ok(i) => i,
                Err(i) => i,
            };

            let parent_drifted = !parent_guard.is_internal()
                || parent_guard.is_stub()
                || parent_guard.child_at(key_index) != child.id();
            if parent_drifted {
                // The frame stack no longer names the holder's parent.
                // Descending by the separator routes through the
                // holder's descriptor, so the stack ends at its true
                // parent with the sibling below it; rebind the last
                // frame to the holder and retry there.
                child_guard.split = Some(split);
                drop(child_guard);
                drop(parent_guard);
                let guard = self.descend(&separator_key)?;
                drop(guard);
                let last = self.frames.len() - 1;
                let pos = self.frames[last].pos;
                self.frames[last] = Frame {
                    node: Arc::clone(&child),
                    pos,
                    version: 0,
                };
                depth = last;
                continue;
            }

            let space = split.separator.len() + 8;
            if !parent_guard.fits(space) {
                if parent_guard.could_fit(space) {
                    parent_guard.compact();
                } else {
                    // The parent splits too; the separator goes into
                    // whichever half covers it.
                    let parent_sibling_page = core.core.pagedb.alloc_page()?;
                    let parent_sibling = Node::new(
                        parent_sibling_page,
                        vec![0u8; core.core.config.page_size].into_boxed_slice(),
                        true,
                    );
                    {
                        let mut ps_guard = parent_sibling.write();
                        let upper_separator = parent_guard.split_internal(&mut ps_guard);
                        let go_right = compare_field_key(
                            &upper_separator,
                            0,
                            &separator_key,
                            frags,
                        )? != CmpOrdering::Greater;
                        let target = if go_right {
                            &mut *ps_guard
                        } else {
                            &mut *parent_guard
                        };
                        let at = match target.binary_search(&separator_key, frags)? {
                            Ok(i) => i,
                            Err(i) => i,
                        };
                        if !target.fits(space) {
                            target.compact();
                        }
                        insert_split_child_ref(target, at, &split, &child);
                        parent_guard.split = Some(Split {
                            sibling: Arc::clone(&parent_sibling),
                            separator: upper_separator,
                            sibling_on_left: false,
                        });
                    }
                    core.core.map.insert(parent_sibling);
                    drop(child_guard);
                    drop(parent_guard);
                    depth -= 1;
                    continue;
                }
            }

            insert_split_child_ref(&mut parent_guard, key_index, &split, &child);
            return Ok(());
        }
    }

    /// Grows the tree by one level: the root's content moves into a
    /// fresh child and the root is rewritten as an internal node over
    /// the two halves. Any stub from an earlier shrink is relatched
    /// first, in canonical order, and consumed.
    fn finish_split_root(&mut self) -> KeelResult<()> {
        let core = self.tree.db.clone();
        let root = self.tree.root_node()?;
        loop {
            let stub = self.tree.state.stub_tail.lock().last().cloned();
            let mut root_guard = root.write();
            if root_guard.split.is_none() {
                return Ok(());
            }

            let stub_guard = match &stub {
                None => None,
                Some(stub_node) => match stub_node.try_write() {
                    Some(guard) => Some(guard),
                    None => {
                        // Canonical order is stub first. Back off and
                        // retry in order, revalidating for drift.
                        drop(root_guard);
                        let guard = stub_node.write();
                        drop(guard);
                        continue;
                    }
                },
            };
            if let Some(mut stub_guard) = stub_guard {
                stub_guard.version += 1;
                let consumed = self.tree.state.stub_tail.lock().pop();
                drop(consumed);
            }

            let split = root_guard.split.take().expect("checked above");
            let left_page = core.core.pagedb.alloc_page()?;
            let old_content = root_guard.take_page_leaving_stub();
            let left = Node::new(left_page, old_content, true);

            root_guard.reformat(TYPE_INTERNAL | LOW_EXTREMITY | HIGH_EXTREMITY);
            root_guard.dirty = true;
            if split.sibling_on_left {
                root_guard.set_leftmost_child(split.sibling.id());
                root_guard.internal_insert(0, &split.separator, left_page);
            } else {
                root_guard.set_leftmost_child(left_page);
                root_guard.internal_insert(0, &split.separator, split.sibling.id());
            }
            core.core.map.insert(left);
            return Ok(());
        }
    }

    /// After a delete, opportunistically merges an under-filled leaf
    /// with a sibling. Every latch here is a try-acquire; contention
    /// just skips the rebalance.
    fn rebalance_after_delete(&mut self, leaf: NodeWriteGuard) -> KeelResult<()> {
        let core = self.tree.db.clone();
        let capacity = core.core.config.page_size - NODE_HEADER_SIZE;
        if leaf.used_bytes() * 4 >= capacity || self.frames.len() < 2 {
            return Ok(());
        }

        let parent_frame_pos = self.frames.len() - 2;
        let parent = Arc::clone(&self.frames[parent_frame_pos].node);
        let Some(mut parent_guard) = parent.try_write() else {
            return Ok(());
        };
        if parent_guard.version != self.frames[parent_frame_pos].version
            || parent_guard.split.is_some()
            || !parent_guard.dirty
        {
            return Ok(());
        }

        let pos = self.frames[parent_frame_pos].pos;
        let count = parent_guard.entry_count();
        // Merge with the right sibling when one exists, else the left.
        let (left_pos, right_pos) = if pos < count {
            (pos, pos + 1)
        } else if pos > 0 {
            (pos - 1, pos)
        } else {
            return Ok(());
        };

        let leaf_node = Arc::clone(&self.frames.last().unwrap().node);
        let merge_into_self = left_pos == pos;
        let other_id = parent_guard.child_at(if merge_into_self { right_pos } else { left_pos });
        let other = self.tree.load_child(other_id)?;
        let Some(mut other_guard) = other.try_write() else {
            return Ok(());
        };
        if other_guard.split.is_some() || !other_guard.is_leaf() {
            return Ok(());
        }

        let (mut left_guard, left_node, mut right_guard, right_node) = if merge_into_self {
            (leaf, leaf_node, other_guard, other)
        } else {
            (other_guard, other, leaf, leaf_node)
        };

        // Both halves must fit one page after the merge.
        if left_guard.used_bytes() + right_guard.used_bytes() > capacity {
            return Ok(());
        }

        // The surviving left node must be dirty; the path guarantees it
        // only when it is the cursor's own leaf.
        if !left_guard.dirty {
            let old = left_node.id();
            let new = core.core.pagedb.alloc_page()?;
            core.core.pagedb.delete_page(old)?;
            core.core.map.rekey(old, new);
            left_node.set_id(new);
            left_guard.dirty = true;
            parent_guard.set_child_at(left_pos, new);
        }

        left_guard.merge_leaf_from(&mut right_guard);
        let right_id = right_node.id();
        right_guard.reformat(crate::node::TYPE_STUB);
        drop(right_guard);
        core.core.map.remove(right_id);
        core.core.pagedb.delete_page(right_id)?;

        // The separator left of the right child goes away.
        parent_guard.delete_entry(right_pos - 1);

        // Root shrink: a root left with zero separators adopts its
        // single child and leaves a stub for bound cursors.
        if parent_frame_pos == 0 && parent_guard.entry_count() == 0 {
            drop(left_guard);
            self.root_delete(parent_guard)?;
        }
        self.frames.clear();
        Ok(())
    }

    /// Replaces the root's backing page with its lone child's, pushing
    /// a stub preserving the child's identity onto the stub list.
    fn root_delete(&mut self, mut root_guard: NodeWriteGuard) -> KeelResult<()> {
        let core = self.tree.db.clone();
        let child_id = root_guard.leftmost_child();
        let child = self.tree.load_child(child_id)?;
        let mut child_guard = child.write();

        let content = child_guard.take_page_leaving_stub();
        drop(child_guard);
        root_guard.replace_page(content);
        root_guard.set_type_bits(LOW_EXTREMITY | HIGH_EXTREMITY);
        root_guard.dirty = true;
        drop(root_guard);

        core.core.map.remove(child_id);
        core.core.pagedb.delete_page(child_id)?;
        self.tree.state.stub_tail.lock().push(child);
        Ok(())
    }

    /// One compaction pass over every leaf, reclaiming garbage bytes.
    pub(crate) fn compact_pass(&mut self) -> KeelResult<()> {
        let pagedb = Arc::clone(&self.tree.db.core.pagedb);
        let mut positioned = self.first()?;
        let mut last_leaf: Option<PageId> = None;
        while positioned {
            let leaf_id = self.leaf_page_id();
            if leaf_id != last_leaf {
                last_leaf = leaf_id;
                let key = self.key.clone().expect("positioned");
                let _commit_guard = pagedb.commit_lock_shared();
                let guard = self.descend(&key)?;
                let garbage = guard.garbage();
                drop(guard);
                if garbage > 0 {
                    if let Some(mut leaf) = self.dirty_path()? {
                        leaf.compact();
                    }
                }
            }
            positioned = self.next()?;
        }
        Ok(())
    }
}

/// Inserts the separator and sibling reference of a finished split
/// into an internal node at `key_index`.
fn insert_split_child_ref(
    parent: &mut NodeInner,
    key_index: usize,
    split: &Split,
    child: &Arc<Node>,
) {
    if split.sibling_on_left {
        // Sibling holds the low half: it takes the child's old slot and
        // the child moves right of the new separator.
        parent.internal_insert(key_index, &split.separator, child.id());
        parent.set_child_at(key_index, split.sibling.id());
    } else {
        parent.internal_insert(key_index, &split.separator, split.sibling.id());
    }
}

/// Materializes an encoded key field.
fn field_bytes(field: &[u8], frags: &crate::frag::FragmentStore) -> KeelResult<Vec<u8>> {
    let (parsed, _) = crate::node::parse_field(field, 0);
    parsed.to_vec(frags)
}

/// Encodes a key field, spilling oversized keys into a fragment chain.
fn build_key_field(
    frags: &crate::frag::FragmentStore,
    key: &[u8],
    max_inline_key: usize,
) -> KeelResult<Vec<u8>> {
    if key.len() <= max_inline_key {
        Ok(encode_inline(key))
    } else {
        let first = frags.write_new(key)?;
        Ok(encode_fragmented(key.len() as u64, first))
    }
}
