//! Tree-level operations.
//!
//! A [`Tree`] is a handle onto one B+ tree in the database. The root
//! node object is stable: height changes rewrite the root in place
//! rather than reparenting, so concurrent cursors revalidate against
//! node versions instead of chasing a moving root. Stubs left behind
//! by root shrinks live in the tree's stub list until the next root
//! split consumes them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use keel_common::error::{KeelError, KeelResult};
use keel_common::types::{PageId, TreeId};
use keel_txn::Txn;

use crate::cursor::TreeCursor;
use crate::db::{load_node, Database};
use crate::node::Node;
use crate::trigger::{Trigger, TriggerList};
use crate::view::{Bound, BoundedView};

/// Shared state of one open tree.
pub(crate) struct TreeState {
    pub(crate) id: TreeId,
    pub(crate) name: Option<Box<[u8]>>,
    root: RwLock<Arc<Node>>,
    pub(crate) stub_tail: Mutex<Vec<Arc<Node>>>,
    pub(crate) triggers: TriggerList,
    closed: AtomicBool,
}

impl TreeState {
    pub(crate) fn new(id: TreeId, name: Option<Box<[u8]>>, root: Arc<Node>) -> Arc<TreeState> {
        Arc::new(TreeState {
            id,
            name,
            root: RwLock::new(root),
            stub_tail: Mutex::new(Vec::new()),
            triggers: TriggerList::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn root(&self) -> Arc<Node> {
        Arc::clone(&self.root.read())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Statistics gathered by [`Tree::analyze`].
#[derive(Debug, Clone, Default)]
pub struct TreeStats {
    /// Estimated number of entries.
    pub entry_count: u64,
    /// Height of the tree (1 for a lone leaf).
    pub height: usize,
    /// Average fanout observed on the probed paths.
    pub avg_fanout: f64,
}

/// Observes a [`Tree::verify`] walk.
pub trait VerifyObserver {
    /// Called for every node. Return false to stop the walk.
    fn node(&mut self, id: PageId, depth: usize, entries: usize) -> bool {
        let _ = (id, depth, entries);
        true
    }

    /// Called when an invariant is violated.
    fn fail(&mut self, id: PageId, message: &str);
}

/// A handle onto one B+ tree.
#[derive(Clone)]
pub struct Tree {
    pub(crate) db: Database,
    pub(crate) state: Arc<TreeState>,
}

impl Tree {
    pub(crate) fn internal_handle(db: &Database, state: Arc<TreeState>) -> Tree {
        Tree {
            db: db.clone(),
            state,
        }
    }

    /// Returns the tree id.
    #[must_use]
    pub fn id(&self) -> TreeId {
        self.state.id
    }

    /// Returns the tree name, if it has one.
    #[must_use]
    pub fn name(&self) -> Option<&[u8]> {
        self.state.name.as_deref()
    }

    /// Returns true once the tree (or its database) is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.is_closed() || self.db.core.closed.load(Ordering::Acquire)
    }

    /// Returns true: every store to this tree is atomic with respect
    /// to readers.
    #[must_use]
    pub fn is_modify_atomic(&self) -> bool {
        true
    }

    /// Returns the stable root node, failing on a closed tree.
    pub(crate) fn root_node(&self) -> KeelResult<Arc<Node>> {
        if self.is_closed() {
            return Err(KeelError::ClosedIndex);
        }
        Ok(self.state.root())
    }

    /// Loads a child node through the cache, reading from disk on a
    /// miss. Runs an eviction pass when the cache is over budget.
    pub(crate) fn load_child(&self, id: PageId) -> KeelResult<Arc<Node>> {
        if let Some(node) = self.db.core.map.get(id) {
            return Ok(node);
        }
        let node = load_node(&self.db.core.pagedb, id, self.db.core.config.page_size)?;
        self.db.core.map.insert(Arc::clone(&node));
        if self.db.core.map.over_budget() {
            self.db.core.map.evict_excess(&self.db.core.pagedb)?;
        }
        Ok(node)
    }

    pub(crate) fn check_key(&self, key: &[u8]) -> KeelResult<()> {
        if key.is_empty() {
            return Err(KeelError::invalid_argument("key must not be empty"));
        }
        Ok(())
    }

    /// Opens a cursor. The transaction controls locking; `None` reads
    /// and writes lock-free.
    #[must_use]
    pub fn new_cursor(&self, txn: Option<&Txn>) -> TreeCursor {
        TreeCursor::new(self.clone(), txn.cloned())
    }

    /// Loads the value for a key.
    pub fn load(&self, txn: Option<&Txn>, key: &[u8]) -> KeelResult<Option<Vec<u8>>> {
        self.check_key(key)?;
        let mut cursor = self.new_cursor(txn);
        cursor.find(key)?;
        cursor.load()
    }

    /// Returns true if the key exists.
    pub fn exists(&self, txn: Option<&Txn>, key: &[u8]) -> KeelResult<bool> {
        Ok(self.load(txn, key)?.is_some())
    }

    /// Stores a value; `None` deletes.
    pub fn store(&self, txn: Option<&Txn>, key: &[u8], value: Option<&[u8]>) -> KeelResult<()> {
        self.check_key(key)?;
        let mut cursor = self.new_cursor(txn);
        cursor.find(key)?;
        cursor.store(value)?;
        Ok(())
    }

    /// Stores a value and returns the previous one.
    pub fn exchange(
        &self,
        txn: Option<&Txn>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> KeelResult<Option<Vec<u8>>> {
        self.check_key(key)?;
        let mut cursor = self.new_cursor(txn);
        cursor.find(key)?;
        cursor.store(value)
    }

    /// Inserts only if the key is absent. Returns false when it exists.
    pub fn insert(&self, txn: Option<&Txn>, key: &[u8], value: &[u8]) -> KeelResult<bool> {
        self.check_key(key)?;
        let mut cursor = self.new_cursor(txn);
        cursor.find(key)?;
        if cursor.exists()? {
            return Ok(false);
        }
        cursor.store(Some(value))?;
        Ok(true)
    }

    /// Replaces only if the key is present. Returns false when absent.
    pub fn replace(&self, txn: Option<&Txn>, key: &[u8], value: &[u8]) -> KeelResult<bool> {
        self.check_key(key)?;
        let mut cursor = self.new_cursor(txn);
        cursor.find(key)?;
        if !cursor.exists()? {
            return Ok(false);
        }
        cursor.store(Some(value))?;
        Ok(true)
    }

    /// Stores unless the value is already identical. Returns true when
    /// anything changed.
    pub fn update(
        &self,
        txn: Option<&Txn>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> KeelResult<bool> {
        self.check_key(key)?;
        let mut cursor = self.new_cursor(txn);
        cursor.find(key)?;
        let current = cursor.load()?;
        if current.as_deref() == value {
            return Ok(false);
        }
        cursor.store(value)?;
        Ok(true)
    }

    /// Deletes a key. Returns true if it existed.
    pub fn delete(&self, txn: Option<&Txn>, key: &[u8]) -> KeelResult<bool> {
        Ok(self.exchange(txn, key, None)?.is_some())
    }

    /// Counts entries in `[low, high)`; open bounds when `None`.
    pub fn count(&self, low: Option<&[u8]>, high: Option<&[u8]>) -> KeelResult<u64> {
        let mut cursor = self.new_cursor(None);
        let mut count = 0u64;
        let mut positioned = match low {
            Some(low) => cursor.find_ge(low)?,
            None => cursor.first()?,
        };
        while positioned {
            if let Some(high) = high {
                if cursor.key().map_or(true, |k| k >= high) {
                    break;
                }
            }
            count += 1;
            positioned = cursor.next()?;
        }
        Ok(count)
    }

    /// Walks `[low, high)` evicting clean, unreferenced nodes from the
    /// cache. Returns how many nodes were dropped.
    pub fn evict(&self, low: Option<&[u8]>, high: Option<&[u8]>) -> KeelResult<usize> {
        let mut cursor = self.new_cursor(None);
        let mut positioned = match low {
            Some(low) => cursor.find_ge(low)?,
            None => cursor.first()?,
        };
        let mut evicted = 0;
        let mut last_leaf: Option<PageId> = None;
        while positioned {
            if let Some(high) = high {
                if cursor.key().map_or(true, |k| k >= high) {
                    break;
                }
            }
            let leaf = cursor.leaf_page_id();
            if last_leaf != leaf {
                if let Some(prev) = last_leaf {
                    evicted += self.try_unload(prev);
                }
                last_leaf = leaf;
            }
            positioned = cursor.next()?;
        }
        cursor.reset();
        if let Some(prev) = last_leaf {
            evicted += self.try_unload(prev);
        }
        Ok(evicted)
    }

    fn try_unload(&self, id: PageId) -> usize {
        let Some(node) = self.db.core.map.get(id) else {
            return 0;
        };
        // The map's reference plus ours; anything more is in use.
        if Arc::strong_count(&node) != 2 {
            return 0;
        }
        let Some(guard) = node.try_write() else {
            return 0;
        };
        if guard.dirty || guard.split.is_some() {
            return 0;
        }
        drop(guard);
        usize::from(self.db.core.map.remove(id).is_some())
    }

    /// Estimates tree statistics from `probes` random descents.
    pub fn analyze(&self, probes: usize) -> KeelResult<TreeStats> {
        let mut stats = TreeStats::default();
        let mut total_product = 0f64;
        let mut fanout_sum = 0f64;
        let mut fanout_n = 0usize;

        for _ in 0..probes.max(1) {
            let mut product = 1f64;
            let mut node = self.root_node()?;
            let mut depth = 1;
            loop {
                let guard = node.read();
                let count = guard.entry_count();
                if guard.is_leaf() {
                    product *= count as f64;
                    stats.height = stats.height.max(depth);
                    break;
                }
                let children = count + 1;
                product *= children as f64;
                fanout_sum += children as f64;
                fanout_n += 1;
                let pos = if children == 0 {
                    0
                } else {
                    rand::random::<usize>() % children
                };
                let child_id = guard.child_at(pos);
                drop(guard);
                node = self.load_child(child_id)?;
                depth += 1;
            }
            total_product += product;
        }
        stats.entry_count = (total_product / probes.max(1) as f64) as u64;
        stats.avg_fanout = if fanout_n == 0 {
            0.0
        } else {
            fanout_sum / fanout_n as f64
        };
        Ok(stats)
    }

    /// Verifies structural invariants, reporting through `observer`.
    /// Returns false if the walk was stopped or found a violation.
    pub fn verify(&self, observer: &mut dyn VerifyObserver) -> KeelResult<bool> {
        let root = self.root_node()?;
        let mut ok = true;
        self.verify_node(&root, None, None, 0, true, true, observer, &mut ok)?;
        Ok(ok)
    }

    #[allow(clippy::too_many_arguments)]
    fn verify_node(
        &self,
        node: &Arc<Node>,
        low: Option<Vec<u8>>,
        high: Option<Vec<u8>>,
        depth: usize,
        leftmost: bool,
        rightmost: bool,
        observer: &mut dyn VerifyObserver,
        ok: &mut bool,
    ) -> KeelResult<()> {
        let guard = node.read();
        let count = guard.entry_count();
        if !observer.node(node.id(), depth, count) {
            *ok = false;
            return Ok(());
        }

        if depth > 0 {
            if leftmost != guard.has_low_extremity() {
                observer.fail(node.id(), "low extremity bit does not match the path");
                *ok = false;
            }
            if rightmost != guard.has_high_extremity() {
                observer.fail(node.id(), "high extremity bit does not match the path");
                *ok = false;
            }
        }

        let frags = &self.db.core.frags;
        let mut prev: Option<Vec<u8>> = None;
        for i in 0..count {
            let key = guard.key_at(i).to_vec(frags)?;
            if let Some(prev) = &prev {
                if prev >= &key {
                    observer.fail(node.id(), "keys are not strictly increasing");
                    *ok = false;
                }
            }
            if let Some(low) = &low {
                if &key < low {
                    observer.fail(node.id(), "key below the separator bound");
                    *ok = false;
                }
            }
            if let Some(high) = &high {
                if &key >= high {
                    observer.fail(node.id(), "key at or above the separator bound");
                    *ok = false;
                }
            }
            prev = Some(key);
        }

        if guard.is_internal() {
            for pos in 0..=count {
                let child_low = if pos == 0 {
                    low.clone()
                } else {
                    Some(guard.key_at(pos - 1).to_vec(frags)?)
                };
                let child_high = if pos == count {
                    high.clone()
                } else {
                    Some(guard.key_at(pos).to_vec(frags)?)
                };
                let child = self.load_child(guard.child_at(pos))?;
                self.verify_node(
                    &child,
                    child_low,
                    child_high,
                    depth + 1,
                    leftmost && pos == 0,
                    rightmost && pos == count,
                    observer,
                    ok,
                )?;
            }
        }
        Ok(())
    }

    /// Compacts every leaf in place, reclaiming fragmented free space.
    pub fn compact(&self) -> KeelResult<()> {
        let mut cursor = self.new_cursor(None);
        cursor.compact_pass()
    }

    /// Closes the tree handle. Internal trees may not be closed.
    pub fn close(&self) -> KeelResult<()> {
        if self.state.id.is_internal() {
            return Err(KeelError::illegal_state(
                "internal trees cannot be closed directly",
            ));
        }
        self.state.close();
        self.db.forget_tree(self.state.id);
        Ok(())
    }

    /// Drops the tree. It must be empty.
    pub fn drop_tree(self) -> KeelResult<()> {
        if self.state.id.is_internal() {
            return Err(KeelError::illegal_state("internal trees cannot be dropped"));
        }
        {
            let mut cursor = self.new_cursor(None);
            if cursor.first()? {
                return Err(KeelError::illegal_state("tree is not empty"));
            }
        }

        let root = self.root_node()?;
        let root_id = root.id();
        let is_temp = self.db.is_temp(self.state.id);
        self.state.close();

        if is_temp {
            self.db.forget_temp_tree(self.state.id);
        } else {
            let registry = Tree::internal_handle(&self.db, Arc::clone(&self.db.core.registry));
            registry.store(None, &self.state.id.to_be_bytes(), None)?;
            if let Some(name) = &self.state.name {
                let key_map =
                    Tree::internal_handle(&self.db, Arc::clone(&self.db.core.key_map));
                key_map.store(None, name, None)?;
            }
            self.db.forget_tree(self.state.id);
        }

        self.db.core.map.remove(root_id);
        self.db.core.pagedb.delete_page(root_id)?;
        debug!(id = self.state.id.as_u64(), "dropped tree");
        Ok(())
    }

    /// Deletes every entry. Used for temporary tree teardown.
    pub fn delete_all(&self, txn: Option<&Txn>) -> KeelResult<u64> {
        let mut cursor = self.new_cursor(txn);
        let mut deleted = 0;
        while cursor.first()? {
            cursor.store(None)?;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Registers a trigger firing after each committed mutation.
    pub fn add_trigger(&self, trigger: Arc<dyn Trigger>) {
        self.state.triggers.add(trigger);
    }

    /// Unregisters a trigger. Returns true if it was registered.
    pub fn remove_trigger(&self, trigger: &Arc<dyn Trigger>) -> bool {
        self.state.triggers.remove(trigger)
    }

    /// View of keys `>= bound`.
    #[must_use]
    pub fn view_ge(&self, bound: &[u8]) -> BoundedView {
        BoundedView::new(self.clone(), Bound::inclusive(bound), Bound::open())
    }

    /// View of keys `> bound`.
    #[must_use]
    pub fn view_gt(&self, bound: &[u8]) -> BoundedView {
        BoundedView::new(self.clone(), Bound::exclusive(bound), Bound::open())
    }

    /// View of keys `<= bound`.
    #[must_use]
    pub fn view_le(&self, bound: &[u8]) -> BoundedView {
        BoundedView::new(self.clone(), Bound::open(), Bound::inclusive(bound))
    }

    /// View of keys `< bound`.
    #[must_use]
    pub fn view_lt(&self, bound: &[u8]) -> BoundedView {
        BoundedView::new(self.clone(), Bound::open(), Bound::exclusive(bound))
    }

    /// View of keys sharing `prefix`.
    #[must_use]
    pub fn view_prefix(&self, prefix: &[u8]) -> BoundedView {
        BoundedView::prefix(self.clone(), prefix)
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("id", &self.state.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
