//! The database facade.
//!
//! A [`Database`] owns the page store, the node cache, the lock
//! manager, and the reserved internal trees: the registry (tree id 0)
//! maps tree ids to root pages, and the registry key map (tree id 1)
//! maps names to ids. Ids 2 and 3 are reserved for the cursor registry
//! and the fragmented trash. User trees are assigned ids from 256 up.
//!
//! The registry and key-map roots themselves are anchored in the page
//! database's 256-byte extra commit block, which breaks the
//! chicken-and-egg of registering the registry.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use keel_common::config::DbConfig;
use keel_common::error::{KeelError, KeelResult};
use keel_common::types::{PageId, TreeId};
use keel_store::PageDb;
use keel_txn::LockManager;

use crate::frag::FragmentStore;
use crate::map::NodeMap;
use crate::node::{Node, LOW_EXTREMITY, HIGH_EXTREMITY};
use crate::tree::{Tree, TreeState};

const EXTRA_REGISTRY_ROOT: usize = 0;
const EXTRA_KEY_MAP_ROOT: usize = 8;
const EXTRA_NEXT_TREE_ID: usize = 16;

pub(crate) struct DbCore {
    pub(crate) config: DbConfig,
    pub(crate) pagedb: Arc<PageDb>,
    pub(crate) frags: FragmentStore,
    pub(crate) map: NodeMap,
    pub(crate) locks: LockManager,
    pub(crate) registry: Arc<TreeState>,
    pub(crate) key_map: Arc<TreeState>,
    trees: Mutex<HashMap<u64, Arc<TreeState>>>,
    temp_trees: Mutex<HashSet<u64>>,
    next_tree_id: AtomicU64,
    /// Serializes name lookups against tree creation.
    open_lock: Mutex<()>,
    checkpoint_lock: Mutex<()>,
    pub(crate) closed: AtomicBool,
}

/// An open KeelDB database.
#[derive(Clone)]
pub struct Database {
    pub(crate) core: Arc<DbCore>,
}

impl Database {
    /// Opens (creating as needed) a database in `dir`.
    pub fn open(dir: impl AsRef<Path>, config: DbConfig) -> KeelResult<Database> {
        config.validate()?;
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let pagedb = Arc::new(PageDb::open(dir.join("keel.db"), &config, false)?);
        let extra = pagedb.extra_commit_data();
        let registry_root = u64::from_le_bytes(
            extra[EXTRA_REGISTRY_ROOT..EXTRA_REGISTRY_ROOT + 8]
                .try_into()
                .unwrap(),
        );
        let fresh = registry_root == 0;

        let map = NodeMap::new(config.max_cached_nodes);
        let frags = FragmentStore::new(Arc::clone(&pagedb));
        let page_size = config.page_size;

        let (registry, key_map, next_id) = if fresh {
            let registry = TreeState::new(
                TreeId::REGISTRY,
                None,
                Node::new_leaf(pagedb.alloc_page()?, page_size, LOW_EXTREMITY | HIGH_EXTREMITY),
            );
            let key_map = TreeState::new(
                TreeId::REGISTRY_KEY_MAP,
                None,
                Node::new_leaf(pagedb.alloc_page()?, page_size, LOW_EXTREMITY | HIGH_EXTREMITY),
            );
            (registry, key_map, TreeId::FIRST_USER.as_u64())
        } else {
            let key_map_root = u64::from_le_bytes(
                extra[EXTRA_KEY_MAP_ROOT..EXTRA_KEY_MAP_ROOT + 8]
                    .try_into()
                    .unwrap(),
            );
            let next_id = u64::from_le_bytes(
                extra[EXTRA_NEXT_TREE_ID..EXTRA_NEXT_TREE_ID + 8]
                    .try_into()
                    .unwrap(),
            );
            let registry = TreeState::new(
                TreeId::REGISTRY,
                None,
                load_node(&pagedb, PageId::new(registry_root), page_size)?,
            );
            let key_map = TreeState::new(
                TreeId::REGISTRY_KEY_MAP,
                None,
                load_node(&pagedb, PageId::new(key_map_root), page_size)?,
            );
            (registry, key_map, next_id)
        };

        map.insert(registry.root());
        map.insert(key_map.root());

        let core = Arc::new(DbCore {
            config,
            pagedb,
            frags,
            map,
            locks: LockManager::new(),
            registry,
            key_map,
            trees: Mutex::new(HashMap::new()),
            temp_trees: Mutex::new(HashSet::new()),
            next_tree_id: AtomicU64::new(next_id),
            open_lock: Mutex::new(()),
            checkpoint_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        });

        let db = Database { core };
        if fresh {
            db.checkpoint()?;
            info!("created fresh database");
        } else {
            debug!(
                commit_number = db.core.pagedb.commit_number(),
                "opened database"
            );
        }
        Ok(db)
    }

    fn check_open(&self) -> KeelResult<()> {
        if self.core.closed.load(Ordering::Acquire) {
            return Err(KeelError::Closed);
        }
        Ok(())
    }

    /// Returns the lock manager transactions lock keys through.
    #[must_use]
    pub fn lock_manager(&self) -> &LockManager {
        &self.core.locks
    }

    /// Returns the underlying page database.
    #[must_use]
    pub fn page_db(&self) -> &Arc<PageDb> {
        &self.core.pagedb
    }

    fn registry_tree(&self) -> Tree {
        Tree::internal_handle(self, Arc::clone(&self.core.registry))
    }

    fn key_map_tree(&self) -> Tree {
        Tree::internal_handle(self, Arc::clone(&self.core.key_map))
    }

    /// Opens (creating as needed) the named tree.
    pub fn open_tree(&self, name: &[u8]) -> KeelResult<Tree> {
        self.check_open()?;
        if name.is_empty() {
            return Err(KeelError::invalid_argument("tree name must not be empty"));
        }
        let _guard = self.core.open_lock.lock();

        let key_map = self.key_map_tree();
        if let Some(id_bytes) = key_map.load(None, name)? {
            let id = u64::from_be_bytes(id_bytes.as_slice().try_into().map_err(|_| {
                KeelError::corruption("registry key map holds a malformed tree id")
            })?);
            return self.open_tree_by_id(TreeId::new(id), Some(name));
        }

        // New tree: assign an id, seed an empty root, register both ways.
        let id = TreeId::new(self.core.next_tree_id.fetch_add(1, Ordering::Relaxed));
        let root = Node::new_leaf(
            self.core.pagedb.alloc_page()?,
            self.core.config.page_size,
            LOW_EXTREMITY | HIGH_EXTREMITY,
        );
        self.core.map.insert(Arc::clone(&root));

        let registry = self.registry_tree();
        registry.store(None, &id.to_be_bytes(), Some(&root.id().as_u64().to_le_bytes()))?;
        key_map.store(None, name, Some(&id.to_be_bytes()))?;

        let state = TreeState::new(id, Some(name.into()), root);
        self.core
            .trees
            .lock()
            .insert(id.as_u64(), Arc::clone(&state));
        debug!(id = id.as_u64(), "created tree");
        Ok(Tree::internal_handle(self, state))
    }

    fn open_tree_by_id(&self, id: TreeId, name: Option<&[u8]>) -> KeelResult<Tree> {
        if let Some(state) = self.core.trees.lock().get(&id.as_u64()) {
            return Ok(Tree::internal_handle(self, Arc::clone(state)));
        }

        let registry = self.registry_tree();
        let root_bytes = registry.load(None, &id.to_be_bytes())?.ok_or_else(|| {
            KeelError::corruption(format!("tree {} is named but not registered", id))
        })?;
        let root_id = u64::from_le_bytes(root_bytes.as_slice().try_into().map_err(|_| {
            KeelError::corruption("registry holds a malformed root page id")
        })?);

        let root = match self.core.map.get(PageId::new(root_id)) {
            Some(node) => node,
            None => {
                let node = load_node(
                    &self.core.pagedb,
                    PageId::new(root_id),
                    self.core.config.page_size,
                )?;
                self.core.map.insert(Arc::clone(&node));
                node
            }
        };

        let state = TreeState::new(id, name.map(Into::into), root);
        let state = {
            let mut trees = self.core.trees.lock();
            trees
                .entry(id.as_u64())
                .or_insert_with(|| Arc::clone(&state))
                .clone()
        };
        Ok(Tree::internal_handle(self, state))
    }

    /// Creates an unnamed temporary tree. Temporary trees are never
    /// registered and their pages are reclaimed when they are deleted
    /// or the database reopens.
    pub fn create_temp_tree(&self) -> KeelResult<Tree> {
        self.check_open()?;
        let id = TreeId::new(self.core.next_tree_id.fetch_add(1, Ordering::Relaxed));
        let root = Node::new_leaf(
            self.core.pagedb.alloc_page()?,
            self.core.config.page_size,
            LOW_EXTREMITY | HIGH_EXTREMITY,
        );
        self.core.map.insert(Arc::clone(&root));
        self.core.temp_trees.lock().insert(id.as_u64());
        let state = TreeState::new(id, None, root);
        self.core
            .trees
            .lock()
            .insert(id.as_u64(), Arc::clone(&state));
        Ok(Tree::internal_handle(self, state))
    }

    pub(crate) fn forget_temp_tree(&self, id: TreeId) {
        self.core.temp_trees.lock().remove(&id.as_u64());
        self.core.trees.lock().remove(&id.as_u64());
    }

    pub(crate) fn forget_tree(&self, id: TreeId) {
        self.core.trees.lock().remove(&id.as_u64());
    }

    /// Checkpoints: flushes every dirty node, records tree roots in the
    /// registry, and commits the page database. Returns the new commit
    /// number.
    ///
    /// The flush runs inside the commit callback, past the quiescent
    /// point, so no store operation is mid-flight and the extra block
    /// records the registry roots as flushed.
    pub fn checkpoint(&self) -> KeelResult<u32> {
        self.check_open()?;
        let _guard = self.core.checkpoint_lock.lock();

        let db = self.clone();
        let callback = move || -> KeelResult<Option<Vec<u8>>> {
            let registry = db.registry_tree();
            loop {
                // Record current roots of named trees; update is a
                // no-op when the root page has not moved.
                let states: Vec<Arc<TreeState>> =
                    db.core.trees.lock().values().cloned().collect();
                let mut changed = false;
                for state in states {
                    if state.is_closed() || db.is_temp(state.id) {
                        continue;
                    }
                    let root_id = state.root().id().as_u64();
                    changed |= registry.update(
                        None,
                        &state.id.to_be_bytes(),
                        Some(&root_id.to_le_bytes()),
                    )?;
                }
                let flushed = db.core.map.flush_dirty(&db.core.pagedb)?;
                if flushed == 0 && !changed {
                    break;
                }
            }

            let mut extra = vec![0u8; 24];
            extra[EXTRA_REGISTRY_ROOT..EXTRA_REGISTRY_ROOT + 8]
                .copy_from_slice(&db.core.registry.root().id().as_u64().to_le_bytes());
            extra[EXTRA_KEY_MAP_ROOT..EXTRA_KEY_MAP_ROOT + 8]
                .copy_from_slice(&db.core.key_map.root().id().as_u64().to_le_bytes());
            extra[EXTRA_NEXT_TREE_ID..EXTRA_NEXT_TREE_ID + 8]
                .copy_from_slice(&db.core.next_tree_id.load(Ordering::Relaxed).to_le_bytes());
            Ok(Some(extra))
        };

        self.core.pagedb.commit(None, Some(&callback))
    }

    pub(crate) fn is_temp(&self, id: TreeId) -> bool {
        self.core.temp_trees.lock().contains(&id.as_u64())
    }

    /// Closes the database. Open trees and cursors fail afterwards.
    pub fn close(&self) -> KeelResult<()> {
        self.core.closed.store(true, Ordering::Release);
        for state in self.core.trees.lock().values() {
            state.close();
        }
        self.core.pagedb.close()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("commit_number", &self.core.pagedb.commit_number())
            .field("cached_nodes", &self.core.map.len())
            .finish()
    }
}

pub(crate) fn load_node(
    pagedb: &PageDb,
    id: PageId,
    page_size: usize,
) -> KeelResult<Arc<Node>> {
    let mut page = vec![0u8; page_size].into_boxed_slice();
    pagedb.read_page(id, &mut page)?;
    Ok(Node::new(id, page, false))
}
