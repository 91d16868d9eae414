//! Grafting temporary trees.
//!
//! [`graft_temp_trees`] joins two temporary trees whose key ranges are
//! disjoint and ordered: every key of the low tree precedes every key
//! of the high tree. The shorter tree's root is spliced into the
//! taller tree as a pending split at the height-matching level, the
//! split is absorbed upward, and the victim tree is deleted.
//!
//! [`TreeMerger`] runs grafts pairwise across worker threads to reduce
//! a set of pre-partitioned temporary trees into one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use keel_common::constants::NODE_HEADER_SIZE;
use keel_common::error::{KeelError, KeelResult};

use crate::db::Database;
use crate::node::{
    encode_fragmented, encode_inline, Split, HIGH_EXTREMITY, LOW_EXTREMITY, TYPE_STUB,
};
use crate::tree::Tree;

/// Receives the results of a [`TreeMerger`] run.
pub trait MergeHandler: Sync {
    /// Called once with the fully merged tree.
    fn merged(&self, tree: Tree);

    /// Called for each unmerged tree when the merger is stopped early.
    fn remainder(&self, tree: Tree);
}

/// Joins two temporary trees with `max(low) < min(high)` into one.
/// Returns the surviving tree; the other is deleted.
pub fn graft_temp_trees(db: &Database, low: Tree, high: Tree) -> KeelResult<Tree> {
    if !db.is_temp(low.id()) || !db.is_temp(high.id()) {
        return Err(KeelError::invalid_argument(
            "graft requires temporary trees",
        ));
    }

    let _commit_guard = db.page_db().commit_lock_shared();

    // Position at the boundary, dirtying each edge path so the splice
    // mutates copy-on-write pages only.
    let mut low_cursor = low.new_cursor(None);
    if !low_cursor.last()? {
        drop(low_cursor);
        delete_empty_temp(db, low)?;
        return Ok(high);
    }
    let mut high_cursor = high.new_cursor(None);
    if !high_cursor.first()? {
        drop(high_cursor);
        delete_empty_temp(db, high)?;
        return Ok(low);
    }

    loop {
        if let Some(guard) = low_cursor.dirty_path()? {
            drop(guard);
            break;
        }
        low_cursor.last()?;
    }
    loop {
        if let Some(guard) = high_cursor.dirty_path()? {
            drop(guard);
            break;
        }
        high_cursor.first()?;
    }

    let separator_key = high_cursor
        .key()
        .expect("high cursor is positioned")
        .to_vec();
    let separator = encode_separator(db, &separator_key)?;

    let low_height = low_cursor.frames.len();
    let high_height = high_cursor.frames.len();

    // Walking both stacks up in parallel, the shorter stack runs out
    // of parents first: its tree is the victim whose root is consumed.
    let (survivor, victim) = if low_height >= high_height {
        let attach_depth = low_height - high_height;
        // The low boundary path faces the graft; it is no longer the
        // tree's right edge below the attach level.
        for depth in attach_depth..low_height {
            let mut guard = low_cursor.frames[depth].node.write();
            guard.clear_type_bits(HIGH_EXTREMITY);
        }
        for depth in 0..high_height {
            let mut guard = high_cursor.frames[depth].node.write();
            guard.clear_type_bits(LOW_EXTREMITY);
        }

        let victim_root = high.root_node()?;
        {
            let node = Arc::clone(&low_cursor.frames[attach_depth].node);
            let mut guard = node.write();
            guard.split = Some(Split {
                sibling: victim_root,
                separator,
                sibling_on_left: false,
            });
        }
        low_cursor.frames.truncate(attach_depth + 1);
        low_cursor.finish_split_at(attach_depth)?;
        (low, high)
    } else {
        let attach_depth = high_height - low_height;
        for depth in attach_depth..high_height {
            let mut guard = high_cursor.frames[depth].node.write();
            guard.clear_type_bits(LOW_EXTREMITY);
        }
        for depth in 0..low_height {
            let mut guard = low_cursor.frames[depth].node.write();
            guard.clear_type_bits(HIGH_EXTREMITY);
        }

        let victim_root = low.root_node()?;
        {
            let node = Arc::clone(&high_cursor.frames[attach_depth].node);
            let mut guard = node.write();
            guard.split = Some(Split {
                sibling: victim_root,
                separator,
                sibling_on_left: true,
            });
        }
        high_cursor.frames.truncate(attach_depth + 1);
        high_cursor.finish_split_at(attach_depth)?;
        (high, low)
    };

    victim.state.close();
    db.forget_temp_tree(victim.id());
    debug!(
        survivor = survivor.id().as_u64(),
        victim = victim.id().as_u64(),
        "grafted temporary trees"
    );

    try_shrink_root(&survivor)?;
    Ok(survivor)
}

/// After a graft, an internal root holding a single separator over two
/// children that fit one page shrinks back by a level.
fn try_shrink_root(tree: &Tree) -> KeelResult<()> {
    let core = &tree.db.core;
    let capacity = core.config.page_size - NODE_HEADER_SIZE;

    let root = tree.root_node()?;
    let mut root_guard = root.write();
    if !root_guard.is_internal() || root_guard.entry_count() != 1 {
        return Ok(());
    }

    let left = tree.load_child(root_guard.child_at(0))?;
    let right = tree.load_child(root_guard.child_at(1))?;
    let mut left_guard = left.write();
    let mut right_guard = right.write();
    if left_guard.is_leaf() != right_guard.is_leaf() {
        return Ok(());
    }
    if left_guard.split.is_some() || right_guard.split.is_some() {
        return Ok(());
    }

    let separator_field = root_guard.raw_key_at(0).to_vec();
    let merged_bytes = if left_guard.is_leaf() {
        left_guard.used_bytes() + right_guard.used_bytes()
    } else {
        left_guard.used_bytes() + right_guard.used_bytes() + separator_field.len() + 10
    };
    if merged_bytes > capacity {
        return Ok(());
    }

    if left_guard.is_leaf() {
        left_guard.merge_leaf_from(&mut right_guard);
    } else {
        left_guard.merge_internal_from(&separator_field, &mut right_guard);
    }
    let right_id = right.id();
    right_guard.reformat(TYPE_STUB);
    drop(right_guard);
    core.map.remove(right_id);
    core.pagedb.delete_page(right_id)?;

    // The root adopts its lone child; the child's identity survives as
    // a stub for any cursor still bound to it.
    let left_id = left.id();
    let content = left_guard.take_page_leaving_stub();
    drop(left_guard);
    root_guard.replace_page(content);
    root_guard.set_type_bits(LOW_EXTREMITY | HIGH_EXTREMITY);
    root_guard.dirty = true;
    drop(root_guard);
    core.map.remove(left_id);
    core.pagedb.delete_page(left_id)?;
    tree.state.stub_tail.lock().push(left);
    Ok(())
}

fn encode_separator(db: &Database, key: &[u8]) -> KeelResult<Vec<u8>> {
    let capacity = db.core.config.page_size - NODE_HEADER_SIZE;
    let max_inline_key = (capacity / 4).min(0x7fff) - 2;
    if key.len() <= max_inline_key {
        Ok(encode_inline(key))
    } else {
        let first = db.core.frags.write_new(key)?;
        Ok(encode_fragmented(key.len() as u64, first))
    }
}

fn delete_empty_temp(db: &Database, tree: Tree) -> KeelResult<()> {
    let root = tree.root_node()?;
    tree.state.close();
    db.forget_temp_tree(tree.id());
    db.core.map.remove(root.id());
    db.page_db().delete_page(root.id())?;
    Ok(())
}

/// A target tree queued for merging, ordered by its lowest key.
struct Target {
    low_key: Option<Vec<u8>>,
    tree: Tree,
}

/// Parallel merge of pre-partitioned temporary trees into one.
pub struct TreeMerger {
    db: Database,
    workers: usize,
    stopped: AtomicBool,
}

impl TreeMerger {
    /// Creates a merger running grafts on up to `workers` threads.
    #[must_use]
    pub fn new(db: &Database, workers: usize) -> TreeMerger {
        TreeMerger {
            db: db.clone(),
            workers: workers.max(1),
            stopped: AtomicBool::new(false),
        }
    }

    /// Requests an early stop; unmerged trees go to the handler's
    /// `remainder`.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// Merges `sources` into one tree. Empty sources are deleted in
    /// the background; the rest are sorted by lowest key and grafted
    /// pairwise until one remains.
    pub fn merge(&self, sources: Vec<Tree>, handler: &dyn MergeHandler) -> KeelResult<()> {
        let mut targets = Vec::with_capacity(sources.len());
        for tree in sources {
            let mut cursor = tree.new_cursor(None);
            if cursor.first()? {
                let low_key = cursor.key().map(<[u8]>::to_vec);
                drop(cursor);
                targets.push(Target { low_key, tree });
            } else {
                drop(cursor);
                let db = self.db.clone();
                std::thread::spawn(move || {
                    let _ = delete_empty_temp(&db, tree);
                });
            }
        }

        // Unset low keys sort first; the rest by unsigned comparison.
        targets.sort_by(|a, b| match (&a.low_key, &b.low_key) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(b),
        });
        let mut trees: Vec<Tree> = targets.into_iter().map(|t| t.tree).collect();

        while trees.len() > 1 {
            if self.stopped.load(Ordering::Acquire) {
                for tree in trees {
                    handler.remainder(tree);
                }
                return Ok(());
            }

            let mut iter = trees.into_iter();
            let mut pairs = Vec::new();
            let mut leftover = None;
            while let Some(low) = iter.next() {
                match iter.next() {
                    Some(high) => pairs.push((low, high)),
                    None => leftover = Some(low),
                }
            }

            // Pairs are grafted in parallel; results keep pair order so
            // the reduction stays key-ordered across rounds.
            let mut round: Vec<KeelResult<Tree>> = Vec::with_capacity(pairs.len() + 1);
            let db = &self.db;
            std::thread::scope(|scope| {
                let chunk_len = pairs.len().div_ceil(self.workers).max(1);
                let mut handles = Vec::with_capacity(self.workers);
                for chunk in pairs.chunks(chunk_len) {
                    let chunk: Vec<(Tree, Tree)> = chunk.to_vec();
                    handles.push(scope.spawn(move || {
                        chunk
                            .into_iter()
                            .map(|(low, high)| graft_temp_trees(db, low, high))
                            .collect::<Vec<_>>()
                    }));
                }
                for handle in handles {
                    round.extend(handle.join().expect("graft worker panicked"));
                }
            });

            let mut next = Vec::with_capacity(round.len() + 1);
            for result in round {
                next.push(result?);
            }
            next.extend(leftover);
            trees = next;
        }

        if let Some(result) = trees.pop() {
            handler.merged(result);
        }
        Ok(())
    }
}
