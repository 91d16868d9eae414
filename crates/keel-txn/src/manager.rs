//! The lock manager.
//!
//! Locks are keyed by `(tree, key)` and bucketed under striped
//! mutexes. Acquisition first tries an immediate grant, then queues,
//! checks the wait-for graph for a deadlock, and parks on the stripe's
//! condvar with the owning transaction's timeout. Release grants at
//! most one waiter per freed slot, preferring upgradable-then-exclusive
//! wants over shared; a granted shared waiter chains the wake to the
//! next shared waiter itself.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use keel_common::constants::LOCK_STRIPES;
use keel_common::error::{KeelError, KeelResult};
use keel_common::types::{TreeId, TxnId};

use crate::deadlock::WaitGraph;
use crate::lock::{LockEntry, LockResult, Waiter, Want};
use crate::txn::Txn;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LockKey {
    tree: TreeId,
    key: Box<[u8]>,
}

struct Stripe {
    entries: Mutex<HashMap<LockKey, LockEntry>>,
    cond: Condvar,
}

/// Per-key read/upgradable/exclusive lock table with deadlock and
/// timeout handling.
pub struct LockManager {
    stripes: Box<[Stripe]>,
    graph: WaitGraph,
    held: RwLock<HashMap<TxnId, HashSet<LockKey>>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    /// Creates a lock manager.
    #[must_use]
    pub fn new() -> Self {
        let stripes = (0..LOCK_STRIPES)
            .map(|_| Stripe {
                entries: Mutex::new(HashMap::new()),
                cond: Condvar::new(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            stripes,
            graph: WaitGraph::new(),
            held: RwLock::new(HashMap::new()),
        }
    }

    fn stripe_for(&self, key: &LockKey) -> &Stripe {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) & (LOCK_STRIPES - 1)]
    }

    /// Acquires a shared lock using the transaction's timeout.
    pub fn lock_shared(&self, txn: &Txn, tree: TreeId, key: &[u8]) -> KeelResult<LockResult> {
        self.acquire(txn.id(), tree, key, Want::Shared, txn.lock_timeout_nanos())
    }

    /// Acquires the upgradable lock using the transaction's timeout.
    pub fn lock_upgradable(&self, txn: &Txn, tree: TreeId, key: &[u8]) -> KeelResult<LockResult> {
        self.acquire(
            txn.id(),
            tree,
            key,
            Want::Upgradable,
            txn.lock_timeout_nanos(),
        )
    }

    /// Acquires the exclusive lock using the transaction's timeout.
    pub fn lock_exclusive(&self, txn: &Txn, tree: TreeId, key: &[u8]) -> KeelResult<LockResult> {
        self.acquire(
            txn.id(),
            tree,
            key,
            Want::Exclusive,
            txn.lock_timeout_nanos(),
        )
    }

    /// Acquires a shared lock with an explicit timeout in nanoseconds.
    /// Negative means no wait; `i64::MAX` means wait forever.
    pub fn try_lock_shared(
        &self,
        txn: &Txn,
        tree: TreeId,
        key: &[u8],
        timeout_nanos: i64,
    ) -> KeelResult<LockResult> {
        self.acquire(txn.id(), tree, key, Want::Shared, timeout_nanos)
    }

    /// Acquires the upgradable lock with an explicit timeout.
    pub fn try_lock_upgradable(
        &self,
        txn: &Txn,
        tree: TreeId,
        key: &[u8],
        timeout_nanos: i64,
    ) -> KeelResult<LockResult> {
        self.acquire(txn.id(), tree, key, Want::Upgradable, timeout_nanos)
    }

    /// Acquires the exclusive lock with an explicit timeout.
    pub fn try_lock_exclusive(
        &self,
        txn: &Txn,
        tree: TreeId,
        key: &[u8],
        timeout_nanos: i64,
    ) -> KeelResult<LockResult> {
        self.acquire(txn.id(), tree, key, Want::Exclusive, timeout_nanos)
    }

    fn acquire(
        &self,
        id: TxnId,
        tree: TreeId,
        key: &[u8],
        want: Want,
        timeout_nanos: i64,
    ) -> KeelResult<LockResult> {
        let lock_key = LockKey {
            tree,
            key: key.into(),
        };
        let stripe = self.stripe_for(&lock_key);
        let mut entries = stripe.entries.lock();
        let entry = entries.entry(lock_key.clone()).or_default();

        // Already held at or above the requested level?
        if entry.exclusive == Some(id) {
            return Ok(LockResult::OwnedExclusive);
        }
        match want {
            Want::Shared => {
                if entry.upgradable == Some(id) {
                    return Ok(LockResult::OwnedUpgradable);
                }
                if entry.shared.contains(&id) {
                    return Ok(LockResult::OwnedShared);
                }
            }
            Want::Upgradable => {
                if entry.upgradable == Some(id) {
                    return Ok(LockResult::OwnedUpgradable);
                }
                if entry.shared.contains(&id) {
                    // Upgrading a plain shared hold deadlocks against
                    // other shared owners doing the same. Refused.
                    return Ok(LockResult::Illegal);
                }
            }
            Want::Exclusive => {
                if entry.shared.contains(&id) && entry.upgradable != Some(id) {
                    return Ok(LockResult::Illegal);
                }
            }
        }

        // Immediate grant: the queue may not be bypassed unless this is
        // an upgrade, which jumps ahead of queued waiters.
        let upgrade = want == Want::Exclusive && entry.upgradable == Some(id);
        if (entry.waiters.is_empty() || upgrade) && entry.grantable(id, want) {
            entry.grant(id, want);
            drop(entries);
            self.record_held(id, lock_key);
            return Ok(LockResult::Acquired);
        }

        if timeout_nanos <= 0 {
            if entry.is_free() {
                entries.remove(&lock_key);
            }
            return Ok(LockResult::TimedOut);
        }

        // About to block: refuse if that would close a wait cycle.
        let owners: Vec<TxnId> = entry.owners().into_iter().filter(|&o| o != id).collect();
        if let Err(cycle) = self.graph.check_and_wait(id, &owners) {
            if entry.is_free() {
                entries.remove(&lock_key);
            }
            return Err(KeelError::Deadlock { cycle });
        }
        entry.waiters.push_back(Waiter { txn: id, want });

        let deadline = if timeout_nanos == i64::MAX {
            None
        } else {
            Some(Instant::now() + Duration::from_nanos(timeout_nanos as u64))
        };

        loop {
            let entry = entries
                .get_mut(&lock_key)
                .expect("entry exists while a waiter is queued");
            if Self::is_owner(entry, id, want) {
                // Chain the wake to the next shared waiter, keeping the
                // one-wake-per-slot release contract.
                if want == Want::Shared && entry.grant_next().is_some() {
                    stripe.cond.notify_all();
                }
                self.graph.clear(id);
                drop(entries);
                self.record_held(id, lock_key);
                return Ok(LockResult::Acquired);
            }
            let owners: Vec<TxnId> = entry.owners().into_iter().filter(|&o| o != id).collect();
            self.graph.update(id, &owners);

            let timed_out = match deadline {
                None => {
                    stripe.cond.wait(&mut entries);
                    false
                }
                Some(deadline) => stripe.cond.wait_until(&mut entries, deadline).timed_out(),
            };
            if timed_out {
                let entry = entries
                    .get_mut(&lock_key)
                    .expect("entry exists while a waiter is queued");
                if Self::is_owner(entry, id, want) {
                    self.graph.clear(id);
                    drop(entries);
                    self.record_held(id, lock_key);
                    return Ok(LockResult::Acquired);
                }
                entry.remove_waiter(id);
                if entry.is_free() {
                    entries.remove(&lock_key);
                }
                self.graph.clear(id);
                return Ok(LockResult::TimedOut);
            }
        }
    }

    fn is_owner(entry: &LockEntry, id: TxnId, want: Want) -> bool {
        match want {
            Want::Shared => {
                entry.shared.contains(&id)
                    || entry.upgradable == Some(id)
                    || entry.exclusive == Some(id)
            }
            Want::Upgradable => entry.upgradable == Some(id) || entry.exclusive == Some(id),
            Want::Exclusive => entry.exclusive == Some(id),
        }
    }

    fn record_held(&self, id: TxnId, key: LockKey) {
        self.held.write().entry(id).or_default().insert(key);
    }

    /// Fully releases whatever `txn` holds on the key.
    pub fn unlock(&self, txn: &Txn, tree: TreeId, key: &[u8]) {
        self.unlock_by_id(txn.id(), tree, key);
    }

    fn unlock_by_id(&self, id: TxnId, tree: TreeId, key: &[u8]) {
        let lock_key = LockKey {
            tree,
            key: key.into(),
        };
        let stripe = self.stripe_for(&lock_key);
        {
            let mut entries = stripe.entries.lock();
            if let Some(entry) = entries.get_mut(&lock_key) {
                if entry.exclusive == Some(id) {
                    entry.exclusive = None;
                }
                if entry.upgradable == Some(id) {
                    entry.upgradable = None;
                }
                entry.shared.remove(&id);
                let _ = entry.grant_next();
                if entry.is_free() {
                    entries.remove(&lock_key);
                }
            }
            stripe.cond.notify_all();
        }
        if let Some(keys) = self.held.write().get_mut(&id) {
            keys.remove(&lock_key);
        }
    }

    /// Downgrades an exclusive or upgradable hold to shared.
    pub fn unlock_to_shared(&self, txn: &Txn, tree: TreeId, key: &[u8]) {
        let id = txn.id();
        let lock_key = LockKey {
            tree,
            key: key.into(),
        };
        let stripe = self.stripe_for(&lock_key);
        let mut entries = stripe.entries.lock();
        if let Some(entry) = entries.get_mut(&lock_key) {
            if entry.exclusive == Some(id) || entry.upgradable == Some(id) {
                if entry.exclusive == Some(id) {
                    entry.exclusive = None;
                }
                if entry.upgradable == Some(id) {
                    entry.upgradable = None;
                }
                entry.shared.insert(id);
                let _ = entry.grant_next();
                stripe.cond.notify_all();
            }
        }
    }

    /// Downgrades an upgraded exclusive hold back to upgradable.
    pub fn unlock_to_upgradable(&self, txn: &Txn, tree: TreeId, key: &[u8]) {
        let id = txn.id();
        let lock_key = LockKey {
            tree,
            key: key.into(),
        };
        let stripe = self.stripe_for(&lock_key);
        let mut entries = stripe.entries.lock();
        if let Some(entry) = entries.get_mut(&lock_key) {
            if entry.exclusive == Some(id) {
                entry.exclusive = None;
                entry.upgradable = Some(id);
                let _ = entry.grant_next();
                stripe.cond.notify_all();
            }
        }
    }

    /// Releases every lock the transaction holds, in any order.
    pub fn release_all(&self, id: TxnId) -> usize {
        let keys: Vec<LockKey> = match self.held.write().remove(&id) {
            Some(keys) => keys.into_iter().collect(),
            None => return 0,
        };
        let count = keys.len();
        for lock_key in keys {
            self.unlock_by_id(id, lock_key.tree, &lock_key.key);
        }
        self.graph.clear(id);
        count
    }

    /// Number of keys currently locked. For tests and introspection.
    pub fn locked_key_count(&self) -> usize {
        self.stripes.iter().map(|s| s.entries.lock().len()).sum()
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("locked_keys", &self.locked_key_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::IsolationLevel;
    use std::sync::Arc;
    use std::thread;

    const TREE: TreeId = TreeId::FIRST_USER;

    #[test]
    fn test_basic_acquire_release() {
        let manager = LockManager::new();
        let txn = Txn::begin_default();

        assert_eq!(
            manager.lock_shared(&txn, TREE, b"k").unwrap(),
            LockResult::Acquired
        );
        assert_eq!(
            manager.lock_shared(&txn, TREE, b"k").unwrap(),
            LockResult::OwnedShared
        );
        manager.unlock(&txn, TREE, b"k");
        assert_eq!(manager.locked_key_count(), 0);
    }

    #[test]
    fn test_shared_owners_stack() {
        let manager = LockManager::new();
        let a = Txn::begin_default();
        let b = Txn::begin_default();

        assert!(manager.lock_shared(&a, TREE, b"k").unwrap().is_held());
        assert!(manager.lock_shared(&b, TREE, b"k").unwrap().is_held());
        assert_eq!(manager.locked_key_count(), 1);
    }

    #[test]
    fn test_exclusive_blocks_and_no_wait_times_out() {
        let manager = LockManager::new();
        let a = Txn::begin_default();
        let b = Txn::begin_default();

        manager.lock_exclusive(&a, TREE, b"k").unwrap();
        assert_eq!(
            manager.try_lock_shared(&b, TREE, b"k", -1).unwrap(),
            LockResult::TimedOut
        );
        assert_eq!(
            manager
                .try_lock_exclusive(&b, TREE, b"k", 5_000_000)
                .unwrap(),
            LockResult::TimedOut
        );
    }

    #[test]
    fn test_upgrade_from_shared_is_illegal() {
        let manager = LockManager::new();
        let txn = Txn::begin_default();

        manager.lock_shared(&txn, TREE, b"k").unwrap();
        assert_eq!(
            manager.lock_exclusive(&txn, TREE, b"k").unwrap(),
            LockResult::Illegal
        );
        assert_eq!(
            manager.lock_upgradable(&txn, TREE, b"k").unwrap(),
            LockResult::Illegal
        );
    }

    #[test]
    fn test_upgradable_to_exclusive() {
        let manager = LockManager::new();
        let txn = Txn::begin_default();

        manager.lock_upgradable(&txn, TREE, b"k").unwrap();
        assert_eq!(
            manager.lock_exclusive(&txn, TREE, b"k").unwrap(),
            LockResult::Acquired
        );
        assert_eq!(
            manager.lock_exclusive(&txn, TREE, b"k").unwrap(),
            LockResult::OwnedExclusive
        );

        manager.unlock_to_upgradable(&txn, TREE, b"k");
        assert_eq!(
            manager.lock_upgradable(&txn, TREE, b"k").unwrap(),
            LockResult::OwnedUpgradable
        );
    }

    #[test]
    fn test_release_wakes_waiter() {
        let manager = Arc::new(LockManager::new());
        let a = Txn::begin_default();
        let b = Txn::begin_default();

        manager.lock_exclusive(&a, TREE, b"k").unwrap();

        let manager2 = Arc::clone(&manager);
        let b2 = b.clone();
        let waiter = thread::spawn(move || {
            manager2
                .try_lock_exclusive(&b2, TREE, b"k", i64::MAX)
                .unwrap()
        });

        thread::sleep(Duration::from_millis(20));
        manager.unlock(&a, TREE, b"k");
        assert_eq!(waiter.join().unwrap(), LockResult::Acquired);
    }

    #[test]
    fn test_deadlock_detected() {
        let manager = Arc::new(LockManager::new());
        let a = Txn::begin(IsolationLevel::RepeatableRead);
        let b = Txn::begin(IsolationLevel::RepeatableRead);

        manager.lock_exclusive(&a, TREE, b"k1").unwrap();
        manager.lock_exclusive(&b, TREE, b"k2").unwrap();

        let manager2 = Arc::clone(&manager);
        let a2 = a.clone();
        let blocked = thread::spawn(move || {
            // Blocks on b; b will then close the cycle.
            manager2.try_lock_exclusive(&a2, TREE, b"k2", i64::MAX)
        });

        thread::sleep(Duration::from_millis(30));
        let result = manager.try_lock_exclusive(&b, TREE, b"k1", i64::MAX);
        assert!(matches!(result, Err(KeelError::Deadlock { .. })));

        // Resolve by releasing b's hold so the blocked thread finishes.
        manager.release_all(b.id());
        assert_eq!(blocked.join().unwrap().unwrap(), LockResult::Acquired);
    }

    #[test]
    fn test_release_all() {
        let manager = LockManager::new();
        let txn = Txn::begin_default();

        manager.lock_shared(&txn, TREE, b"a").unwrap();
        manager.lock_exclusive(&txn, TREE, b"b").unwrap();
        manager.lock_upgradable(&txn, TREE, b"c").unwrap();

        assert_eq!(manager.release_all(txn.id()), 3);
        assert_eq!(manager.locked_key_count(), 0);
    }

    #[test]
    fn test_writer_preference_on_release() {
        let manager = Arc::new(LockManager::new());
        let holder = Txn::begin_default();
        manager.lock_exclusive(&holder, TREE, b"k").unwrap();

        let reader = Txn::begin_default();
        let writer = Txn::begin_default();

        let m1 = Arc::clone(&manager);
        let r = reader.clone();
        let reader_thread =
            thread::spawn(move || m1.try_lock_shared(&r, TREE, b"k", i64::MAX).unwrap());
        thread::sleep(Duration::from_millis(20));

        let m2 = Arc::clone(&manager);
        let w = writer.clone();
        let writer_thread =
            thread::spawn(move || m2.try_lock_exclusive(&w, TREE, b"k", i64::MAX).unwrap());
        thread::sleep(Duration::from_millis(20));

        // The writer queued second but is granted first.
        manager.unlock(&holder, TREE, b"k");
        assert_eq!(writer_thread.join().unwrap(), LockResult::Acquired);

        manager.unlock(&writer, TREE, b"k");
        assert_eq!(reader_thread.join().unwrap(), LockResult::Acquired);
    }
}
