//! Per-key lock state.
//!
//! Each locked `(tree, key)` pair has one [`LockEntry`] holding the
//! shared owner set, the upgradable owner (at most one), the exclusive
//! owner (at most one), and the queue of waiters. An upgradable owner
//! coexists with shared owners; an exclusive owner excludes everyone.

use std::collections::{HashSet, VecDeque};

use keel_common::types::TxnId;

/// What a waiter is queued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Want {
    /// A shared hold.
    Shared,
    /// The upgradable hold.
    Upgradable,
    /// The exclusive hold, fresh or upgraded from upgradable.
    Exclusive,
}

/// Result of a lock acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    /// The lock was acquired.
    Acquired,
    /// Already held shared at or above the requested level.
    OwnedShared,
    /// Already held upgradable.
    OwnedUpgradable,
    /// Already held exclusive.
    OwnedExclusive,
    /// The request is an illegal upgrade (shared to upgradable or
    /// exclusive). Release first, then reacquire.
    Illegal,
    /// The wait timed out.
    TimedOut,
}

impl LockResult {
    /// Returns true if the caller now holds the lock at the requested
    /// level or stronger.
    #[must_use]
    pub fn is_held(self) -> bool {
        matches!(
            self,
            LockResult::Acquired
                | LockResult::OwnedShared
                | LockResult::OwnedUpgradable
                | LockResult::OwnedExclusive
        )
    }
}

/// A queued waiter.
#[derive(Debug, Clone, Copy)]
pub struct Waiter {
    /// The waiting transaction.
    pub txn: TxnId,
    /// The hold it wants.
    pub want: Want,
}

/// State of one locked key.
#[derive(Debug, Default)]
pub struct LockEntry {
    /// Shared owners.
    pub shared: HashSet<TxnId>,
    /// The upgradable owner, if any.
    pub upgradable: Option<TxnId>,
    /// The exclusive owner, if any.
    pub exclusive: Option<TxnId>,
    /// Queued waiters, FIFO within each want class.
    pub waiters: VecDeque<Waiter>,
}

impl LockEntry {
    /// Returns true when nothing holds or waits on this entry.
    pub fn is_free(&self) -> bool {
        self.shared.is_empty()
            && self.upgradable.is_none()
            && self.exclusive.is_none()
            && self.waiters.is_empty()
    }

    /// Returns every current owner, for deadlock tracing.
    pub fn owners(&self) -> Vec<TxnId> {
        let mut owners: Vec<TxnId> = self.shared.iter().copied().collect();
        if let Some(txn) = self.upgradable {
            if !owners.contains(&txn) {
                owners.push(txn);
            }
        }
        if let Some(txn) = self.exclusive {
            if !owners.contains(&txn) {
                owners.push(txn);
            }
        }
        owners
    }

    /// Checks whether `txn` could be granted `want` right now, ignoring
    /// the waiter queue.
    pub fn grantable(&self, txn: TxnId, want: Want) -> bool {
        match want {
            Want::Shared => self.exclusive.is_none(),
            Want::Upgradable => self.exclusive.is_none() && self.upgradable.is_none(),
            Want::Exclusive => {
                if self.upgradable == Some(txn) {
                    // Upgrade: only the shared owners block it.
                    self.exclusive.is_none() && self.shared.is_empty()
                } else {
                    self.exclusive.is_none()
                        && self.upgradable.is_none()
                        && self.shared.is_empty()
                }
            }
        }
    }

    /// Grants `want` to `txn`. The caller has checked `grantable`.
    pub fn grant(&mut self, txn: TxnId, want: Want) {
        debug_assert!(self.grantable(txn, want));
        match want {
            Want::Shared => {
                self.shared.insert(txn);
            }
            Want::Upgradable => {
                self.upgradable = Some(txn);
            }
            Want::Exclusive => {
                // An upgrade retains the upgradable hold underneath so a
                // later downgrade can restore it.
                self.exclusive = Some(txn);
            }
        }
    }

    /// Removes `txn` from the waiter queue.
    pub fn remove_waiter(&mut self, txn: TxnId) {
        self.waiters.retain(|w| w.txn != txn);
    }

    /// Picks the next waiter to grant after a release, preferring
    /// upgradable-then-exclusive wants over shared so writers are not
    /// starved. At most one waiter is granted per released slot.
    pub fn grant_next(&mut self) -> Option<TxnId> {
        let preferred = self
            .waiters
            .iter()
            .position(|w| w.want != Want::Shared && self.grantable(w.txn, w.want));
        let position = match preferred {
            Some(position) => Some(position),
            None => self
                .waiters
                .iter()
                .position(|w| self.grantable(w.txn, w.want)),
        };
        let position = position?;
        let waiter = self.waiters.remove(position).unwrap();
        self.grant(waiter.txn, waiter.want);
        Some(waiter.txn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_stacks() {
        let mut entry = LockEntry::default();
        assert!(entry.grantable(TxnId::new(1), Want::Shared));
        entry.grant(TxnId::new(1), Want::Shared);
        assert!(entry.grantable(TxnId::new(2), Want::Shared));
        entry.grant(TxnId::new(2), Want::Shared);
        assert_eq!(entry.shared.len(), 2);
    }

    #[test]
    fn test_upgradable_coexists_with_shared() {
        let mut entry = LockEntry::default();
        entry.grant(TxnId::new(1), Want::Shared);
        assert!(entry.grantable(TxnId::new(2), Want::Upgradable));
        entry.grant(TxnId::new(2), Want::Upgradable);
        assert!(entry.grantable(TxnId::new(3), Want::Shared));
        assert!(!entry.grantable(TxnId::new(3), Want::Upgradable));
    }

    #[test]
    fn test_exclusive_excludes_all() {
        let mut entry = LockEntry::default();
        entry.grant(TxnId::new(1), Want::Exclusive);
        assert!(!entry.grantable(TxnId::new(2), Want::Shared));
        assert!(!entry.grantable(TxnId::new(2), Want::Upgradable));
        assert!(!entry.grantable(TxnId::new(2), Want::Exclusive));
    }

    #[test]
    fn test_upgrade_waits_for_shared_only() {
        let mut entry = LockEntry::default();
        entry.grant(TxnId::new(1), Want::Upgradable);
        entry.grant(TxnId::new(2), Want::Shared);
        assert!(!entry.grantable(TxnId::new(1), Want::Exclusive));
        entry.shared.remove(&TxnId::new(2));
        assert!(entry.grantable(TxnId::new(1), Want::Exclusive));
    }

    #[test]
    fn test_grant_next_prefers_upgraders() {
        let mut entry = LockEntry::default();
        entry.waiters.push_back(Waiter {
            txn: TxnId::new(1),
            want: Want::Shared,
        });
        entry.waiters.push_back(Waiter {
            txn: TxnId::new(2),
            want: Want::Exclusive,
        });
        let granted = entry.grant_next().unwrap();
        assert_eq!(granted, TxnId::new(2));
        assert_eq!(entry.exclusive, Some(TxnId::new(2)));
    }
}
