//! The commit lock.
//!
//! Every page mutation (allocate, delete, recycle, node write-back)
//! holds the read side. A checkpoint acquires the write side to reach a
//! quiescent point, then downgrades to the read side so mutations can
//! resume while the checkpoint streams pages out.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Reader-preferring read/write lock with write-to-read downgrade.
#[derive(Debug, Default)]
pub struct CommitLock {
    inner: RwLock<()>,
}

/// Read-side guard: held across page mutations.
pub struct CommitReadGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

/// Write-side guard: held while a commit reaches its quiescent point.
pub struct CommitWriteGuard<'a> {
    guard: RwLockWriteGuard<'a, ()>,
}

impl CommitLock {
    /// Creates a new commit lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the read side. Mutating operations hold this.
    ///
    /// Reader-biased: a thread already inside the read side may acquire
    /// it again without queueing behind a waiting writer, so nested
    /// page operations never deadlock against a starting commit.
    pub fn acquire_shared(&self) -> CommitReadGuard<'_> {
        CommitReadGuard {
            _guard: self.inner.read_recursive(),
        }
    }

    /// Tries to acquire the read side without blocking.
    pub fn try_acquire_shared(&self) -> Option<CommitReadGuard<'_>> {
        self.inner
            .try_read_recursive()
            .map(|g| CommitReadGuard { _guard: g })
    }

    /// Acquires the write side, blocking until all readers drain.
    pub fn acquire_exclusive(&self) -> CommitWriteGuard<'_> {
        CommitWriteGuard {
            guard: self.inner.write(),
        }
    }
}

impl<'a> CommitWriteGuard<'a> {
    /// Downgrades to the read side without releasing, so no other writer
    /// can sneak in between.
    pub fn downgrade(self) -> CommitReadGuard<'a> {
        CommitReadGuard {
            _guard: RwLockWriteGuard::downgrade(self.guard),
        }
    }
}
