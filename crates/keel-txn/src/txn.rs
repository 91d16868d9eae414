//! Transaction handle and isolation levels.

use std::sync::atomic::{AtomicU64, Ordering};

use keel_common::constants::DEFAULT_LOCK_TIMEOUT_NANOS;
use keel_common::types::TxnId;

/// Isolation level, controlling which read locks a transaction takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// No read locks at all.
    ReadUncommitted,
    /// A shared lock is acquired around each read and released after.
    ReadCommitted,
    /// Shared locks are retained until the transaction ends.
    RepeatableRead,
    /// Reads acquire upgradable locks, retained until the end.
    UpgradableRead,
    /// Like `UpgradableRead`; range protection is layered above.
    Serializable,
}

impl IsolationLevel {
    /// Returns true if reads at this level take any lock.
    #[must_use]
    pub const fn locks_reads(self) -> bool {
        !matches!(self, IsolationLevel::ReadUncommitted)
    }

    /// Returns true if a read lock is released as soon as the read
    /// completes.
    #[must_use]
    pub const fn releases_read_locks(self) -> bool {
        matches!(self, IsolationLevel::ReadCommitted)
    }

    /// Returns true if reads acquire upgradable rather than shared locks.
    #[must_use]
    pub const fn reads_upgradable(self) -> bool {
        matches!(
            self,
            IsolationLevel::UpgradableRead | IsolationLevel::Serializable
        )
    }
}

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// A transaction handle: the identity locks are owned by, plus the
/// knobs the lock manager honors.
#[derive(Debug, Clone)]
pub struct Txn {
    id: TxnId,
    isolation: IsolationLevel,
    /// Lock wait timeout in nanoseconds. `-1` means no wait,
    /// `i64::MAX` means wait forever.
    lock_timeout_nanos: i64,
}

impl Txn {
    /// Begins a transaction at the given isolation level.
    #[must_use]
    pub fn begin(isolation: IsolationLevel) -> Self {
        Self {
            id: TxnId::new(NEXT_TXN_ID.fetch_add(1, Ordering::Relaxed)),
            isolation,
            lock_timeout_nanos: DEFAULT_LOCK_TIMEOUT_NANOS,
        }
    }

    /// Begins an `RepeatableRead` transaction.
    #[must_use]
    pub fn begin_default() -> Self {
        Self::begin(IsolationLevel::RepeatableRead)
    }

    /// Returns the transaction id.
    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Returns the isolation level.
    #[must_use]
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Returns the lock timeout in nanoseconds.
    #[must_use]
    pub fn lock_timeout_nanos(&self) -> i64 {
        self.lock_timeout_nanos
    }

    /// Sets the lock timeout in nanoseconds.
    pub fn set_lock_timeout_nanos(&mut self, nanos: i64) {
        self.lock_timeout_nanos = nanos;
    }
}
