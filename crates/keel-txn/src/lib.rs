//! # keel-txn
//!
//! Transaction-scoped key locking for KeelDB.
//!
//! A *lock* here is the long-duration logical lock a transaction holds
//! on a `(tree, key)` pair, mediated by the [`LockManager`]. It is
//! distinct from the short-duration node latches in `keel-common::sync`.
//!
//! Lock states per key: free, shared (N owners), upgradable (one owner
//! plus shared owners), exclusive (one owner). Waiters queue per key;
//! deadlocks are detected by walking the wait-for graph before a waiter
//! blocks.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod deadlock;
pub mod lock;
pub mod manager;
pub mod txn;

pub use lock::LockResult;
pub use manager::LockManager;
pub use txn::{IsolationLevel, Txn};
