//! Synchronization primitives.
//!
//! Two lock types live here:
//!
//! - [`Latch`]: the short-duration shared/exclusive lock guarding
//!   in-memory nodes and other engine structures. Non-reentrant.
//! - [`CommitLock`]: the reader-preferring lock that serializes page
//!   mutations against checkpoints.
//!
//! A *latch* is distinct from a transaction *lock*: latches protect
//! memory for microseconds, locks protect keys for the life of a
//! transaction.

mod commit_lock;
mod latch;

pub use commit_lock::{CommitLock, CommitReadGuard, CommitWriteGuard};
pub use latch::{Latch, LatchReadGuard, LatchWriteGuard, RawLatch};
