//! # keel-store
//!
//! The durable page database underneath the KeelDB tree.
//!
//! Pages are managed copy-on-write: a page visible to the last good
//! commit is never overwritten until the next commit has durably
//! succeeded. Two header copies on pages 0 and 1 alternate as commit
//! targets; recovery accepts whichever verifies with the higher commit
//! number.
//!
//! - [`array`]: fixed-size page I/O over a backing file
//! - [`manager`]: free-list allocation with rollback protection
//! - [`db`]: the two-header commit protocol
//! - [`snapshot`]: full-database snapshot streams and restore

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod array;
pub mod db;
pub mod manager;
pub mod snapshot;

pub use array::{FilePageArray, PageArray};
pub use db::{CommitCallback, PageDb};
pub use manager::PageManager;
pub use snapshot::restore_from_snapshot;
