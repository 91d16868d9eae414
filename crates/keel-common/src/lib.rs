//! # keel-common
//!
//! Common types, errors, and utilities for KeelDB.
//!
//! This crate provides the foundational types and abstractions used across
//! all KeelDB components:
//!
//! - **Types**: Core identifiers (`PageId`, `TxnId`, `TreeId`, `LogIndex`, `Term`)
//! - **Errors**: Unified error handling with `KeelError`
//! - **Config**: Database configuration structures
//! - **Constants**: System-wide constants and limits
//! - **Sync**: The node latch and the commit lock
//!
//! ## Example
//!
//! ```rust
//! use keel_common::types::{PageId, TxnId};
//! use keel_common::error::KeelResult;
//!
//! fn example() -> KeelResult<()> {
//!     let page_id = PageId::new(42);
//!     let txn_id = TxnId::new(1);
//!     assert!(page_id.is_valid() && txn_id.is_valid());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod constants;
pub mod error;
pub mod sync;
pub mod types;

pub use constants::*;
pub use error::{ErrorCode, KeelError, KeelResult};
pub use types::{LogIndex, PageId, Term, TreeId, TxnId};
