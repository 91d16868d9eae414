//! # keel-tree
//!
//! The copy-on-write B+ tree over the KeelDB page store.
//!
//! - [`node`]: the latched, page-resident tree node (binary layout,
//!   binary search, splits, merges, compaction)
//! - [`frag`]: out-of-line storage for keys and values too large to
//!   inline
//! - [`map`]: the node cache with clock eviction
//! - [`db`]: the database facade: tree registry, checkpoints
//! - [`tree`]: tree-level operations and structural changes
//! - [`cursor`]: the frame-stack cursor
//! - [`view`]: bounded views over a tree
//! - [`trigger`]: per-tree mutation triggers
//! - [`merger`]: grafting temporary trees

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cursor;
pub mod db;
pub mod frag;
pub mod map;
pub mod merger;
pub mod node;
pub mod tree;
pub mod trigger;
pub mod view;

pub use cursor::TreeCursor;
pub use db::Database;
pub use merger::TreeMerger;
pub use tree::Tree;
pub use view::BoundedView;
