//! # keel-repl
//!
//! The replication term log.
//!
//! A term log holds the byte ranges written during one replication
//! term: segmented files on disk, an ordered range set tracking what
//! has arrived, a monotone *highest* contiguous index, and a *commit*
//! index waiters block on. Finishing a term truncates everything past
//! the final index.
//!
//! Consensus itself (leader election, quorum accounting, snapshot
//! transfer) lives above this crate; the log only stores, tracks, and
//! hands out bytes.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod range_set;
pub mod term_log;

pub use range_set::RangeSet;
pub use term_log::{LogReader, LogWriter, TermLog};
