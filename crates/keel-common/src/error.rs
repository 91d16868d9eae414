//! Error handling for KeelDB.
//!
//! This module provides the unified error type and result alias used
//! across all KeelDB components.

use std::fmt;
use thiserror::Error;

use crate::types::TxnId;

/// Error codes for categorizing errors.
///
/// These codes can be used for programmatic error handling and are
/// stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // General errors (0x0000 - 0x00FF)
    /// Unknown or unspecified error.
    Unknown = 0x0000,
    /// Invalid argument provided.
    InvalidArgument = 0x0001,
    /// Operation performed in an illegal state.
    IllegalState = 0x0002,

    // I/O and corruption (0x0100 - 0x01FF)
    /// General I/O error.
    Io = 0x0100,
    /// Data corruption detected.
    Corruption = 0x0101,

    // Concurrency (0x0200 - 0x02FF)
    /// Deadlock detected.
    Deadlock = 0x0200,
    /// Lock acquisition failed.
    LockFailed = 0x0201,
    /// Index was closed while in use.
    ClosedIndex = 0x0202,

    // Constraint and replica (0x0300 - 0x03FF)
    /// View constraint violated.
    ViewConstraint = 0x0300,
    /// Write attempted against a replica.
    UnmodifiableReplica = 0x0301,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the error category name.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match (*self as u16) >> 8 {
            0x00 => "General",
            0x01 => "I/O",
            0x02 => "Concurrency",
            0x03 => "Constraint",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Reason a lock acquisition failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockFailReason {
    /// The configured wait timeout elapsed.
    Timeout,
    /// The requested acquisition is an illegal upgrade.
    IllegalUpgrade,
    /// The wait was interrupted.
    Interrupted,
}

impl fmt::Display for LockFailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockFailReason::Timeout => write!(f, "timed out"),
            LockFailReason::IllegalUpgrade => write!(f, "illegal upgrade"),
            LockFailReason::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// The main error type for KeelDB.
///
/// An operation either never mutates state and returns an error, or
/// mutates completely and returns `Ok`. Partial mutations followed by a
/// failure close the owning component so in-memory and on-disk state
/// cannot diverge.
#[derive(Debug, Error)]
pub enum KeelError {
    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Error message.
        message: String,
    },

    /// Operation performed in an illegal state.
    #[error("illegal state: {message}")]
    IllegalState {
        /// Error message.
        message: String,
    },

    /// I/O error from the underlying system.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Data corruption detected. Fatal for the affected database.
    #[error("database corruption detected: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch. Fatal for the affected database.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// The database was closed; all further operations fail.
    #[error("database is closed")]
    Closed,

    /// The index (tree) was closed while in use.
    #[error("index is closed")]
    ClosedIndex,

    /// Deadlock detected among waiting lock owners.
    #[error("deadlock detected; cycle: {cycle:?}")]
    Deadlock {
        /// The transactions forming the wait cycle, caller first.
        cycle: Vec<TxnId>,
    },

    /// Lock acquisition failed.
    #[error("lock acquisition failed for {txn_id}: {reason}")]
    LockFailed {
        /// The transaction that could not acquire the lock.
        txn_id: TxnId,
        /// Why the acquisition failed.
        reason: LockFailReason,
    },

    /// A bounded view rejected an out-of-range operation.
    #[error("view constraint violated: {message}")]
    ViewConstraint {
        /// Error message.
        message: String,
    },

    /// Write attempted while this member is a replica.
    #[error("replica is unmodifiable")]
    UnmodifiableReplica,
}

impl KeelError {
    /// Returns the error code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::IllegalState { .. } => ErrorCode::IllegalState,
            Self::Io { .. } => ErrorCode::Io,
            Self::Corruption { .. } | Self::ChecksumMismatch { .. } => ErrorCode::Corruption,
            Self::Closed | Self::ClosedIndex => ErrorCode::ClosedIndex,
            Self::Deadlock { .. } => ErrorCode::Deadlock,
            Self::LockFailed { .. } => ErrorCode::LockFailed,
            Self::ViewConstraint { .. } => ErrorCode::ViewConstraint,
            Self::UnmodifiableReplica => ErrorCode::UnmodifiableReplica,
        }
    }

    /// Returns true if a caller may retry after this error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockFailed {
                reason: LockFailReason::Timeout,
                ..
            } | Self::UnmodifiableReplica
        )
    }

    /// Returns true if this error aborts the owning transaction.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Deadlock { .. } | Self::LockFailed { .. })
    }

    /// Creates an invalid argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an illegal state error.
    #[must_use]
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    #[must_use]
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates a view constraint error.
    #[must_use]
    pub fn view_constraint(message: impl Into<String>) -> Self {
        Self::ViewConstraint {
            message: message.into(),
        }
    }
}

/// Result type alias for KeelDB operations.
pub type KeelResult<T> = std::result::Result<T, KeelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = KeelError::corruption("bad magic");
        assert_eq!(err.code(), ErrorCode::Corruption);
        assert_eq!(err.code().category(), "I/O");
    }

    #[test]
    fn test_error_display() {
        let err = KeelError::LockFailed {
            txn_id: TxnId::new(7),
            reason: LockFailReason::Timeout,
        };
        assert_eq!(err.to_string(), "lock acquisition failed for 7: timed out");
    }

    #[test]
    fn test_retryable() {
        let timeout = KeelError::LockFailed {
            txn_id: TxnId::new(1),
            reason: LockFailReason::Timeout,
        };
        assert!(timeout.is_retryable());
        assert!(KeelError::UnmodifiableReplica.is_retryable());
        assert!(!KeelError::corruption("x").is_retryable());
    }

    #[test]
    fn test_conflict() {
        let err = KeelError::Deadlock {
            cycle: vec![TxnId::new(1), TxnId::new(2)],
        };
        assert!(err.is_conflict());
        assert!(!KeelError::Closed.is_conflict());
    }

    #[test]
    fn test_io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: KeelError = io_err.into();
        assert_eq!(err.code(), ErrorCode::Io);
    }
}
