//! Error types for CowKV core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type KvResult<T> = Result<T, KvError>;

/// Errors that can occur in CowKV core operations.
#[derive(Debug, Error)]
pub enum KvError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] cowkv_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The operation conflicted with another transaction and may succeed
    /// when retried on a fresh transaction.
    #[error("transaction must be retried: {message}")]
    TransactionRetry {
        /// Why the transaction cannot proceed.
        message: String,
    },

    /// Operating on a committed or disposed transaction.
    #[error("transaction already committed or disposed")]
    TransactionClosed,

    /// The cursor does not point at a key.
    #[error("current key is not valid")]
    InvalidCursor,

    /// Reading value bytes from the log failed.
    ///
    /// The message carries a snapshot of current, last-committed and
    /// oldest-live root metadata for diagnostics.
    #[error("value read failed: {message}")]
    ValueRead {
        /// Description including root metadata.
        message: String,
    },

    /// A structural tree invariant was violated. Fatal.
    #[error("tree corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// The transaction log is corrupted or invalid.
    #[error("transaction log corruption: {message}")]
    WalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl KvError {
    /// Creates a retriable transaction error.
    pub fn transaction_retry(message: impl Into<String>) -> Self {
        Self::TransactionRetry {
            message: message.into(),
        }
    }

    /// Creates a value read error.
    pub fn value_read(message: impl Into<String>) -> Self {
        Self::ValueRead {
            message: message.into(),
        }
    }

    /// Creates a tree corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates a transaction log corruption error.
    pub fn wal_corruption(message: impl Into<String>) -> Self {
        Self::WalCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }
}
