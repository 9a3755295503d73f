//! Error types for MarrowDB
//!
//! This module defines all error types used throughout the storage engine.

use thiserror::Error;

/// The main error type for MarrowDB
#[derive(Error, Debug)]
pub enum Error {
    // ========== Store System Errors ==========
    #[error("Store error: store '{0}' not found")]
    StoreNotFound(String),

    #[error("Store error: store '{0}' already exists")]
    StoreAlreadyExists(String),

    #[error("Store error: store system is read-only")]
    ReadOnlyStoreSystem,

    #[error("Store error: lock '{0}' is already held")]
    StoreLocked(String),

    #[error("Store error: lock '{0}' is not held")]
    StoreNotLocked(String),

    // ========== Journal Errors ==========
    #[error("Journal error: corrupted record in journal {0} at position {1}")]
    CorruptedJournal(u64, u64),

    #[error("Journal error: {0}")]
    JournalError(String),

    // ========== Table Errors ==========
    #[error("Table error: table '{0}' not found")]
    TableNotFound(String),

    #[error("Table error: table '{0}' already exists")]
    TableAlreadyExists(String),

    #[error("Table error: row {0} not found")]
    RowNotFound(u64),

    #[error("Table error: expected {expected} columns, got {found}")]
    ColumnCountMismatch { expected: usize, found: usize },

    #[error("Table error: table '{0}' is in use by an open transaction")]
    TableInUse(String),

    // ========== Transaction Errors ==========
    #[error("Transaction error: commit conflict on table '{table}' row {row}")]
    CommitConflict { table: String, row: u64 },

    #[error("Transaction error: transaction {0} is closed")]
    TransactionClosed(u64),

    #[error("Transaction error: transaction {0} is read-only")]
    ReadOnlyTransaction(u64),

    // ========== I/O Errors ==========
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    // ========== Internal Errors ==========
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if this error is a commit conflict, the one recoverable
    /// commit failure: the caller should discard the transaction and retry
    /// against a fresh snapshot.
    pub fn is_commit_conflict(&self) -> bool {
        matches!(self, Error::CommitConflict { .. })
    }
}

/// Result type alias for MarrowDB operations
pub type Result<T> = std::result::Result<T, Error>;
