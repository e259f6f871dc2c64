//! Error types for the credit ledger

use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Balance does not cover the requested debit (expected, recoverable)
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        /// Credits the operation needed
        required: u64,
        /// Credits actually available
        available: u64,
    },

    /// Account does not exist (caller bug or stale id)
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// Account has been soft-deleted; mutation is foreclosed
    #[error("Account closed: {0}")]
    AccountClosed(String),

    /// External reference already processed with conflicting parameters,
    /// or lost the insert race (resolved to a cache-hit by the processor)
    #[error("Duplicate external reference: {0}")]
    DuplicateReference(String),

    /// Account lock not acquired within the configured budget
    #[error("Lock timeout on account: {0}")]
    LockTimeout(String),

    /// Malformed request (zero amount, self-transfer, etc.)
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    /// Invariant violation (conservation, balance overflow, etc.)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the caller may retry the operation as-is
    ///
    /// Lock timeouts leave no partial state behind; everything else either
    /// succeeded for someone (duplicate reference) or needs intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockTimeout(_))
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
