//! Error types for the reservation coordinator

use ledger_core::types::ReservationStatus;
use thiserror::Error;
use uuid::Uuid;

/// Result type for reservation operations
pub type Result<T> = std::result::Result<T, Error>;

/// Reservation errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger error (insufficient funds, account missing, storage)
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger_core::Error),

    /// Illegal state transition: a programming error, never swallowed
    #[error(
        "Illegal reservation transition: {reservation_id} is {status}, attempted {attempted}"
    )]
    StateViolation {
        /// Reservation being transitioned
        reservation_id: Uuid,
        /// Its current (terminal) status
        status: ReservationStatus,
        /// The transition that was attempted
        attempted: ReservationStatus,
    },

    /// External operation exceeded its timeout; reservation was refunded
    #[error("External operation timed out for reservation {0}")]
    ExternalTimeout(Uuid),

    /// External operation failed; reservation was refunded
    #[error("External operation failed: {0}")]
    External(String),

    /// Reservation not found
    #[error("Reservation not found: {0}")]
    ReservationNotFound(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
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
