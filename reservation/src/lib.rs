//! CreditRail Reservation Coordinator
//!
//! Pairs a ledger debit with an unreliable external operation and
//! guarantees the debit is reversed when the operation fails:
//!
//! - `Debited -> Confirmed`: external success, the charge stands
//! - `Debited -> Refunded`: external failure or timeout, compensating
//!   credit issued
//!
//! A recovery sweep resolves reservations stranded in `Debited` by a
//! crash, so money taken without delivered value is always refunded or
//! confirmed, never forgotten.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod recovery;

// Re-exports
pub use config::CoordinatorConfig;
pub use coordinator::{Charge, ReservationCoordinator};
pub use error::{Error, Result};
pub use recovery::{DefaultToRefund, OutcomeProbe, ProbeOutcome, RecoverySweep, SweepReport};
