//! CreditRail Ledger Core
//!
//! Per-account credit ledger with an append-only audit trail and
//! store-enforced deduplication of externally-sourced transactions.
//!
//! # Architecture
//!
//! - **Keyed locking**: every mutation runs inside its account's exclusive
//!   lock; lock scope is a single read-modify-write
//! - **Atomic commits**: account row, audit entry, indices, and idempotency
//!   record land in one storage batch
//! - **Durable dedup**: external references are unique in the store itself;
//!   the bounded idempotency cache is an optimization on top
//!
//! # Invariants
//!
//! - Balance is never negative: a debit that would overdraw aborts untouched
//! - Conservation: `balance == Σ(delta)` over an account's entries, always
//! - Per-account entry order matches the order mutations took effect
//! - Replaying an external reference never credits twice

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod error;
pub mod idempotency;
pub mod locks;
pub mod metrics;
pub mod processor;
pub mod storage;
pub mod types;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use idempotency::{spawn_purge_sweep, IdempotencyIndex};
pub use locks::AccountLocks;
pub use metrics::Metrics;
pub use processor::TransactionProcessor;
pub use storage::Storage;
pub use types::{
    Account, AccountId, AccountStatus, EntryContext, IdempotencyRecord, LedgerEntry, Reason,
    Receipt, Reservation, ReservationStatus, TransferReceipt,
};
