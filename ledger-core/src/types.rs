//! Core types for the credit ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Memory safety (no unsafe code)
//! - Exact arithmetic (integer credits, signed deltas)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Account identifier (user id, device-bound identity, etc.)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Account lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AccountStatus {
    /// Open for credits and debits
    Active = 1,
    /// Soft-deleted (terminal); all further mutation is rejected
    Closed = 2,
}

/// One user's credit balance
///
/// Mutated exclusively by the transaction processor while the account
/// lock is held. `balance` is non-negative by construction (`u64`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Stable identifier, immutable once created
    pub account_id: AccountId,

    /// Current balance in credits
    pub balance: u64,

    /// Monotonically non-decreasing total of all credits ever applied
    pub lifetime_credited: u64,

    /// Lifecycle state
    pub status: AccountStatus,

    /// Bumped on every mutation; detects stale reads
    pub version: u64,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last mutated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Create a fresh account with zero balance
    pub fn new(account_id: AccountId) -> Self {
        let now = Utc::now();
        Self {
            account_id,
            balance: 0,
            lifetime_credited: 0,
            status: AccountStatus::Active,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the account has been soft-deleted
    pub fn is_closed(&self) -> bool {
        self.status == AccountStatus::Closed
    }
}

/// Why a balance changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Reason {
    /// Grant applied when an account is first provisioned
    InitialGrant = 1,
    /// Verified store purchase
    Purchase = 2,
    /// Charge for a submitted job
    JobCharge = 3,
    /// Compensating credit after a failed job
    JobRefund = 4,
    /// Claw-back of a refunded purchase
    PurchaseReversal = 5,
    /// Zero-delta record of an uncollectable reversal shortfall
    WriteOff = 6,
    /// Manual operator adjustment
    AdminAdjustment = 7,
    /// Balance moved while merging a temporary identity into a permanent one
    AccountMerge = 8,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Reason::InitialGrant => "initial_grant",
            Reason::Purchase => "purchase",
            Reason::JobCharge => "job_charge",
            Reason::JobRefund => "job_refund",
            Reason::PurchaseReversal => "purchase_reversal",
            Reason::WriteOff => "write_off",
            Reason::AdminAdjustment => "admin_adjustment",
            Reason::AccountMerge => "account_merge",
        };
        write!(f, "{}", s)
    }
}

/// Structured metadata attached to a ledger entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryContext {
    /// Store product that produced a purchase credit
    pub product_id: Option<String>,

    /// Job tied to a charge or refund
    pub job_id: Option<String>,

    /// Entry this one compensates or reverses
    pub related_entry_id: Option<Uuid>,

    /// Credits a reversal could not recover (write-off entries only)
    pub shortfall: Option<u64>,

    /// Free-form operator note
    pub note: Option<String>,
}

impl EntryContext {
    /// Context referencing a prior entry (refunds, reversals)
    pub fn related_to(entry_id: Uuid) -> Self {
        Self {
            related_entry_id: Some(entry_id),
            ..Self::default()
        }
    }

    /// Context carrying a job id
    pub fn for_job(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Self::default()
        }
    }
}

/// Audit log row: one per applied mutation
///
/// Append-only; per account, insertion order matches the order in which
/// mutations took effect (UUIDv7 entry ids are time-ordered).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry ID (UUIDv7 for insertion ordering)
    pub entry_id: Uuid,

    /// Account this entry belongs to
    pub account_id: AccountId,

    /// Signed amount; positive = credit, negative = debit
    pub delta: i64,

    /// Why the balance changed
    pub reason: Reason,

    /// Balance snapshot after this entry was applied
    pub balance_after: u64,

    /// Idempotency key naming the external event, unique when present
    pub external_reference: Option<String>,

    /// Structured metadata
    #[serde(default)]
    pub context: EntryContext,

    /// Entry timestamp
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Whether this entry added credits
    pub fn is_credit(&self) -> bool {
        self.delta > 0
    }

    /// Whether this entry removed credits
    pub fn is_debit(&self) -> bool {
        self.delta < 0
    }
}

/// Reservation lifecycle state
///
/// `Debited -> Confirmed` (success) and `Debited -> Refunded` (failure)
/// are the only legal transitions; both targets are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReservationStatus {
    /// Debit applied, external outcome pending
    Debited = 1,
    /// External operation succeeded (terminal)
    Confirmed = 2,
    /// External operation failed; compensating credit issued (terminal)
    Refunded = 3,
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReservationStatus::Debited => "debited",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Refunded => "refunded",
        };
        write!(f, "{}", s)
    }
}

/// Workflow state for a debit awaiting an external operation's outcome
///
/// Not permanent ledger data; rows become purgeable once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    /// Unique reservation ID
    pub reservation_id: Uuid,

    /// Account that was debited
    pub account_id: AccountId,

    /// Debited amount in credits
    pub amount: u64,

    /// Lifecycle state
    pub status: ReservationStatus,

    /// Ledger entry created by the debit
    pub debit_entry_id: Uuid,

    /// Ledger entry created by the compensating credit, if refunded
    pub refund_entry_id: Option<Uuid>,

    /// Identifier of the external operation (job id, provider ref)
    pub external_operation_ref: Option<String>,

    /// Created timestamp (staleness is measured from here)
    pub created_at: DateTime<Utc>,

    /// When the reservation reached a terminal state
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Reservation {
    /// Whether the reservation has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            ReservationStatus::Confirmed | ReservationStatus::Refunded
        )
    }
}

/// Cached outcome of the first processing of an external reference
///
/// Bounded-retention cache row; the permanent uniqueness of
/// `LedgerEntry::external_reference` remains the durable source of truth
/// after this row expires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// The external reference (unique key)
    pub external_reference: String,

    /// Account the first attempt mutated
    pub account_id: AccountId,

    /// Entry the first attempt created
    pub entry_id: Uuid,

    /// Signed amount the first attempt applied
    pub delta: i64,

    /// Balance snapshot returned to the first caller
    pub balance_after: u64,

    /// When the first attempt was processed
    pub recorded_at: DateTime<Utc>,

    /// End of the retention window
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Whether the retention window has elapsed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Result of a single-account mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    /// Entry the mutation created (or the original entry, when replayed)
    pub entry_id: Uuid,

    /// Mutated account
    pub account_id: AccountId,

    /// Balance after the mutation
    pub balance: u64,

    /// True when served from the idempotency path without a new mutation
    pub duplicate: bool,
}

/// Result of an account-to-account transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferReceipt {
    /// Debit entry on the source account
    pub debit_entry_id: Uuid,

    /// Credit entry on the destination account
    pub credit_entry_id: Uuid,

    /// Source balance after the transfer
    pub source_balance: u64,

    /// Destination balance after the transfer
    pub dest_balance: u64,
}
