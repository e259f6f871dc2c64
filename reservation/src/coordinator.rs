//! Reservation coordinator: debit now, do unreliable work, refund on failure
//!
//! The coordinator is a protocol over transaction-processor calls plus a
//! durable job-state row; it owns no transactional storage of its own. The
//! sequence:
//!
//! 1. Debit the account (`job_charge`). Insufficient funds propagate
//!    immediately; no reservation is created.
//! 2. Persist a reservation in `Debited` state referencing the debit entry.
//! 3. Run the caller's external operation under its own timeout. The
//!    account lock is not held across this step.
//! 4. Success: mark `Confirmed`. Failure or timeout: issue a compensating
//!    credit (`job_refund`) and mark `Refunded`.
//!
//! The compensating credit carries the external reference
//! `refund:{reservation_id}`, so a crash between the credit and the status
//! write cannot double-refund: the ledger's uniqueness constraint absorbs
//! the replay when recovery retries.

use crate::{
    config::CoordinatorConfig,
    error::{Error, Result},
};
use chrono::Utc;
use ledger_core::{
    types::{AccountId, EntryContext, Reason, Reservation, ReservationStatus},
    TransactionProcessor,
};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

/// Successful outcome of [`ReservationCoordinator::reserve_and_charge`]
#[derive(Debug)]
pub struct Charge<T> {
    /// The confirmed reservation's id
    pub reservation_id: Uuid,

    /// Account balance after the charge
    pub balance: u64,

    /// Whatever the external operation returned
    pub output: T,
}

/// Orchestrates paid-job workflows against the ledger
pub struct ReservationCoordinator {
    processor: Arc<TransactionProcessor>,
    config: CoordinatorConfig,
}

impl ReservationCoordinator {
    /// Create a coordinator over the given processor
    pub fn new(processor: Arc<TransactionProcessor>, config: CoordinatorConfig) -> Self {
        Self { processor, config }
    }

    /// The underlying processor
    pub fn processor(&self) -> &Arc<TransactionProcessor> {
        &self.processor
    }

    /// Coordinator configuration
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Debit and run an external operation, refunding on failure
    ///
    /// The operation receives the reservation id (for tagging the external
    /// job) and runs under [`CoordinatorConfig::external_timeout`]. On
    /// success the reservation is confirmed and the operation's output
    /// returned; on failure or timeout the debit is compensated and the
    /// external error surfaced.
    pub async fn reserve_and_charge<F, Fut, T, E>(
        &self,
        account_id: &AccountId,
        amount: u64,
        operation: F,
    ) -> Result<Charge<T>>
    where
        F: FnOnce(Uuid) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: fmt::Display,
    {
        let reservation = self.reserve(account_id, amount, None).await?;
        let reservation_id = reservation.reservation_id;

        match tokio::time::timeout(
            self.config.external_timeout(),
            operation(reservation_id),
        )
        .await
        {
            Ok(Ok(output)) => {
                self.confirm(reservation_id).await?;
                Ok(Charge {
                    reservation_id,
                    balance: self.processor.balance(account_id)?,
                    output,
                })
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    reservation_id = %reservation_id,
                    account_id = %account_id,
                    error = %e,
                    "External operation failed; refunding"
                );
                self.refund(reservation_id).await?;
                Err(Error::External(e.to_string()))
            }
            Err(_) => {
                tracing::warn!(
                    reservation_id = %reservation_id,
                    account_id = %account_id,
                    timeout_ms = self.config.external_timeout_ms,
                    "External operation timed out; refunding"
                );
                self.refund(reservation_id).await?;
                Err(Error::ExternalTimeout(reservation_id))
            }
        }
    }

    /// Debit and persist a `Debited` reservation, without running anything
    ///
    /// The manual half of the protocol, for flows where the external
    /// outcome arrives later (webhooks, polling): the caller resolves the
    /// reservation through [`confirm`](Self::confirm) or
    /// [`refund`](Self::refund).
    pub async fn reserve(
        &self,
        account_id: &AccountId,
        amount: u64,
        external_operation_ref: Option<String>,
    ) -> Result<Reservation> {
        let reservation_id = Uuid::now_v7();

        let receipt = self
            .processor
            .debit(
                account_id,
                amount,
                Reason::JobCharge,
                EntryContext::for_job(reservation_id.to_string()),
            )
            .await?;

        let reservation = Reservation {
            reservation_id,
            account_id: account_id.clone(),
            amount,
            status: ReservationStatus::Debited,
            debit_entry_id: receipt.entry_id,
            refund_entry_id: None,
            external_operation_ref,
            created_at: Utc::now(),
            resolved_at: None,
        };

        if let Err(e) = self.processor.storage().put_reservation(&reservation) {
            // The debit landed but the reservation row did not: compensate
            // right away rather than leaving money taken with no tracker.
            tracing::error!(
                reservation_id = %reservation_id,
                account_id = %account_id,
                error = %e,
                "Failed to persist reservation; compensating debit"
            );
            self.compensating_credit(&reservation).await?;
            return Err(Error::Ledger(e));
        }

        tracing::debug!(
            reservation_id = %reservation_id,
            account_id = %account_id,
            amount,
            "Reservation debited"
        );

        Ok(reservation)
    }

    /// Mark a debited reservation confirmed (terminal)
    ///
    /// Confirming an already-confirmed reservation is an idempotent no-op;
    /// confirming a refunded one is a loud [`Error::StateViolation`].
    pub async fn confirm(&self, reservation_id: Uuid) -> Result<Reservation> {
        let mut reservation = self.load(reservation_id)?;

        match reservation.status {
            ReservationStatus::Debited => {
                reservation.status = ReservationStatus::Confirmed;
                reservation.resolved_at = Some(Utc::now());
                self.processor.storage().put_reservation(&reservation)?;

                tracing::info!(
                    reservation_id = %reservation_id,
                    account_id = %reservation.account_id,
                    amount = reservation.amount,
                    "Reservation confirmed"
                );
                Ok(reservation)
            }
            ReservationStatus::Confirmed => Ok(reservation),
            ReservationStatus::Refunded => Err(Error::StateViolation {
                reservation_id,
                status: reservation.status,
                attempted: ReservationStatus::Confirmed,
            }),
        }
    }

    /// Refund a debited reservation (terminal)
    ///
    /// Issues the compensating credit, then marks the reservation
    /// refunded. Refunding an already-refunded reservation is an
    /// idempotent no-op; refunding a confirmed one is a loud
    /// [`Error::StateViolation`].
    pub async fn refund(&self, reservation_id: Uuid) -> Result<Reservation> {
        let mut reservation = self.load(reservation_id)?;

        match reservation.status {
            ReservationStatus::Debited => {
                let refund_entry_id = self.compensating_credit(&reservation).await?;

                reservation.status = ReservationStatus::Refunded;
                reservation.refund_entry_id = refund_entry_id;
                reservation.resolved_at = Some(Utc::now());
                self.processor.storage().put_reservation(&reservation)?;

                tracing::info!(
                    reservation_id = %reservation_id,
                    account_id = %reservation.account_id,
                    amount = reservation.amount,
                    "Reservation refunded"
                );
                Ok(reservation)
            }
            ReservationStatus::Refunded => Ok(reservation),
            ReservationStatus::Confirmed => Err(Error::StateViolation {
                reservation_id,
                status: reservation.status,
                attempted: ReservationStatus::Refunded,
            }),
        }
    }

    /// Get a reservation by id
    pub fn get(&self, reservation_id: Uuid) -> Result<Reservation> {
        self.load(reservation_id)
    }

    fn load(&self, reservation_id: Uuid) -> Result<Reservation> {
        self.processor
            .storage()
            .get_reservation(reservation_id)?
            .ok_or_else(|| Error::ReservationNotFound(reservation_id.to_string()))
    }

    /// Issue the compensating credit for a debited reservation
    ///
    /// Deduplicated by the `refund:{reservation_id}` reference, so a retry
    /// after a crash cannot credit twice. Returns `None` when the account
    /// has been closed in the meantime: the terminal account state
    /// forecloses mutation, and that is logged loudly instead of wedging
    /// the reservation forever.
    async fn compensating_credit(&self, reservation: &Reservation) -> Result<Option<Uuid>> {
        let reference = format!("refund:{}", reservation.reservation_id);
        let context = EntryContext::related_to(reservation.debit_entry_id);

        match self
            .processor
            .credit(
                &reservation.account_id,
                reservation.amount,
                Reason::JobRefund,
                Some(reference),
                context,
            )
            .await
        {
            Ok(receipt) => Ok(Some(receipt.entry_id)),
            Err(ledger_core::Error::AccountClosed(_)) => {
                tracing::error!(
                    reservation_id = %reservation.reservation_id,
                    account_id = %reservation.account_id,
                    amount = reservation.amount,
                    "Refund target account is closed; resolving without a ledger entry"
                );
                Ok(None)
            }
            Err(e) => Err(Error::Ledger(e)),
        }
    }
}
