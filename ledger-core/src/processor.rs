//! Transaction processor: the sole mutator of account balances
//!
//! Every mutation follows the same shape: acquire the account lock,
//! validate invariants against a fresh read, stage the new account row and
//! its audit entry in memory, and commit both in one atomic storage batch.
//! The lock scope is exactly one read-modify-write, so per-account entry
//! order matches the order mutations took effect.
//!
//! Credits carrying an external reference are idempotent: a replay is
//! served from the idempotency index, and the store-level uniqueness
//! constraint breaks ties between concurrent duplicates.

use crate::{
    idempotency::IdempotencyIndex,
    locks::AccountLocks,
    metrics::Metrics,
    storage::Storage,
    types::{
        Account, AccountId, EntryContext, IdempotencyRecord, LedgerEntry, Reason, Receipt,
        TransferReceipt,
    },
    Config, Error, Result,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// The only component permitted to mutate account balances
pub struct TransactionProcessor {
    storage: Arc<Storage>,
    locks: AccountLocks,
    idempotency: IdempotencyIndex,
    metrics: Metrics,
}

impl TransactionProcessor {
    /// Create a processor over the given storage
    pub fn new(storage: Arc<Storage>, config: &Config) -> Self {
        Self {
            storage: storage.clone(),
            locks: AccountLocks::new(config.locking.clone()),
            idempotency: IdempotencyIndex::new(storage, config.idempotency.clone()),
            metrics: Metrics::default(),
        }
    }

    /// Replace the metrics collector (shared registries, tests)
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Underlying storage handle
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Idempotency index handle (for the purge sweep)
    pub fn idempotency(&self) -> &IdempotencyIndex {
        &self.idempotency
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    // Provisioning

    /// Provision an account on first contact
    ///
    /// Creates the account with zero balance and applies `initial_grant`
    /// (if any) as an `InitialGrant` credit. An already-provisioned
    /// account is returned untouched; the grant is never repeated.
    pub async fn open_account(
        &self,
        account_id: &AccountId,
        initial_grant: u64,
    ) -> Result<Account> {
        let _guard = self.acquire_lock(account_id).await?;

        if let Some(existing) = self.storage.try_get_account(account_id)? {
            return Ok(existing);
        }

        let mut account = Account::new(account_id.clone());

        if initial_grant > 0 {
            let grant = validated_amount(initial_grant)?;
            account.balance = initial_grant;
            account.lifetime_credited = initial_grant;
            account.version = 1;
            account.updated_at = Utc::now();

            let entry = LedgerEntry {
                entry_id: Uuid::now_v7(),
                account_id: account_id.clone(),
                delta: grant,
                reason: Reason::InitialGrant,
                balance_after: account.balance,
                external_reference: None,
                context: EntryContext::default(),
                created_at: Utc::now(),
            };
            self.storage.append_entry_atomic(&account, &entry, None)?;
            self.metrics.record_credit();
        } else {
            self.storage.put_account(&account)?;
        }

        tracing::info!(
            account_id = %account_id,
            initial_grant,
            "Account provisioned"
        );

        Ok(account)
    }

    /// Soft-delete an account (terminal)
    ///
    /// All further mutation fails with [`Error::AccountClosed`]. Closing an
    /// already-closed account is a no-op.
    pub async fn close_account(&self, account_id: &AccountId) -> Result<Account> {
        let _guard = self.acquire_lock(account_id).await?;

        let mut account = self.storage.get_account(account_id)?;
        if account.is_closed() {
            return Ok(account);
        }

        if account.balance > 0 {
            tracing::warn!(
                account_id = %account_id,
                balance = account.balance,
                "Closing account with remaining credits"
            );
        }

        account.status = crate::types::AccountStatus::Closed;
        account.version += 1;
        account.updated_at = Utc::now();
        self.storage.put_account(&account)?;

        tracing::info!(account_id = %account_id, "Account closed");

        Ok(account)
    }

    // Reads

    /// Current balance, read without the account lock
    ///
    /// Display purposes only: never base a financial decision on this
    /// value. Mutating operations re-read inside the lock.
    pub fn balance(&self, account_id: &AccountId) -> Result<u64> {
        Ok(self.storage.get_account(account_id)?.balance)
    }

    /// Full account row, read without the account lock
    pub fn get_account(&self, account_id: &AccountId) -> Result<Account> {
        self.storage.get_account(account_id)
    }

    /// Audit log slice for an account, in insertion order
    pub fn history(
        &self,
        account_id: &AccountId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>> {
        // Surface a missing account instead of an empty history
        self.storage.get_account(account_id)?;

        let entries = self.storage.get_account_entries(account_id)?;
        Ok(entries.into_iter().skip(offset).take(limit).collect())
    }

    /// Reconciliation check: `balance == Σ(delta)` over the audit log
    pub fn verify_conservation(&self, account_id: &AccountId) -> Result<bool> {
        let account = self.storage.get_account(account_id)?;
        let entries = self.storage.get_account_entries(account_id)?;

        let sum: i128 = entries.iter().map(|e| e.delta as i128).sum();
        Ok(sum == account.balance as i128)
    }

    // Mutations

    /// Add credits to an account
    ///
    /// With an `external_reference` the operation is safe to retry
    /// indefinitely: replays return the first outcome without mutating,
    /// and concurrent duplicates are resolved by the store's uniqueness
    /// constraint. A replay whose amount or account conflicts with the
    /// first attempt fails with [`Error::DuplicateReference`].
    pub async fn credit(
        &self,
        account_id: &AccountId,
        amount: u64,
        reason: Reason,
        external_reference: Option<String>,
        context: EntryContext,
    ) -> Result<Receipt> {
        let delta = validated_amount(amount)?;

        // Fast path: already processed (optimization only; the store
        // constraint below is the correctness mechanism)
        if let Some(reference) = &external_reference {
            if let Some(record) = self.idempotency.lookup(reference)? {
                self.metrics.record_duplicate_reference();
                return replay_receipt(&record, account_id, delta);
            }
        }

        let _guard = self.acquire_lock(account_id).await?;

        let mut account = self.storage.get_account(account_id)?;
        ensure_open(&account)?;

        let new_balance = account.balance.checked_add(amount).ok_or_else(|| {
            Error::InvariantViolation(format!("Balance overflow on account {}", account_id))
        })?;

        account.balance = new_balance;
        account.lifetime_credited = account.lifetime_credited.saturating_add(amount);
        account.version += 1;
        account.updated_at = Utc::now();

        let entry = LedgerEntry {
            entry_id: Uuid::now_v7(),
            account_id: account_id.clone(),
            delta,
            reason,
            balance_after: new_balance,
            external_reference: external_reference.clone(),
            context,
            created_at: Utc::now(),
        };
        let record = self.idempotency.record_for(&entry);

        match self.storage.append_entry_atomic(&account, &entry, record.as_ref()) {
            Ok(()) => {
                self.metrics.record_credit();
                tracing::debug!(
                    account_id = %account_id,
                    amount,
                    reason = %reason,
                    balance = new_balance,
                    "Credit applied"
                );
                Ok(Receipt {
                    entry_id: entry.entry_id,
                    account_id: account_id.clone(),
                    balance: new_balance,
                    duplicate: false,
                })
            }
            Err(Error::DuplicateReference(reference)) => {
                // Lost the insert race: convert into a cache-hit read
                self.metrics.record_duplicate_reference();
                let record = self.idempotency.lookup(&reference)?.ok_or_else(|| {
                    Error::InvariantViolation(format!(
                        "Reference {} registered but not resolvable",
                        reference
                    ))
                })?;
                replay_receipt(&record, account_id, delta)
            }
            Err(e) => Err(e),
        }
    }

    /// Remove credits from an account
    ///
    /// An insufficient balance aborts with no mutation and no entry; the
    /// check is race-free because it runs inside the account lock.
    pub async fn debit(
        &self,
        account_id: &AccountId,
        amount: u64,
        reason: Reason,
        context: EntryContext,
    ) -> Result<Receipt> {
        let delta = validated_amount(amount)?;

        let _guard = self.acquire_lock(account_id).await?;

        let mut account = self.storage.get_account(account_id)?;
        ensure_open(&account)?;

        if account.balance < amount {
            self.metrics.record_insufficient_funds();
            return Err(Error::InsufficientFunds {
                required: amount,
                available: account.balance,
            });
        }

        let new_balance = account.balance - amount;
        account.balance = new_balance;
        account.version += 1;
        account.updated_at = Utc::now();

        let entry = LedgerEntry {
            entry_id: Uuid::now_v7(),
            account_id: account_id.clone(),
            delta: -delta,
            reason,
            balance_after: new_balance,
            external_reference: None,
            context,
            created_at: Utc::now(),
        };
        self.storage.append_entry_atomic(&account, &entry, None)?;

        self.metrics.record_debit();
        tracing::debug!(
            account_id = %account_id,
            amount,
            reason = %reason,
            balance = new_balance,
            "Debit applied"
        );

        Ok(Receipt {
            entry_id: entry.entry_id,
            account_id: account_id.clone(),
            balance: new_balance,
            duplicate: false,
        })
    }

    /// Move credits between accounts as one logical unit
    ///
    /// Both locks are taken in fixed global order (lexicographic by id),
    /// the outcome is staged in memory, and both account rows plus both
    /// entries commit in a single atomic batch, so the debit can never be
    /// left applied without its credit.
    pub async fn transfer(
        &self,
        source_id: &AccountId,
        dest_id: &AccountId,
        amount: u64,
        reason: Reason,
    ) -> Result<TransferReceipt> {
        let delta = validated_amount(amount)?;
        if source_id == dest_id {
            return Err(Error::InvalidTransaction(format!(
                "Cannot transfer from account {} to itself",
                source_id
            )));
        }

        let _guard = self.locks.acquire_pair(source_id, dest_id).await?;

        let mut source = self.storage.get_account(source_id)?;
        let mut dest = self.storage.get_account(dest_id)?;
        ensure_open(&source)?;
        ensure_open(&dest)?;

        if source.balance < amount {
            self.metrics.record_insufficient_funds();
            return Err(Error::InsufficientFunds {
                required: amount,
                available: source.balance,
            });
        }

        let dest_balance = dest.balance.checked_add(amount).ok_or_else(|| {
            Error::InvariantViolation(format!("Balance overflow on account {}", dest_id))
        })?;

        source.balance -= amount;
        source.version += 1;
        source.updated_at = Utc::now();

        dest.balance = dest_balance;
        dest.lifetime_credited = dest.lifetime_credited.saturating_add(amount);
        dest.version += 1;
        dest.updated_at = Utc::now();

        let debit_entry_id = Uuid::now_v7();
        let credit_entry_id = Uuid::now_v7();
        let now = Utc::now();

        let debit = LedgerEntry {
            entry_id: debit_entry_id,
            account_id: source_id.clone(),
            delta: -delta,
            reason,
            balance_after: source.balance,
            external_reference: None,
            context: EntryContext::related_to(credit_entry_id),
            created_at: now,
        };
        let credit = LedgerEntry {
            entry_id: credit_entry_id,
            account_id: dest_id.clone(),
            delta,
            reason,
            balance_after: dest.balance,
            external_reference: None,
            context: EntryContext::related_to(debit_entry_id),
            created_at: now,
        };

        self.storage
            .apply_transfer_atomic(&source, &debit, &dest, &credit)?;

        self.metrics.record_transfer();
        tracing::info!(
            source = %source_id,
            dest = %dest_id,
            amount,
            reason = %reason,
            "Transfer applied"
        );

        Ok(TransferReceipt {
            debit_entry_id,
            credit_entry_id,
            source_balance: source.balance,
            dest_balance: dest.balance,
        })
    }

    /// Merge a temporary identity's balance into a permanent one
    ///
    /// Moves the full source balance with `Reason::AccountMerge`, then
    /// closes the source, all under the same pair of locks. Returns `None`
    /// when the source had nothing to move (it is still closed).
    pub async fn merge_accounts(
        &self,
        source_id: &AccountId,
        dest_id: &AccountId,
    ) -> Result<Option<TransferReceipt>> {
        if source_id == dest_id {
            return Err(Error::InvalidTransaction(format!(
                "Cannot merge account {} into itself",
                source_id
            )));
        }

        let _guard = self.locks.acquire_pair(source_id, dest_id).await?;

        let mut source = self.storage.get_account(source_id)?;
        let mut dest = self.storage.get_account(dest_id)?;
        ensure_open(&source)?;
        ensure_open(&dest)?;

        let amount = source.balance;
        let receipt = if amount > 0 {
            let delta = validated_amount(amount)?;
            let dest_balance = dest.balance.checked_add(amount).ok_or_else(|| {
                Error::InvariantViolation(format!("Balance overflow on account {}", dest_id))
            })?;

            source.balance = 0;
            source.status = crate::types::AccountStatus::Closed;
            source.version += 1;
            source.updated_at = Utc::now();

            dest.balance = dest_balance;
            dest.lifetime_credited = dest.lifetime_credited.saturating_add(amount);
            dest.version += 1;
            dest.updated_at = Utc::now();

            let debit_entry_id = Uuid::now_v7();
            let credit_entry_id = Uuid::now_v7();
            let now = Utc::now();

            let debit = LedgerEntry {
                entry_id: debit_entry_id,
                account_id: source_id.clone(),
                delta: -delta,
                reason: Reason::AccountMerge,
                balance_after: 0,
                external_reference: None,
                context: EntryContext::related_to(credit_entry_id),
                created_at: now,
            };
            let credit = LedgerEntry {
                entry_id: credit_entry_id,
                account_id: dest_id.clone(),
                delta,
                reason: Reason::AccountMerge,
                balance_after: dest.balance,
                external_reference: None,
                context: EntryContext::related_to(debit_entry_id),
                created_at: now,
            };

            self.storage
                .apply_transfer_atomic(&source, &debit, &dest, &credit)?;
            self.metrics.record_transfer();

            Some(TransferReceipt {
                debit_entry_id,
                credit_entry_id,
                source_balance: 0,
                dest_balance: dest.balance,
            })
        } else {
            source.status = crate::types::AccountStatus::Closed;
            source.version += 1;
            source.updated_at = Utc::now();
            self.storage.put_account(&source)?;
            None
        };

        tracing::info!(
            source = %source_id,
            dest = %dest_id,
            moved = amount,
            "Accounts merged"
        );

        Ok(receipt)
    }

    /// Claw back a previously-credited purchase
    ///
    /// The balance is reduced by at most its current value (the account
    /// lands on exactly zero, never below) and any uncovered remainder is
    /// recorded as a zero-delta `WriteOff` entry carrying the shortfall.
    /// Replays are deduplicated through the derived `reversal:` reference.
    pub async fn reverse_purchase(
        &self,
        external_reference: &str,
        context: EntryContext,
    ) -> Result<Receipt> {
        let reversal_reference = format!("reversal:{}", external_reference);

        if let Some(record) = self.idempotency.lookup(&reversal_reference)? {
            self.metrics.record_duplicate_reference();
            return Ok(Receipt {
                entry_id: record.entry_id,
                account_id: record.account_id,
                balance: record.balance_after,
                duplicate: true,
            });
        }

        let entry_id = self
            .storage
            .lookup_external_reference(external_reference)?
            .ok_or_else(|| {
                Error::InvalidTransaction(format!(
                    "No purchase recorded for reference {}",
                    external_reference
                ))
            })?;
        let purchase = self.storage.get_entry(entry_id)?.ok_or_else(|| {
            Error::InvariantViolation(format!(
                "Reference {} registered but entry {} is missing",
                external_reference, entry_id
            ))
        })?;

        if purchase.reason != Reason::Purchase || !purchase.is_credit() {
            return Err(Error::InvalidTransaction(format!(
                "Reference {} does not name a purchase credit",
                external_reference
            )));
        }
        let amount = purchase.delta as u64;

        let account_id = purchase.account_id.clone();
        let _guard = self.acquire_lock(&account_id).await?;

        let mut account = self.storage.get_account(&account_id)?;
        ensure_open(&account)?;

        let recoverable = account.balance.min(amount);
        let shortfall = amount - recoverable;

        account.balance -= recoverable;
        account.version += 1;
        account.updated_at = Utc::now();

        let mut reversal_context = context;
        reversal_context.related_entry_id = Some(purchase.entry_id);
        if shortfall > 0 {
            reversal_context.shortfall = Some(shortfall);
        }

        let reversal = LedgerEntry {
            entry_id: Uuid::now_v7(),
            account_id: account_id.clone(),
            delta: -(recoverable as i64),
            reason: Reason::PurchaseReversal,
            balance_after: account.balance,
            external_reference: Some(reversal_reference),
            context: reversal_context,
            created_at: Utc::now(),
        };
        let record = self.idempotency.record_for(&reversal);
        self.storage
            .append_entry_atomic(&account, &reversal, record.as_ref())?;
        self.metrics.record_debit();

        if shortfall > 0 {
            // Uncollectable remainder: explicit zero-delta audit record
            account.version += 1;
            account.updated_at = Utc::now();
            let write_off = LedgerEntry {
                entry_id: Uuid::now_v7(),
                account_id: account_id.clone(),
                delta: 0,
                reason: Reason::WriteOff,
                balance_after: account.balance,
                external_reference: None,
                context: EntryContext {
                    related_entry_id: Some(reversal.entry_id),
                    shortfall: Some(shortfall),
                    ..EntryContext::default()
                },
                created_at: Utc::now(),
            };
            self.storage.append_entry_atomic(&account, &write_off, None)?;

            tracing::warn!(
                account_id = %account_id,
                reference = external_reference,
                shortfall,
                "Purchase reversal exceeded balance; shortfall written off"
            );
        }

        Ok(Receipt {
            entry_id: reversal.entry_id,
            account_id,
            balance: account.balance,
            duplicate: false,
        })
    }

    /// Signed operator adjustment
    pub async fn adjust(
        &self,
        account_id: &AccountId,
        delta: i64,
        context: EntryContext,
    ) -> Result<Receipt> {
        match delta {
            d if d > 0 => {
                self.credit(account_id, d as u64, Reason::AdminAdjustment, None, context)
                    .await
            }
            d if d < 0 => {
                self.debit(account_id, d.unsigned_abs(), Reason::AdminAdjustment, context)
                    .await
            }
            _ => Err(Error::InvalidTransaction(
                "Adjustment delta must be non-zero".to_string(),
            )),
        }
    }

    async fn acquire_lock(&self, account_id: &AccountId) -> Result<crate::locks::AccountGuard> {
        let start = Instant::now();
        let guard = self.locks.acquire(account_id).await?;
        self.metrics.record_lock_wait(start.elapsed().as_secs_f64());
        Ok(guard)
    }
}

/// Amount must be positive and fit the signed delta range
fn validated_amount(amount: u64) -> Result<i64> {
    if amount == 0 {
        return Err(Error::InvalidTransaction(
            "Amount must be positive".to_string(),
        ));
    }
    i64::try_from(amount)
        .map_err(|_| Error::InvalidTransaction("Amount exceeds ledger range".to_string()))
}

fn ensure_open(account: &Account) -> Result<()> {
    if account.is_closed() {
        return Err(Error::AccountClosed(account.account_id.to_string()));
    }
    Ok(())
}

/// Serve a replay from the recorded first outcome
///
/// A replay must match what it replays: a conflicting amount or account
/// is a caller bug, surfaced as `DuplicateReference`.
fn replay_receipt(
    record: &IdempotencyRecord,
    account_id: &AccountId,
    delta: i64,
) -> Result<Receipt> {
    if record.account_id != *account_id || record.delta != delta {
        return Err(Error::DuplicateReference(format!(
            "Reference {} already processed with different parameters",
            record.external_reference
        )));
    }
    Ok(Receipt {
        entry_id: record.entry_id,
        account_id: record.account_id.clone(),
        balance: record.balance_after,
        duplicate: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_processor() -> (TransactionProcessor, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());
        (TransactionProcessor::new(storage, &config), temp_dir)
    }

    fn account(name: &str) -> AccountId {
        AccountId::new(name)
    }

    #[tokio::test]
    async fn test_open_account_with_grant_is_one_shot() {
        let (processor, _temp) = test_processor().await;
        let id = account("user-1");

        let opened = processor.open_account(&id, 10).await.unwrap();
        assert_eq!(opened.balance, 10);
        assert_eq!(opened.lifetime_credited, 10);

        // Second contact returns the account untouched, no second grant
        let again = processor.open_account(&id, 10).await.unwrap();
        assert_eq!(again.balance, 10);
        assert_eq!(processor.history(&id, 10, 0).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_credit_and_debit_round_trip() {
        let (processor, _temp) = test_processor().await;
        let id = account("user-1");
        processor.open_account(&id, 0).await.unwrap();

        let receipt = processor
            .credit(&id, 50, Reason::Purchase, None, EntryContext::default())
            .await
            .unwrap();
        assert_eq!(receipt.balance, 50);
        assert!(!receipt.duplicate);

        let receipt = processor
            .debit(&id, 20, Reason::JobCharge, EntryContext::default())
            .await
            .unwrap();
        assert_eq!(receipt.balance, 30);

        assert_eq!(processor.balance(&id).unwrap(), 30);
        assert_eq!(processor.get_account(&id).unwrap().lifetime_credited, 50);

        let entries = processor.history(&id, 10, 0).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].delta, 50);
        assert_eq!(entries[1].delta, -20);
        assert_eq!(entries[1].balance_after, 30);
    }

    #[tokio::test]
    async fn test_debit_insufficient_funds_makes_no_mark() {
        let (processor, _temp) = test_processor().await;
        let id = account("user-1");
        processor.open_account(&id, 4).await.unwrap();

        let err = processor
            .debit(&id, 10, Reason::JobCharge, EntryContext::default())
            .await
            .unwrap_err();
        match err {
            Error::InsufficientFunds {
                required,
                available,
            } => {
                assert_eq!(required, 10);
                assert_eq!(available, 4);
            }
            other => panic!("expected InsufficientFunds, got {:?}", other),
        }

        // No mutation, no entry
        assert_eq!(processor.balance(&id).unwrap(), 4);
        assert_eq!(processor.history(&id, 10, 0).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_amount_rejected() {
        let (processor, _temp) = test_processor().await;
        let id = account("user-1");
        processor.open_account(&id, 0).await.unwrap();

        let err = processor
            .credit(&id, 0, Reason::Purchase, None, EntryContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransaction(_)));

        let err = processor
            .debit(&id, 0, Reason::JobCharge, EntryContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransaction(_)));
    }

    #[tokio::test]
    async fn test_unknown_account_is_fatal() {
        let (processor, _temp) = test_processor().await;

        let err = processor
            .credit(
                &account("ghost"),
                10,
                Reason::Purchase,
                None,
                EntryContext::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AccountNotFound(_)));
    }

    #[tokio::test]
    async fn test_closed_account_forecloses_mutation() {
        let (processor, _temp) = test_processor().await;
        let id = account("user-1");
        processor.open_account(&id, 10).await.unwrap();
        processor.close_account(&id).await.unwrap();

        let err = processor
            .credit(&id, 5, Reason::Purchase, None, EntryContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AccountClosed(_)));

        let err = processor
            .debit(&id, 5, Reason::JobCharge, EntryContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AccountClosed(_)));

        // Closing twice is a no-op
        let again = processor.close_account(&id).await.unwrap();
        assert!(again.is_closed());
    }

    #[tokio::test]
    async fn test_credit_replay_returns_first_outcome() {
        let (processor, _temp) = test_processor().await;
        let id = account("user-1");
        processor.open_account(&id, 10).await.unwrap();

        let first = processor
            .credit(
                &id,
                50,
                Reason::Purchase,
                Some("txn-123".to_string()),
                EntryContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(first.balance, 60);
        assert!(!first.duplicate);

        let replay = processor
            .credit(
                &id,
                50,
                Reason::Purchase,
                Some("txn-123".to_string()),
                EntryContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(replay.balance, 60);
        assert!(replay.duplicate);
        assert_eq!(replay.entry_id, first.entry_id);

        // One entry, same final balance as calling once
        assert_eq!(processor.balance(&id).unwrap(), 60);
        assert_eq!(processor.history(&id, 10, 0).unwrap().len(), 2); // grant + purchase
    }

    #[tokio::test]
    async fn test_conflicting_replay_is_rejected() {
        let (processor, _temp) = test_processor().await;
        let id = account("user-1");
        processor.open_account(&id, 0).await.unwrap();

        processor
            .credit(
                &id,
                50,
                Reason::Purchase,
                Some("txn-123".to_string()),
                EntryContext::default(),
            )
            .await
            .unwrap();

        // Same reference, different amount
        let err = processor
            .credit(
                &id,
                75,
                Reason::Purchase,
                Some("txn-123".to_string()),
                EntryContext::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateReference(_)));
        assert_eq!(processor.balance(&id).unwrap(), 50);
    }

    #[tokio::test]
    async fn test_transfer_moves_balance_atomically() {
        let (processor, _temp) = test_processor().await;
        let alice = account("alice");
        let bob = account("bob");
        processor.open_account(&alice, 100).await.unwrap();
        processor.open_account(&bob, 0).await.unwrap();

        let receipt = processor
            .transfer(&alice, &bob, 30, Reason::AccountMerge)
            .await
            .unwrap();
        assert_eq!(receipt.source_balance, 70);
        assert_eq!(receipt.dest_balance, 30);

        // Entries reference each other
        let alice_entries = processor.history(&alice, 10, 0).unwrap();
        let debit = alice_entries.last().unwrap();
        assert_eq!(debit.delta, -30);
        assert_eq!(debit.context.related_entry_id, Some(receipt.credit_entry_id));

        let bob_entries = processor.history(&bob, 10, 0).unwrap();
        let credit = bob_entries.last().unwrap();
        assert_eq!(credit.delta, 30);
        assert_eq!(credit.context.related_entry_id, Some(receipt.debit_entry_id));

        assert!(processor.verify_conservation(&alice).unwrap());
        assert!(processor.verify_conservation(&bob).unwrap());
    }

    #[tokio::test]
    async fn test_transfer_insufficient_and_self() {
        let (processor, _temp) = test_processor().await;
        let alice = account("alice");
        let bob = account("bob");
        processor.open_account(&alice, 10).await.unwrap();
        processor.open_account(&bob, 0).await.unwrap();

        let err = processor
            .transfer(&alice, &bob, 20, Reason::AccountMerge)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));
        assert_eq!(processor.balance(&alice).unwrap(), 10);
        assert_eq!(processor.balance(&bob).unwrap(), 0);

        let err = processor
            .transfer(&alice, &alice, 5, Reason::AccountMerge)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransaction(_)));
    }

    #[tokio::test]
    async fn test_merge_accounts_moves_all_and_closes_source() {
        let (processor, _temp) = test_processor().await;
        let temp = account("device-temp");
        let user = account("user-1");
        processor.open_account(&temp, 25).await.unwrap();
        processor.open_account(&user, 10).await.unwrap();

        let receipt = processor.merge_accounts(&temp, &user).await.unwrap().unwrap();
        assert_eq!(receipt.source_balance, 0);
        assert_eq!(receipt.dest_balance, 35);

        assert!(processor.get_account(&temp).unwrap().is_closed());
        assert_eq!(processor.balance(&user).unwrap(), 35);
    }

    #[tokio::test]
    async fn test_merge_empty_source_just_closes() {
        let (processor, _temp) = test_processor().await;
        let temp = account("device-temp");
        let user = account("user-1");
        processor.open_account(&temp, 0).await.unwrap();
        processor.open_account(&user, 10).await.unwrap();

        let receipt = processor.merge_accounts(&temp, &user).await.unwrap();
        assert!(receipt.is_none());
        assert!(processor.get_account(&temp).unwrap().is_closed());
        assert_eq!(processor.balance(&user).unwrap(), 10);
    }

    #[tokio::test]
    async fn test_reverse_purchase_full_recovery() {
        let (processor, _temp) = test_processor().await;
        let id = account("user-1");
        processor.open_account(&id, 10).await.unwrap();
        processor
            .credit(
                &id,
                50,
                Reason::Purchase,
                Some("txn-123".to_string()),
                EntryContext::default(),
            )
            .await
            .unwrap();

        let receipt = processor
            .reverse_purchase("txn-123", EntryContext::default())
            .await
            .unwrap();
        assert_eq!(receipt.balance, 10);

        // Replay is deduplicated
        let replay = processor
            .reverse_purchase("txn-123", EntryContext::default())
            .await
            .unwrap();
        assert!(replay.duplicate);
        assert_eq!(processor.balance(&id).unwrap(), 10);
        assert!(processor.verify_conservation(&id).unwrap());
    }

    #[tokio::test]
    async fn test_reverse_purchase_shortfall_writes_off() {
        let (processor, _temp) = test_processor().await;
        let id = account("user-1");
        processor.open_account(&id, 0).await.unwrap();
        processor
            .credit(
                &id,
                50,
                Reason::Purchase,
                Some("txn-123".to_string()),
                EntryContext::default(),
            )
            .await
            .unwrap();
        // Spend most of the purchase before the reversal arrives
        processor
            .debit(&id, 40, Reason::JobCharge, EntryContext::default())
            .await
            .unwrap();

        let receipt = processor
            .reverse_purchase("txn-123", EntryContext::default())
            .await
            .unwrap();
        // Balance lands on exactly zero, never below
        assert_eq!(receipt.balance, 0);

        let entries = processor.history(&id, 10, 0).unwrap();
        let reversal = &entries[entries.len() - 2];
        assert_eq!(reversal.reason, Reason::PurchaseReversal);
        assert_eq!(reversal.delta, -10);
        assert_eq!(reversal.context.shortfall, Some(40));

        let write_off = entries.last().unwrap();
        assert_eq!(write_off.reason, Reason::WriteOff);
        assert_eq!(write_off.delta, 0);
        assert_eq!(write_off.context.shortfall, Some(40));
        assert_eq!(write_off.context.related_entry_id, Some(reversal.entry_id));

        assert!(processor.verify_conservation(&id).unwrap());
    }

    #[tokio::test]
    async fn test_reverse_unknown_reference_rejected() {
        let (processor, _temp) = test_processor().await;
        let err = processor
            .reverse_purchase("txn-unknown", EntryContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransaction(_)));
    }

    #[tokio::test]
    async fn test_adjust_routes_by_sign() {
        let (processor, _temp) = test_processor().await;
        let id = account("user-1");
        processor.open_account(&id, 10).await.unwrap();

        let receipt = processor
            .adjust(&id, 15, EntryContext::default())
            .await
            .unwrap();
        assert_eq!(receipt.balance, 25);

        let receipt = processor
            .adjust(&id, -5, EntryContext::default())
            .await
            .unwrap();
        assert_eq!(receipt.balance, 20);

        let entries = processor.history(&id, 10, 0).unwrap();
        assert!(entries
            .iter()
            .skip(1)
            .all(|e| e.reason == Reason::AdminAdjustment));

        let err = processor
            .adjust(&id, 0, EntryContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransaction(_)));
    }

    #[tokio::test]
    async fn test_history_pagination() {
        let (processor, _temp) = test_processor().await;
        let id = account("user-1");
        processor.open_account(&id, 0).await.unwrap();

        for _ in 0..5 {
            processor
                .credit(&id, 10, Reason::Purchase, None, EntryContext::default())
                .await
                .unwrap();
        }

        let page = processor.history(&id, 2, 0).unwrap();
        assert_eq!(page.len(), 2);
        let page = processor.history(&id, 2, 4).unwrap();
        assert_eq!(page.len(), 1);

        let err = processor.history(&account("ghost"), 2, 0).unwrap_err();
        assert!(matches!(err, Error::AccountNotFound(_)));
    }

    #[tokio::test]
    async fn test_conservation_after_mixed_operations() {
        let (processor, _temp) = test_processor().await;
        let id = account("user-1");
        processor.open_account(&id, 10).await.unwrap();

        processor
            .credit(&id, 50, Reason::Purchase, Some("txn-1".to_string()), EntryContext::default())
            .await
            .unwrap();
        processor
            .debit(&id, 30, Reason::JobCharge, EntryContext::default())
            .await
            .unwrap();
        processor
            .credit(&id, 30, Reason::JobRefund, None, EntryContext::default())
            .await
            .unwrap();

        assert_eq!(processor.balance(&id).unwrap(), 60);
        assert!(processor.verify_conservation(&id).unwrap());
    }
}
