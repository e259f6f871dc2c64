//! Idempotency index for externally-sourced transactions
//!
//! Two layers make retries safe:
//!
//! 1. A bounded-retention cache of first responses ([`IdempotencyRecord`]),
//!    letting a replay short-circuit without touching the account lock.
//! 2. The permanent uniqueness of `LedgerEntry::external_reference`,
//!    enforced inside the store. The cache is an optimization; the
//!    constraint is the correctness mechanism.
//!
//! When a cached record has been purged, [`IdempotencyIndex::lookup`]
//! falls back to the reference registry and rebuilds the snapshot from
//! the original entry, so replays stay safe indefinitely.

use crate::{
    config::IdempotencyConfig,
    error::{Error, Result},
    storage::Storage,
    types::IdempotencyRecord,
};
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Lease name guarding the purge sweep
const SWEEP_LEASE: &str = "idempotency-purge";

/// Lookup/record surface over the two idempotency layers
#[derive(Clone)]
pub struct IdempotencyIndex {
    storage: Arc<Storage>,
    config: IdempotencyConfig,
}

impl IdempotencyIndex {
    /// Create an index over the given storage
    pub fn new(storage: Arc<Storage>, config: IdempotencyConfig) -> Self {
        Self { storage, config }
    }

    fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.config.retention_hours as i64)
    }

    /// Find the outcome of a previously processed reference, if any
    ///
    /// Checks the cache first, then the durable reference registry.
    pub fn lookup(&self, reference: &str) -> Result<Option<IdempotencyRecord>> {
        if let Some(record) = self.storage.get_idempotency(reference)? {
            return Ok(Some(record));
        }

        // Cache may have been purged; the ledger itself remembers.
        let Some(entry_id) = self.storage.lookup_external_reference(reference)? else {
            return Ok(None);
        };

        let entry = self.storage.get_entry(entry_id)?.ok_or_else(|| {
            Error::InvariantViolation(format!(
                "Reference {} registered but entry {} is missing",
                reference, entry_id
            ))
        })?;

        Ok(Some(IdempotencyRecord {
            external_reference: reference.to_string(),
            account_id: entry.account_id,
            entry_id: entry.entry_id,
            delta: entry.delta,
            balance_after: entry.balance_after,
            recorded_at: entry.created_at,
            expires_at: entry.created_at + self.retention(),
        }))
    }

    /// Build the cache record for an entry about to be committed
    ///
    /// The record is written in the same atomic batch as the entry it
    /// describes; it never exists without its entry.
    pub fn record_for(&self, entry: &crate::types::LedgerEntry) -> Option<IdempotencyRecord> {
        let reference = entry.external_reference.clone()?;
        let now = Utc::now();
        Some(IdempotencyRecord {
            external_reference: reference,
            account_id: entry.account_id.clone(),
            entry_id: entry.entry_id,
            delta: entry.delta,
            balance_after: entry.balance_after,
            recorded_at: now,
            expires_at: now + self.retention(),
        })
    }

    /// Purge expired cache rows; returns how many were dropped
    pub fn purge_expired(&self) -> Result<usize> {
        self.storage.purge_expired_idempotency(Utc::now())
    }

    /// Run one sweep cycle if the single-flight lease can be taken
    pub fn sweep_once(&self, holder: &str) -> Result<usize> {
        let ttl = chrono::Duration::seconds(self.config.lease_ttl_secs as i64);
        if !self
            .storage
            .try_acquire_lease(SWEEP_LEASE, holder, ttl, Utc::now())?
        {
            tracing::debug!("Idempotency sweep lease held elsewhere, skipping");
            return Ok(0);
        }

        let purged = self.purge_expired();
        self.storage.release_lease(SWEEP_LEASE, holder)?;

        let purged = purged?;
        if purged > 0 {
            tracing::info!(purged, "Purged expired idempotency records");
        }
        Ok(purged)
    }
}

/// Spawn the periodic purge sweep
///
/// One instance runs cluster-wide at a time, arbitrated by the storage
/// lease; extra instances wake up, fail the lease, and go back to sleep.
pub fn spawn_purge_sweep(index: IdempotencyIndex) -> JoinHandle<()> {
    let interval = tokio::time::Duration::from_secs(index.config.sweep_interval_secs);
    let holder = format!("sweep-{}", Uuid::new_v4());

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = index.sweep_once(&holder) {
                tracing::error!("Idempotency sweep failed: {}", e);
            }
        }
    })
}
