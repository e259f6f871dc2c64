//! Keyed exclusive locks for account mutation
//!
//! Every balance mutation runs inside the owning account's lock; the lock
//! scope is a single read-modify-write, so contention stays bounded.
//! Acquisition blocks rather than skipping, up to a configured per-attempt
//! timeout with bounded retries (exponential backoff plus jitter). A timeout
//! before acquisition is a clean no-op for the caller.
//!
//! Pair acquisition (transfers, merges) takes both locks in lexicographic
//! account-id order, so two transfers in opposite directions cannot
//! deadlock.

use crate::{
    config::LockingConfig,
    error::{Error, Result},
    types::AccountId,
};
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{sleep, timeout, Duration};

/// Exclusive hold on one account; mutation rights last until drop
#[derive(Debug)]
pub struct AccountGuard {
    _guard: OwnedMutexGuard<()>,
}

/// Exclusive hold on two accounts (transfer scope)
#[derive(Debug)]
pub struct PairGuard {
    _first: OwnedMutexGuard<()>,
    _second: OwnedMutexGuard<()>,
}

/// Lock table keyed by account id
pub struct AccountLocks {
    locks: DashMap<AccountId, Arc<Mutex<()>>>,
    config: LockingConfig,
}

impl AccountLocks {
    /// Create a lock table
    pub fn new(config: LockingConfig) -> Self {
        Self {
            locks: DashMap::new(),
            config,
        }
    }

    fn lock_for(&self, account_id: &AccountId) -> Arc<Mutex<()>> {
        self.locks
            .entry(account_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.config.acquire_timeout_ms)
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.retry_base_delay_ms.saturating_mul(1 << attempt);
        let jitter = rand::thread_rng().gen_range(0..=self.config.retry_base_delay_ms);
        Duration::from_millis(base + jitter)
    }

    /// Acquire the account's exclusive lock
    ///
    /// Blocks until acquired, retrying with backoff; surfaces
    /// [`Error::LockTimeout`] once the attempt budget is exhausted.
    pub async fn acquire(&self, account_id: &AccountId) -> Result<AccountGuard> {
        let lock = self.lock_for(account_id);

        for attempt in 0..self.config.retry_attempts {
            match timeout(self.attempt_timeout(), lock.clone().lock_owned()).await {
                Ok(guard) => return Ok(AccountGuard { _guard: guard }),
                Err(_) => {
                    tracing::warn!(
                        account_id = %account_id,
                        attempt = attempt + 1,
                        "Account lock attempt timed out"
                    );
                    if attempt + 1 < self.config.retry_attempts {
                        sleep(self.backoff_delay(attempt)).await;
                    }
                }
            }
        }

        Err(Error::LockTimeout(account_id.to_string()))
    }

    /// Acquire two account locks in fixed global order
    ///
    /// If the second lock cannot be taken, the first is released before
    /// backing off, so a stalled transfer never wedges other writers.
    pub async fn acquire_pair(&self, a: &AccountId, b: &AccountId) -> Result<PairGuard> {
        if a == b {
            return Err(Error::InvalidTransaction(format!(
                "Cannot lock account {} against itself",
                a
            )));
        }

        let (first_id, second_id) = if a < b { (a, b) } else { (b, a) };
        let first_lock = self.lock_for(first_id);
        let second_lock = self.lock_for(second_id);

        for attempt in 0..self.config.retry_attempts {
            let first = match timeout(self.attempt_timeout(), first_lock.clone().lock_owned()).await
            {
                Ok(guard) => guard,
                Err(_) => {
                    if attempt + 1 < self.config.retry_attempts {
                        sleep(self.backoff_delay(attempt)).await;
                        continue;
                    }
                    return Err(Error::LockTimeout(first_id.to_string()));
                }
            };

            match timeout(self.attempt_timeout(), second_lock.clone().lock_owned()).await {
                Ok(second) => {
                    return Ok(PairGuard {
                        _first: first,
                        _second: second,
                    })
                }
                Err(_) => {
                    drop(first);
                    tracing::warn!(
                        account_id = %second_id,
                        attempt = attempt + 1,
                        "Second lock of pair timed out"
                    );
                    if attempt + 1 < self.config.retry_attempts {
                        sleep(self.backoff_delay(attempt)).await;
                    }
                }
            }
        }

        Err(Error::LockTimeout(second_id.to_string()))
    }
}
