//! Recovery sweep for stale reservations
//!
//! A crash between debit and resolution leaves a reservation in `Debited`
//! with money taken and nothing delivered. The sweep scans for debited
//! reservations older than the staleness threshold and resolves every one:
//! it asks an [`OutcomeProbe`] what actually happened to the external
//! operation, confirms on a discovered success, and refunds otherwise
//! (`Unknown` defaults to refund). No reservation stays `Debited` past the
//! threshold.
//!
//! The sweep is single-flight cluster-wide: each cycle first takes an
//! advisory lease in storage, and instances that lose the lease skip the
//! cycle.

use crate::{
    config::CoordinatorConfig,
    coordinator::ReservationCoordinator,
    error::{Error, Result},
};
use async_trait::async_trait;
use chrono::Utc;
use ledger_core::types::Reservation;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Lease name guarding the recovery sweep
const SWEEP_LEASE: &str = "reservation-recovery";

/// What the external system reports for a stale reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The external operation demonstrably succeeded
    Succeeded,
    /// The external operation demonstrably failed
    Failed,
    /// The outcome cannot be determined
    Unknown,
}

/// Re-checks the actual outcome of a stale reservation's external operation
///
/// Supplied by the owner of the external collaborator (job provider
/// client, webhook store). Implementations that cannot discover outcomes
/// should return [`ProbeOutcome::Unknown`].
#[async_trait]
pub trait OutcomeProbe: Send + Sync {
    /// Probe the external operation behind `reservation`
    async fn probe(&self, reservation: &Reservation) -> ProbeOutcome;
}

/// Probe for deployments with no way to re-check outcomes: always refund
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultToRefund;

#[async_trait]
impl OutcomeProbe for DefaultToRefund {
    async fn probe(&self, _reservation: &Reservation) -> ProbeOutcome {
        ProbeOutcome::Unknown
    }
}

/// Counters from one sweep cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stale reservations examined
    pub examined: usize,
    /// Resolved to confirmed
    pub confirmed: usize,
    /// Resolved to refunded
    pub refunded: usize,
    /// Resolutions that errored (left for the next cycle)
    pub errors: usize,
    /// Terminal rows purged past their retention
    pub purged: usize,
}

/// Periodic resolver of stale reservations
pub struct RecoverySweep {
    coordinator: Arc<ReservationCoordinator>,
    probe: Arc<dyn OutcomeProbe>,
    holder: String,
}

impl RecoverySweep {
    /// Create a sweep over the coordinator with the given probe
    pub fn new(coordinator: Arc<ReservationCoordinator>, probe: Arc<dyn OutcomeProbe>) -> Self {
        Self {
            coordinator,
            probe,
            holder: format!("recovery-{}", Uuid::new_v4()),
        }
    }

    fn config(&self) -> &CoordinatorConfig {
        self.coordinator.config()
    }

    /// Run one sweep cycle if the single-flight lease can be taken
    pub async fn run_once(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let storage = self.coordinator.processor().storage().clone();
        let ttl = chrono::Duration::seconds(self.config().lease_ttl_secs as i64);

        if !storage
            .try_acquire_lease(SWEEP_LEASE, &self.holder, ttl, now)
            .map_err(Error::Ledger)?
        {
            tracing::debug!("Recovery sweep lease held elsewhere, skipping");
            return Ok(SweepReport::default());
        }

        let result = self.resolve_stale(now).await;
        storage
            .release_lease(SWEEP_LEASE, &self.holder)
            .map_err(Error::Ledger)?;

        let mut report = result?;

        // Housekeeping: drop terminal rows past their retention
        let purge_cutoff =
            now - chrono::Duration::hours(self.config().purge_resolved_after_hours as i64);
        report.purged = storage
            .purge_resolved_reservations(purge_cutoff)
            .map_err(Error::Ledger)?;

        if report.examined > 0 || report.purged > 0 {
            tracing::info!(
                examined = report.examined,
                confirmed = report.confirmed,
                refunded = report.refunded,
                errors = report.errors,
                purged = report.purged,
                "Recovery sweep completed"
            );
        }

        Ok(report)
    }

    async fn resolve_stale(&self, now: chrono::DateTime<Utc>) -> Result<SweepReport> {
        let cutoff = now - self.config().stale_after();
        let stale = self
            .coordinator
            .processor()
            .storage()
            .list_stale_debited(cutoff)
            .map_err(Error::Ledger)?;

        let mut report = SweepReport {
            examined: stale.len(),
            ..SweepReport::default()
        };

        for reservation in stale {
            let outcome = self.probe.probe(&reservation).await;
            let resolution = match outcome {
                ProbeOutcome::Succeeded => self
                    .coordinator
                    .confirm(reservation.reservation_id)
                    .await
                    .map(|_| true),
                ProbeOutcome::Failed | ProbeOutcome::Unknown => self
                    .coordinator
                    .refund(reservation.reservation_id)
                    .await
                    .map(|_| false),
            };

            match resolution {
                Ok(true) => report.confirmed += 1,
                Ok(false) => report.refunded += 1,
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(
                        reservation_id = %reservation.reservation_id,
                        account_id = %reservation.account_id,
                        outcome = ?outcome,
                        error = %e,
                        "Failed to resolve stale reservation"
                    );
                }
            }
        }

        Ok(report)
    }

    /// Spawn the periodic sweep loop
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let interval = tokio::time::Duration::from_secs(self.config().sweep_interval_secs);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    tracing::error!("Recovery sweep failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_core::{
        types::{AccountId, ReservationStatus},
        Config, Storage, TransactionProcessor,
    };
    use tempfile::TempDir;

    /// Probe with a fixed answer
    struct FixedProbe(ProbeOutcome);

    #[async_trait]
    impl OutcomeProbe for FixedProbe {
        async fn probe(&self, _reservation: &Reservation) -> ProbeOutcome {
            self.0
        }
    }

    async fn test_setup(
        probe: ProbeOutcome,
    ) -> (Arc<RecoverySweep>, Arc<ReservationCoordinator>, Arc<TransactionProcessor>, TempDir)
    {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());
        let processor = Arc::new(TransactionProcessor::new(storage, &config));
        let coordinator = Arc::new(ReservationCoordinator::new(
            processor.clone(),
            CoordinatorConfig::aggressive(),
        ));
        let sweep = Arc::new(RecoverySweep::new(
            coordinator.clone(),
            Arc::new(FixedProbe(probe)),
        ));
        (sweep, coordinator, processor, temp_dir)
    }

    /// Age a reservation past the staleness threshold
    fn backdate(
        processor: &TransactionProcessor,
        reservation: &Reservation,
        minutes: i64,
    ) {
        let mut aged = reservation.clone();
        aged.created_at = aged.created_at - chrono::Duration::minutes(minutes);
        processor.storage().put_reservation(&aged).unwrap();
    }

    #[tokio::test]
    async fn test_stale_unknown_defaults_to_refund() {
        let (sweep, coordinator, processor, _temp) = test_setup(ProbeOutcome::Unknown).await;
        let id = AccountId::new("user-1");
        processor.open_account(&id, 10).await.unwrap();

        let reservation = coordinator.reserve(&id, 6, None).await.unwrap();
        backdate(&processor, &reservation, 10);

        let report = sweep.run_once().await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.refunded, 1);
        assert_eq!(report.errors, 0);

        assert_eq!(processor.balance(&id).unwrap(), 10);
        let resolved = coordinator.get(reservation.reservation_id).unwrap();
        assert_eq!(resolved.status, ReservationStatus::Refunded);
        assert!(processor.verify_conservation(&id).unwrap());
    }

    #[tokio::test]
    async fn test_stale_discovered_success_confirms() {
        let (sweep, coordinator, processor, _temp) = test_setup(ProbeOutcome::Succeeded).await;
        let id = AccountId::new("user-1");
        processor.open_account(&id, 10).await.unwrap();

        let reservation = coordinator.reserve(&id, 6, None).await.unwrap();
        backdate(&processor, &reservation, 10);

        let report = sweep.run_once().await.unwrap();
        assert_eq!(report.confirmed, 1);

        // The charge stands; no refund issued
        assert_eq!(processor.balance(&id).unwrap(), 4);
        let resolved = coordinator.get(reservation.reservation_id).unwrap();
        assert_eq!(resolved.status, ReservationStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_fresh_reservations_left_alone() {
        let (sweep, coordinator, processor, _temp) = test_setup(ProbeOutcome::Unknown).await;
        let id = AccountId::new("user-1");
        processor.open_account(&id, 10).await.unwrap();

        let reservation = coordinator.reserve(&id, 6, None).await.unwrap();

        let report = sweep.run_once().await.unwrap();
        assert_eq!(report.examined, 0);

        let untouched = coordinator.get(reservation.reservation_id).unwrap();
        assert_eq!(untouched.status, ReservationStatus::Debited);
        assert_eq!(processor.balance(&id).unwrap(), 4);
    }

    #[tokio::test]
    async fn test_sweep_skips_when_lease_held() {
        let (sweep, coordinator, processor, _temp) = test_setup(ProbeOutcome::Unknown).await;
        let id = AccountId::new("user-1");
        processor.open_account(&id, 10).await.unwrap();

        let reservation = coordinator.reserve(&id, 6, None).await.unwrap();
        backdate(&processor, &reservation, 10);

        // Another instance holds the lease
        processor
            .storage()
            .try_acquire_lease(
                SWEEP_LEASE,
                "other-node",
                chrono::Duration::seconds(60),
                Utc::now(),
            )
            .unwrap();

        let report = sweep.run_once().await.unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(
            coordinator.get(reservation.reservation_id).unwrap().status,
            ReservationStatus::Debited
        );

        // Lease released: the sweep resolves it
        processor
            .storage()
            .release_lease(SWEEP_LEASE, "other-node")
            .unwrap();
        let report = sweep.run_once().await.unwrap();
        assert_eq!(report.refunded, 1);
    }

    #[tokio::test]
    async fn test_sweep_purges_old_terminal_rows() {
        let (sweep, coordinator, processor, _temp) = test_setup(ProbeOutcome::Unknown).await;
        let id = AccountId::new("user-1");
        processor.open_account(&id, 10).await.unwrap();

        let reservation = coordinator.reserve(&id, 6, None).await.unwrap();
        let mut resolved = coordinator.refund(reservation.reservation_id).await.unwrap();

        // Age the resolution past the retention window
        resolved.resolved_at = Some(Utc::now() - chrono::Duration::hours(2));
        processor.storage().put_reservation(&resolved).unwrap();

        let report = sweep.run_once().await.unwrap();
        assert_eq!(report.purged, 1);
        assert!(matches!(
            coordinator.get(reservation.reservation_id),
            Err(Error::ReservationNotFound(_))
        ));
    }
}
