//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//!
//! # Metrics
//!
//! - `ledger_credits_total` - Credits applied
//! - `ledger_debits_total` - Debits applied
//! - `ledger_transfers_total` - Transfers applied
//! - `ledger_insufficient_funds_total` - Debits rejected for insufficient balance
//! - `ledger_duplicate_reference_total` - Requests served from the idempotency path
//! - `ledger_lock_wait_seconds` - Histogram of account lock wait times

use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
///
/// Built on an owned registry so independent processors (and tests) never
/// collide on metric registration.
#[derive(Clone)]
pub struct Metrics {
    /// Credits applied
    pub credits_total: IntCounter,

    /// Debits applied
    pub debits_total: IntCounter,

    /// Transfers applied
    pub transfers_total: IntCounter,

    /// Debits rejected for insufficient balance
    pub insufficient_funds_total: IntCounter,

    /// Requests resolved through the idempotency path
    pub duplicate_reference_total: IntCounter,

    /// Account lock wait times
    pub lock_wait_seconds: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let credits_total = IntCounter::with_opts(Opts::new(
            "ledger_credits_total",
            "Credits applied",
        ))?;
        registry.register(Box::new(credits_total.clone()))?;

        let debits_total = IntCounter::with_opts(Opts::new(
            "ledger_debits_total",
            "Debits applied",
        ))?;
        registry.register(Box::new(debits_total.clone()))?;

        let transfers_total = IntCounter::with_opts(Opts::new(
            "ledger_transfers_total",
            "Transfers applied",
        ))?;
        registry.register(Box::new(transfers_total.clone()))?;

        let insufficient_funds_total = IntCounter::with_opts(Opts::new(
            "ledger_insufficient_funds_total",
            "Debits rejected for insufficient balance",
        ))?;
        registry.register(Box::new(insufficient_funds_total.clone()))?;

        let duplicate_reference_total = IntCounter::with_opts(Opts::new(
            "ledger_duplicate_reference_total",
            "Requests served from the idempotency path",
        ))?;
        registry.register(Box::new(duplicate_reference_total.clone()))?;

        let lock_wait_seconds = Histogram::with_opts(
            HistogramOpts::new("ledger_lock_wait_seconds", "Account lock wait times").buckets(
                vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 5.0],
            ),
        )?;
        registry.register(Box::new(lock_wait_seconds.clone()))?;

        Ok(Self {
            credits_total,
            debits_total,
            transfers_total,
            insufficient_funds_total,
            duplicate_reference_total,
            lock_wait_seconds,
            registry,
        })
    }

    /// Record an applied credit
    pub fn record_credit(&self) {
        self.credits_total.inc();
    }

    /// Record an applied debit
    pub fn record_debit(&self) {
        self.debits_total.inc();
    }

    /// Record an applied transfer
    pub fn record_transfer(&self) {
        self.transfers_total.inc();
    }

    /// Record a debit rejected for insufficient balance
    pub fn record_insufficient_funds(&self) {
        self.insufficient_funds_total.inc();
    }

    /// Record a request resolved through the idempotency path
    pub fn record_duplicate_reference(&self) {
        self.duplicate_reference_total.inc();
    }

    /// Record how long a caller waited for an account lock
    pub fn record_lock_wait(&self, seconds: f64) {
        self.lock_wait_seconds.observe(seconds);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("metrics registration on a fresh registry cannot collide")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.credits_total.get(), 0);
        assert_eq!(metrics.debits_total.get(), 0);
    }

    #[test]
    fn test_independent_registries() {
        // Two collectors must not collide
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_credit();
        assert_eq!(a.credits_total.get(), 1);
        assert_eq!(b.credits_total.get(), 0);
    }

    #[test]
    fn test_record_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.record_credit();
        metrics.record_debit();
        metrics.record_debit();
        metrics.record_insufficient_funds();
        metrics.record_duplicate_reference();
        metrics.record_transfer();

        assert_eq!(metrics.credits_total.get(), 1);
        assert_eq!(metrics.debits_total.get(), 2);
        assert_eq!(metrics.insufficient_funds_total.get(), 1);
        assert_eq!(metrics.duplicate_reference_total.get(), 1);
        assert_eq!(metrics.transfers_total.get(), 1);
    }

    #[test]
    fn test_lock_wait_histogram() {
        let metrics = Metrics::new().unwrap();
        metrics.record_lock_wait(0.002);
        metrics.record_lock_wait(0.075);
        assert_eq!(metrics.lock_wait_seconds.get_sample_count(), 2);
    }
}
