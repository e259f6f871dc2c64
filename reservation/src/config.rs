//! Configuration for the reservation coordinator

use serde::{Deserialize, Serialize};

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Timeout for the external operation (milliseconds)
    ///
    /// Independent of the ledger lock, which is never held across the
    /// external call.
    pub external_timeout_ms: u64,

    /// Age after which a debited reservation counts as stale (seconds)
    pub stale_after_secs: u64,

    /// Recovery sweep interval (seconds)
    pub sweep_interval_secs: u64,

    /// TTL of the sweep's single-flight lease (seconds)
    pub lease_ttl_secs: u64,

    /// Retain terminal reservations for this long before purging (hours)
    pub purge_resolved_after_hours: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            external_timeout_ms: 30_000,     // 30s
            stale_after_secs: 600,           // 10 minutes
            sweep_interval_secs: 60,
            lease_ttl_secs: 120,
            purge_resolved_after_hours: 24,
        }
    }
}

impl CoordinatorConfig {
    /// Tight timeouts for latency-sensitive deployments (and tests)
    pub fn aggressive() -> Self {
        Self {
            external_timeout_ms: 1_000,
            stale_after_secs: 30,
            sweep_interval_secs: 5,
            lease_ttl_secs: 15,
            purge_resolved_after_hours: 1,
        }
    }

    /// External operation timeout as a tokio duration
    pub fn external_timeout(&self) -> tokio::time::Duration {
        tokio::time::Duration::from_millis(self.external_timeout_ms)
    }

    /// Staleness threshold as a chrono duration
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;
        let config: CoordinatorConfig = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.external_timeout_ms, 30_000);
        assert_eq!(config.stale_after_secs, 600);
    }

    #[test]
    fn test_aggressive_is_tighter() {
        let config = CoordinatorConfig::aggressive();
        assert!(config.external_timeout_ms < CoordinatorConfig::default().external_timeout_ms);
        assert_eq!(config.stale_after().num_seconds(), 30);
    }
}
