//! Configuration for the ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Account locking configuration
    pub locking: LockingConfig,

    /// Idempotency cache configuration
    pub idempotency: IdempotencyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/ledger"),
            service_name: "ledger-core".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            rocksdb: RocksDBConfig::default(),
            locking: LockingConfig::default(),
            idempotency: IdempotencyConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Target file size (MB)
    pub target_file_size_mb: u64,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Level 0 file num compaction trigger
    pub level0_file_num_compaction_trigger: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,       // 64 MB
            max_write_buffer_number: 4,
            target_file_size_mb: 64,        // 64 MB
            max_background_jobs: 4,
            level0_file_num_compaction_trigger: 4,
            enable_statistics: false,
        }
    }
}

/// Account locking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockingConfig {
    /// Per-attempt lock acquisition timeout (milliseconds)
    pub acquire_timeout_ms: u64,

    /// Acquisition attempts before giving up
    pub retry_attempts: u32,

    /// Base delay between attempts (milliseconds, doubled per attempt)
    pub retry_base_delay_ms: u64,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 5_000,   // 5s per attempt
            retry_attempts: 3,
            retry_base_delay_ms: 50,     // 50ms, then 100ms, then 200ms
        }
    }
}

/// Idempotency cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Retention window for cached responses (hours)
    pub retention_hours: u64,

    /// Purge sweep interval (seconds)
    pub sweep_interval_secs: u64,

    /// TTL of the sweep's single-flight lease (seconds)
    pub lease_ttl_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            retention_hours: 24,
            sweep_interval_secs: 600,    // 10 minutes
            lease_ttl_secs: 300,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(hours) = std::env::var("LEDGER_IDEMPOTENCY_RETENTION_HOURS") {
            config.idempotency.retention_hours = hours
                .parse()
                .map_err(|e| crate::Error::Config(format!("Invalid retention: {}", e)))?;
        }

        if let Ok(timeout) = std::env::var("LEDGER_LOCK_TIMEOUT_MS") {
            config.locking.acquire_timeout_ms = timeout
                .parse()
                .map_err(|e| crate::Error::Config(format!("Invalid lock timeout: {}", e)))?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "ledger-core");
        assert_eq!(config.idempotency.retention_hours, 24);
        assert_eq!(config.locking.retry_attempts, 3);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            data_dir = "/tmp/ledger"
            service_name = "ledger-core"
            service_version = "0.1.0"

            [rocksdb]
            write_buffer_size_mb = 32
            max_write_buffer_number = 2
            target_file_size_mb = 32
            max_background_jobs = 2
            level0_file_num_compaction_trigger = 4
            enable_statistics = false

            [locking]
            acquire_timeout_ms = 1000
            retry_attempts = 5
            retry_base_delay_ms = 25

            [idempotency]
            retention_hours = 48
            sweep_interval_secs = 300
            lease_ttl_secs = 120
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.locking.retry_attempts, 5);
        assert_eq!(config.idempotency.retention_hours, 48);
        assert_eq!(config.rocksdb.write_buffer_size_mb, 32);
    }
}
