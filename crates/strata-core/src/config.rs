// CONFIGURATION
// Tunables for index builds, resharding coordination and storage
//
// Sources, lowest precedence first:
// 1. Built-in defaults
// 2. Optional configuration file (toml/yaml/json, by extension)
// 3. STRATA__<SECTION>__<KEY> environment variables

use serde::{Serialize, Deserialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use log::info;

use crate::error::{Result, StrataError};

/// Index build tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexBuildConfig {
    /// Side writes applied per drain batch (`maxIndexBuildDrainBatchSize`).
    /// Smaller values checkpoint more often and allow finer-grained interruption.
    pub max_drain_batch_size: usize,

    /// Buffered index entries that trigger a sorted-run spill
    pub spill_threshold_entries: usize,

    /// Documents read per collection scan step
    pub scan_batch_size: usize,

    /// Checkpoints kept per build
    pub max_retained_checkpoints: usize,
}

impl Default for IndexBuildConfig {
    fn default() -> Self {
        IndexBuildConfig {
            max_drain_batch_size: 1_000_000,
            spill_threshold_entries: 10_000,
            scan_batch_size: 1_000,
            max_retained_checkpoints: 16,
        }
    }
}

/// Exponential backoff for coordinator-to-participant delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,

    /// `None` retries indefinitely
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial_backoff_ms: 10,
            max_backoff_ms: 2_000,
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(63) as i32);
        let millis = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(millis as u64)
    }

    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}

/// Resharding coordination tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReshardingConfig {
    /// How long to wait for participant reports before reporting them unreachable
    pub report_timeout_ms: u64,

    /// Recipient catch-up polling interval
    pub catchup_interval_ms: u64,

    /// Donor oplog entries read per fetch
    pub oplog_batch_size: usize,

    pub retry: RetryPolicy,
}

impl Default for ReshardingConfig {
    fn default() -> Self {
        ReshardingConfig {
            report_timeout_ms: 30_000,
            catchup_interval_ms: 50,
            oplog_batch_size: 500,
            retry: RetryPolicy::default(),
        }
    }
}

impl ReshardingConfig {
    pub fn report_timeout(&self) -> Duration {
        Duration::from_millis(self.report_timeout_ms)
    }

    pub fn catchup_interval(&self) -> Duration {
        Duration::from_millis(self.catchup_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `None` keeps checkpoints in memory only
    pub data_dir: Option<PathBuf>,
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    pub index_build: IndexBuildConfig,
    pub resharding: ReshardingConfig,
    pub storage: StorageConfig,
}

impl StrataConfig {
    /// Load defaults, then the optional file, then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("STRATA")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: StrataConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        info!(
            "Loaded configuration: max_drain_batch_size={}, report_timeout_ms={}",
            loaded.index_build.max_drain_batch_size, loaded.resharding.report_timeout_ms
        );
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<()> {
        if self.index_build.max_drain_batch_size == 0 {
            return Err(StrataError::Config("max_drain_batch_size must be > 0".to_string()));
        }
        if self.index_build.max_retained_checkpoints == 0 {
            return Err(StrataError::Config("max_retained_checkpoints must be > 0".to_string()));
        }
        if self.index_build.scan_batch_size == 0 || self.index_build.spill_threshold_entries == 0 {
            return Err(StrataError::Config("scan and spill sizes must be > 0".to_string()));
        }
        if self.resharding.retry.multiplier < 1.0 {
            return Err(StrataError::Config("retry multiplier must be >= 1.0".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StrataConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.index_build.max_drain_batch_size, 1_000_000);
        assert!(config.storage.data_dir.is_none());
    }

    #[test]
    fn test_zero_drain_batch_rejected() {
        let mut config = StrataConfig::default();
        config.index_build.max_drain_batch_size = 0;
        assert!(matches!(config.validate(), Err(StrataError::Config(_))));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
            multiplier: 2.0,
            max_attempts: Some(3),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(40));
        assert_eq!(policy.delay_for(10), Duration::from_millis(100));
        assert!(policy.allows_attempt(2));
        assert!(!policy.allows_attempt(3));
        assert!(RetryPolicy::default().allows_attempt(u32::MAX - 1));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = std::env::temp_dir().join(format!("strata-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("strata.toml");
        std::fs::write(&path, "[index_build]\nmax_drain_batch_size = 1\n").unwrap();

        let config = StrataConfig::load(Some(&path)).unwrap();
        assert_eq!(config.index_build.max_drain_batch_size, 1);
        assert_eq!(config.index_build.scan_batch_size, 1_000);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
