use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use xapi_pipeline_store_sqlite::DEFAULT_STREAM;

pub const DEFAULT_DB_PATH: &str = "./xapi_pipeline.sqlite3";
pub const DEFAULT_GROUP: &str = "normalizer";
pub const MAX_RECOVERY_LOOKBACK_SECS: u64 = 366 * 24 * 60 * 60;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Runtime settings shared by every worker in the process.
///
/// Loaded from an optional JSON file; missing keys take their defaults and
/// command-line flags override both.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub db_path: PathBuf,
    /// Event log database. Shares the store file when unset.
    pub log_path: Option<PathBuf>,
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub consumers: usize,
    pub batch_size: usize,
    pub block_ms: u64,
    pub redelivery_idle_ms: u64,
    pub max_deliveries: u32,
    pub pool_size: usize,
    pub pool_timeout_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub recovery_interval_secs: u64,
    pub recovery_lookback_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            log_path: None,
            stream: DEFAULT_STREAM.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: format!("consumer-{}", Ulid::new()),
            consumers: 1,
            batch_size: 100,
            block_ms: 2000,
            redelivery_idle_ms: 30_000,
            max_deliveries: 5,
            pool_size: 4,
            pool_timeout_ms: 5000,
            backoff_initial_ms: 250,
            backoff_max_ms: 30_000,
            recovery_interval_secs: 3 * 60 * 60,
            recovery_lookback_secs: 6 * 60 * 60,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Defaults, or the file's contents when a path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_json_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| Err(ConfigError::Invalid(message.to_string()));

        if self.db_path.as_os_str().is_empty() {
            return invalid("db_path must not be empty");
        }
        if self.stream.trim().is_empty() {
            return invalid("stream must not be empty");
        }
        if self.group.trim().is_empty() {
            return invalid("group must not be empty");
        }
        if self.consumer.trim().is_empty() {
            return invalid("consumer must not be empty");
        }
        if self.consumers == 0 {
            return invalid("consumers must be at least 1");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1");
        }
        if self.pool_size == 0 {
            return invalid("pool_size must be at least 1");
        }
        if self.max_deliveries == 0 {
            return invalid("max_deliveries must be at least 1");
        }
        if self.backoff_initial_ms == 0 {
            return invalid("backoff_initial_ms must be greater than zero");
        }
        if self.backoff_initial_ms > self.backoff_max_ms {
            return invalid("backoff_initial_ms must not exceed backoff_max_ms");
        }
        if self.recovery_interval_secs == 0 {
            return invalid("recovery_interval_secs must be greater than zero");
        }
        if self.recovery_lookback_secs > MAX_RECOVERY_LOOKBACK_SECS {
            return invalid("recovery_lookback_secs must not exceed 366 days");
        }
        Ok(())
    }

    #[must_use]
    pub fn log_path(&self) -> &Path {
        self.log_path.as_deref().unwrap_or(&self.db_path)
    }

    #[must_use]
    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    #[must_use]
    pub fn redelivery_idle(&self) -> Duration {
        Duration::from_millis(self.redelivery_idle_ms)
    }

    #[must_use]
    pub fn pool_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_timeout_ms)
    }

    #[must_use]
    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    #[must_use]
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    #[must_use]
    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }

    #[must_use]
    pub fn recovery_lookback(&self) -> Duration {
        Duration::from_secs(self.recovery_lookback_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.recovery_interval(), Duration::from_secs(10_800));
        assert_eq!(config.recovery_lookback(), Duration::from_secs(21_600));
        assert!(config.consumer.starts_with("consumer-"));
        assert_eq!(config.log_path(), config.db_path.as_path());
    }

    #[test]
    fn partial_json_keeps_remaining_defaults() {
        let path = std::env::temp_dir().join(format!("xapi-config-{}.json", Ulid::new()));
        must(
            std::fs::write(&path, r#"{"group": "backfill", "batch_size": 25, "log_path": "/tmp/log.sqlite3"}"#)
                .map_err(anyhow::Error::from),
        );

        let config = must(PipelineConfig::load(Some(&path)));
        assert_eq!(config.group, "backfill");
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.block_ms, 2000);
        assert_eq!(config.log_path(), Path::new("/tmp/log.sqlite3"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn one_year_lookback_is_accepted() {
        let config = PipelineConfig {
            recovery_lookback_secs: MAX_RECOVERY_LOOKBACK_SECS,
            ..PipelineConfig::default()
        };
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let parsed = serde_json::from_str::<PipelineConfig>(r#"{"batchsize": 10}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn invalid_values_are_configuration_errors() {
        let cases: Vec<(PipelineConfig, &str)> = vec![
            (PipelineConfig { batch_size: 0, ..PipelineConfig::default() }, "batch_size"),
            (PipelineConfig { pool_size: 0, ..PipelineConfig::default() }, "pool_size"),
            (PipelineConfig { group: " ".to_string(), ..PipelineConfig::default() }, "group"),
            (
                PipelineConfig {
                    backoff_initial_ms: 10_000,
                    backoff_max_ms: 100,
                    ..PipelineConfig::default()
                },
                "backoff_initial_ms",
            ),
            (
                PipelineConfig {
                    recovery_lookback_secs: 400_000_000_000,
                    ..PipelineConfig::default()
                },
                "recovery_lookback_secs",
            ),
        ];

        for (config, field) in cases {
            match config.validate() {
                Err(ConfigError::Invalid(message)) => assert!(message.contains(field), "{message}"),
                Ok(()) => panic!("expected {field} to be rejected"),
            }
        }
    }
}
