use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use xapi_pipeline_store_sqlite::{EventLog, SqliteEventLog, SqliteStatementStore};

use crate::config::PipelineConfig;

/// Long-lived handles owned by the process: the store pool and the log
/// client. Built once at startup and shared by reference with every worker.
pub struct PipelineContext {
    config: PipelineConfig,
    store: Arc<SqliteStatementStore>,
    log: Arc<dyn EventLog>,
}

impl PipelineContext {
    /// Validates config, opens and migrates the store, opens the log and
    /// registers the configured group. Any failure here is fatal to startup.
    pub fn open(config: PipelineConfig) -> Result<Self> {
        config.validate()?;

        let store = SqliteStatementStore::open_with_pool(
            &config.db_path,
            config.pool_size,
            config.pool_timeout(),
        )
        .context("failed to open statement store")?;
        store.migrate().context("failed to migrate statement store")?;

        let log = SqliteEventLog::open(config.log_path(), &config.stream)
            .context("failed to open event log")?
            .with_redelivery_idle(config.redelivery_idle());

        Self::from_parts(config, Arc::new(store), Arc::new(log))
    }

    /// Opens an existing store and log for reporting. Nothing is created:
    /// the database must exist and be migrated, and no group is registered.
    pub fn inspect(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        if !config.db_path.exists() {
            return Err(anyhow!(
                "statement store {} does not exist; run `xapi-pipeline migrate` first",
                config.db_path.display()
            ));
        }

        let store = SqliteStatementStore::open_with_pool(&config.db_path, 1, config.pool_timeout())
            .context("failed to open statement store")?;
        if !store.is_migrated()? {
            return Err(anyhow!(
                "statement store {} is not migrated; run `xapi-pipeline migrate` first",
                config.db_path.display()
            ));
        }

        let log = SqliteEventLog::open(config.log_path(), &config.stream)
            .context("failed to open event log")?
            .with_redelivery_idle(config.redelivery_idle());

        Ok(Self {
            config,
            store: Arc::new(store),
            log: Arc::new(log),
        })
    }

    /// Assembles a context around already-open handles.
    pub fn from_parts(
        config: PipelineConfig,
        store: Arc<SqliteStatementStore>,
        log: Arc<dyn EventLog>,
    ) -> Result<Self> {
        config.validate()?;
        log.ensure_group(&config.group)
            .with_context(|| format!("failed to register consumer group {}", config.group))?;

        tracing::info!(
            db = %config.db_path.display(),
            log = %config.log_path().display(),
            stream = log.stream(),
            group = %config.group,
            pool_size = config.pool_size,
            "pipeline context ready"
        );

        Ok(Self { config, store, log })
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<SqliteStatementStore> {
        &self.store
    }

    #[must_use]
    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    pub fn close(self) {
        tracing::info!(group = %self.config.group, "pipeline context closed");
    }
}
