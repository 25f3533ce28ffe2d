use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use xapi_pipeline_core::{format_rfc3339, now_utc};
use xapi_pipeline_store_sqlite::{DeadLetter, EventLog, LogEntry, SqliteStatementStore};

use crate::config::PipelineConfig;
use crate::context::PipelineContext;
use crate::pipeline::{process_entries, ItemOutcome, ProcessedEntry};
use crate::scheduler::{Backoff, ShutdownSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Idle,
    Fetching,
    ProcessingBatch,
    Acknowledging,
    Error,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::ProcessingBatch => "processing_batch",
            Self::Acknowledging => "acknowledging",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub group: String,
    pub consumer: String,
    pub batch_size: usize,
    pub block: Duration,
    pub max_deliveries: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl ConsumerSettings {
    #[must_use]
    pub fn from_config(config: &PipelineConfig, consumer: impl Into<String>) -> Self {
        Self {
            group: config.group.clone(),
            consumer: consumer.into(),
            batch_size: config.batch_size,
            block: config.block(),
            max_deliveries: config.max_deliveries,
            backoff_initial: config.backoff_initial(),
            backoff_max: config.backoff_max(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub fetched: usize,
    pub persisted: usize,
    pub acknowledged: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerTotals {
    pub consumer: String,
    pub cycles: usize,
    pub failed_cycles: usize,
    pub fetched: usize,
    pub persisted: usize,
    pub acknowledged: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub duplicates: usize,
}

impl ConsumerTotals {
    fn add(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.fetched += report.fetched;
        self.persisted += report.persisted;
        self.acknowledged += report.acknowledged;
        self.failed += report.failed;
        self.dead_lettered += report.dead_lettered;
        self.duplicates += report.duplicates;
    }
}

/// Named member of a consumer group.
///
/// Each cycle fetches a batch, writes it through the shared processing path
/// and acknowledges only the entries whose writes committed. Failed entries
/// stay pending and come back on a later fetch until they exceed
/// `max_deliveries`, at which point they are dead-lettered and acknowledged.
pub struct StreamConsumer {
    store: Arc<SqliteStatementStore>,
    log: Arc<dyn EventLog>,
    settings: ConsumerSettings,
    state: ConsumerState,
    backoff: Backoff,
}

impl StreamConsumer {
    #[must_use]
    pub fn new(context: &PipelineContext, consumer: impl Into<String>) -> Self {
        Self::with_settings(
            Arc::clone(context.store()),
            Arc::clone(context.log()),
            ConsumerSettings::from_config(context.config(), consumer),
        )
    }

    #[must_use]
    pub fn with_settings(
        store: Arc<SqliteStatementStore>,
        log: Arc<dyn EventLog>,
        settings: ConsumerSettings,
    ) -> Self {
        let backoff = Backoff::new(settings.backoff_initial, settings.backoff_max);
        Self {
            store,
            log,
            settings,
            state: ConsumerState::Idle,
            backoff,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConsumerState {
        self.state
    }

    #[must_use]
    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// How long the consumer will back off after its next failed cycle.
    #[must_use]
    pub fn next_backoff(&self) -> Duration {
        self.backoff.peek()
    }

    /// One fetch, process, acknowledge pass. Store or log failures abort the
    /// cycle and leave the consumer in [`ConsumerState::Error`] with nothing
    /// acknowledged.
    pub fn run_cycle(&mut self) -> Result<CycleReport> {
        match self.cycle() {
            Ok(report) => {
                self.transition(ConsumerState::Idle);
                Ok(report)
            }
            Err(err) => {
                self.transition(ConsumerState::Error);
                Err(err)
            }
        }
    }

    /// Runs cycles until `shutdown` fires. Shutdown is only observed between
    /// cycles, so an in-flight batch always completes.
    pub fn run(&mut self, shutdown: &ShutdownSignal) -> ConsumerTotals {
        let mut totals = ConsumerTotals {
            consumer: self.settings.consumer.clone(),
            ..ConsumerTotals::default()
        };
        tracing::info!(
            group = %self.settings.group,
            consumer = %self.settings.consumer,
            batch_size = self.settings.batch_size,
            "stream consumer started"
        );

        while !shutdown.is_triggered() {
            match self.run_cycle() {
                Ok(report) => {
                    self.backoff.reset();
                    totals.add(&report);
                }
                Err(err) => {
                    totals.failed_cycles += 1;
                    let delay = self.backoff.next_delay();
                    tracing::error!(
                        group = %self.settings.group,
                        consumer = %self.settings.consumer,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %format!("{err:#}"),
                        "consumer cycle failed; backing off"
                    );
                    if shutdown.wait_timeout(delay) {
                        break;
                    }
                    self.transition(ConsumerState::Idle);
                }
            }
        }

        tracing::info!(
            group = %self.settings.group,
            consumer = %self.settings.consumer,
            cycles = totals.cycles,
            acknowledged = totals.acknowledged,
            "stream consumer stopped"
        );
        totals
    }

    fn cycle(&mut self) -> Result<CycleReport> {
        self.transition(ConsumerState::Fetching);
        let entries = self
            .log
            .read_group(
                &self.settings.group,
                &self.settings.consumer,
                self.settings.batch_size,
                self.settings.block,
            )
            .context("failed to fetch from event log")?;
        if entries.is_empty() {
            return Ok(CycleReport::default());
        }

        self.transition(ConsumerState::ProcessingBatch);
        let batch = process_entries(&self.store, &entries)?;

        let mut report = CycleReport {
            fetched: entries.len(),
            persisted: batch.persisted(),
            failed: batch.failed(),
            duplicates: batch.duplicates(),
            ..CycleReport::default()
        };

        let mut ack_ids = Vec::with_capacity(entries.len());
        for (processed, entry) in batch.entries.iter().zip(&entries) {
            match &processed.outcome {
                ItemOutcome::Persisted { .. } => ack_ids.push(processed.entry_id),
                ItemOutcome::Failed(_) if processed.delivery_count >= self.settings.max_deliveries => {
                    self.dead_letter(processed, entry)?;
                    report.dead_lettered += 1;
                    ack_ids.push(processed.entry_id);
                }
                ItemOutcome::Failed(_) => {}
            }
        }

        self.transition(ConsumerState::Acknowledging);
        report.acknowledged = self
            .log
            .ack(&self.settings.group, &ack_ids)
            .context("failed to acknowledge processed entries")?;

        tracing::debug!(
            group = %self.settings.group,
            consumer = %self.settings.consumer,
            fetched = report.fetched,
            acknowledged = report.acknowledged,
            failed = report.failed,
            "consumer cycle complete"
        );
        Ok(report)
    }

    fn dead_letter(&self, processed: &ProcessedEntry, entry: &LogEntry) -> Result<()> {
        let error = match &processed.outcome {
            ItemOutcome::Failed(failure) => failure.to_string(),
            ItemOutcome::Persisted { .. } => String::new(),
        };
        let recorded_at = format_rfc3339(now_utc()).map_err(|err| anyhow::anyhow!(err.to_string()))?;

        self.store
            .record_dead_letter(&DeadLetter {
                group_name: self.settings.group.clone(),
                log_entry_id: entry.id,
                statement_id: processed.statement_id.clone(),
                error,
                payload: entry.payload.clone(),
                delivery_count: processed.delivery_count,
                recorded_at,
            })
            .with_context(|| format!("failed to dead-letter log entry {}", entry.id))?;

        tracing::warn!(
            group = %self.settings.group,
            entry_id = entry.id,
            statement_id = processed.statement_id.as_deref().unwrap_or("-"),
            delivery_count = processed.delivery_count,
            "entry exceeded max deliveries; dead-lettered"
        );
        Ok(())
    }

    fn transition(&mut self, next: ConsumerState) {
        if self.state != next {
            tracing::debug!(
                consumer = %self.settings.consumer,
                from = %self.state,
                to = %next,
                "consumer state change"
            );
            self.state = next;
        }
    }
}
