//! Shared raw-write then normalize path used by both the stream consumer and
//! the recovery scanner.

use anyhow::{Context, Result};
use xapi_pipeline_core::{
    from_unix_millis, normalize, parse_payload, statement_id_of, NormalizationError, RawEvent,
    Statement,
};
use xapi_pipeline_store_sqlite::{BatchItem, ItemWrite, LogEntry, SqliteStatementStore};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ItemFailure {
    #[error("normalization failed: {0}")]
    Normalization(#[from] NormalizationError),
    #[error("persist failed: {0}")]
    Persist(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Persisted { fact_inserted: bool },
    Failed(ItemFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedEntry {
    pub entry_id: i64,
    pub delivery_count: u32,
    pub statement_id: Option<String>,
    pub outcome: ItemOutcome,
}

impl ProcessedEntry {
    #[must_use]
    pub fn is_persisted(&self) -> bool {
        matches!(self.outcome, ItemOutcome::Persisted { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// One entry per input, in input order.
    pub entries: Vec<ProcessedEntry>,
    pub fell_back: bool,
}

impl BatchReport {
    #[must_use]
    pub fn persisted(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_persisted()).count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.entries.len() - self.persisted()
    }

    #[must_use]
    pub fn newly_inserted(&self) -> usize {
        self.count_persisted(true)
    }

    #[must_use]
    pub fn duplicates(&self) -> usize {
        self.count_persisted(false)
    }

    fn count_persisted(&self, inserted: bool) -> usize {
        self.entries
            .iter()
            .filter(|entry| {
                matches!(entry.outcome, ItemOutcome::Persisted { fact_inserted } if fact_inserted == inserted)
            })
            .count()
    }
}

enum Prepared {
    Write {
        item: BatchItem,
        failure: Option<NormalizationError>,
    },
    Rejected(NormalizationError),
}

/// Writes the raw copy and normalized entities for `entries` in one batch.
///
/// Entries that cannot be keyed by a statement id are rejected without any
/// write. Entries that are keyed but fail normalization still get their raw
/// copy. The receive time of every statement is its log publish time, so
/// reprocessing the same entry always yields the same rows.
///
/// Returns an error only for store-level failures that affect the whole batch.
pub fn process_entries(store: &SqliteStatementStore, entries: &[LogEntry]) -> Result<BatchReport> {
    let prepared: Vec<Prepared> = entries.iter().map(prepare).collect();

    let items: Vec<BatchItem> = prepared
        .iter()
        .filter_map(|prepared| match prepared {
            Prepared::Write { item, .. } => Some(item.clone()),
            Prepared::Rejected(_) => None,
        })
        .collect();

    let write = store
        .persist_batch(&items)
        .context("failed to persist statement batch")?;
    if write.fell_back {
        tracing::debug!(items = items.len(), "batch persisted item by item");
    }

    let mut writes = write.outcomes.into_iter();
    let mut report = BatchReport {
        entries: Vec::with_capacity(entries.len()),
        fell_back: write.fell_back,
    };

    for (entry, prepared) in entries.iter().zip(prepared) {
        let (statement_id, outcome) = match prepared {
            Prepared::Rejected(err) => (None, ItemOutcome::Failed(ItemFailure::Normalization(err))),
            Prepared::Write { item, failure } => {
                let outcome = match (writes.next(), failure) {
                    (Some(ItemWrite::Failed { error }), _) => ItemOutcome::Failed(ItemFailure::Persist(error)),
                    (_, Some(err)) => ItemOutcome::Failed(ItemFailure::Normalization(err)),
                    (Some(ItemWrite::Persisted { fact_inserted }), None) => {
                        ItemOutcome::Persisted { fact_inserted }
                    }
                    (Some(ItemWrite::RawOnly) | None, None) => ItemOutcome::Failed(ItemFailure::Persist(
                        "store reported no entity write".to_string(),
                    )),
                };
                (Some(item.raw.statement_id), outcome)
            }
        };

        if let ItemOutcome::Failed(failure) = &outcome {
            tracing::warn!(
                entry_id = entry.id,
                statement_id = statement_id.as_deref().unwrap_or("-"),
                delivery_count = entry.delivery_count,
                error = %failure,
                "statement not processed"
            );
        }

        report.entries.push(ProcessedEntry {
            entry_id: entry.id,
            delivery_count: entry.delivery_count,
            statement_id,
            outcome,
        });
    }

    Ok(report)
}

fn prepare(entry: &LogEntry) -> Prepared {
    let received_at = from_unix_millis(entry.published_at_ms);

    let value = match parse_payload(&entry.payload) {
        Ok(value) => value,
        Err(err) => return Prepared::Rejected(err),
    };
    let statement_id = match statement_id_of(&value) {
        Ok(id) => id,
        Err(err) => return Prepared::Rejected(err),
    };

    let raw = RawEvent {
        statement_id,
        payload: entry.payload.clone(),
        log_entry_id: Some(entry.id),
        received_at,
    };

    match Statement::from_value(value, received_at).and_then(|statement| normalize(&statement)) {
        Ok(normalized) => Prepared::Write {
            item: BatchItem {
                raw,
                normalized: Some(normalized),
            },
            failure: None,
        },
        Err(err) => Prepared::Write {
            item: BatchItem {
                raw,
                normalized: None,
            },
            failure: Some(err),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_store() -> SqliteStatementStore {
        let store = must(SqliteStatementStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn entry(id: i64, payload: String) -> LogEntry {
        LogEntry {
            id,
            published_at_ms: 1_800_000_000_000,
            payload,
            delivery_count: 1,
        }
    }

    fn valid(id: &str) -> String {
        json!({
            "id": id,
            "actor": {"mbox": "mailto:learner@example.com"},
            "verb": {"id": "http://adlnet.gov/expapi/verbs/attempted"},
            "object": {"id": "http://example.com/quiz/1"}
        })
        .to_string()
    }

    #[test]
    fn classifies_each_entry_in_input_order() {
        let store = fixture_store();
        let entries = vec![
            entry(1, valid("s-1")),
            entry(2, "not json".to_string()),
            entry(3, json!({"id": "s-3", "actor": {"mbox": "mailto:x@example.com"}}).to_string()),
            entry(4, valid("s-1")),
        ];

        let report = must(process_entries(&store, &entries));
        let ids: Vec<i64> = report.entries.iter().map(|e| e.entry_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);

        assert_eq!(report.entries[0].outcome, ItemOutcome::Persisted { fact_inserted: true });
        assert!(matches!(
            report.entries[1].outcome,
            ItemOutcome::Failed(ItemFailure::Normalization(NormalizationError::InvalidPayload(_)))
        ));
        assert!(matches!(
            report.entries[2].outcome,
            ItemOutcome::Failed(ItemFailure::Normalization(NormalizationError::MissingField(_)))
        ));
        assert_eq!(report.entries[3].outcome, ItemOutcome::Persisted { fact_inserted: false });

        assert_eq!(report.persisted(), 2);
        assert_eq!(report.failed(), 2);
        assert_eq!(report.newly_inserted(), 1);
        assert_eq!(report.duplicates(), 1);
    }

    #[test]
    fn keyed_statements_keep_raw_copy_when_normalization_fails() {
        let store = fixture_store();
        let broken = json!({"id": "s-broken", "actor": {"name": "No Verb"}, "object": {"id": "x"}}).to_string();
        let report = must(process_entries(&store, &[entry(7, broken.clone())]));

        assert_eq!(report.entries[0].statement_id.as_deref(), Some("s-broken"));
        let raw = must(store.get_raw_event("s-broken"));
        assert_eq!(raw.map(|raw| raw.payload), Some(broken));
        assert_eq!(must(store.counts()).facts, 0);
    }

    #[test]
    fn missing_timestamp_falls_back_to_publish_time() {
        let store = fixture_store();
        must(process_entries(&store, &[entry(1, valid("s-1"))]));
        let fact = must(store.get_fact("s-1")).unwrap_or_else(|| panic!("missing fact"));
        assert_eq!(fact.timestamp, from_unix_millis(1_800_000_000_000));
    }

    #[test]
    fn empty_input_is_an_empty_report() {
        let store = fixture_store();
        let report = must(process_entries(&store, &[]));
        assert_eq!(report, BatchReport::default());
    }
}
