use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use ulid::Ulid;
use xapi_pipeline_core::{now_utc, unix_millis};
use xapi_pipeline_store_sqlite::{
    EventLog, LogEntry, PendingSummary, SqliteEventLog, SqliteStatementStore, DEFAULT_STREAM,
};
use xapi_pipeline_worker::{ConsumerSettings, RecoveryScanner, ShutdownSignal, StreamConsumer};

const HOUR_MS: i64 = 60 * 60 * 1000;

fn must<T>(result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err:#}"),
    }
}

fn temp_db() -> PathBuf {
    std::env::temp_dir().join(format!("xapi-recovery-{}.sqlite3", Ulid::new()))
}

fn fixture(db: &Path) -> (Arc<SqliteStatementStore>, Arc<SqliteEventLog>) {
    let store = must(SqliteStatementStore::open(db));
    must(store.migrate());
    let log = must(SqliteEventLog::open(db, DEFAULT_STREAM)).with_redelivery_idle(Duration::ZERO);
    (Arc::new(store), Arc::new(log))
}

fn scanner(store: &Arc<SqliteStatementStore>, log: Arc<dyn EventLog>, page_size: usize) -> RecoveryScanner {
    RecoveryScanner::with_settings(
        Arc::clone(store),
        log,
        Duration::from_secs(6 * 60 * 60),
        Duration::from_millis(5),
        page_size,
    )
}

fn statement(id: &str, account: &str) -> Value {
    json!({
        "id": id,
        "actor": {"account": {"homePage": "https://lms.example.com", "name": account}},
        "verb": {"id": "http://adlnet.gov/expapi/verbs/experienced"},
        "object": {
            "id": "https://lms.example.com/video/42",
            "definition": {"name": {"en-GB": "Intro video"}}
        }
    })
}

fn publish_ago(log: &SqliteEventLog, id: &str, account: &str, ago_ms: i64) -> LogEntry {
    let published_at = unix_millis(now_utc()) - ago_ms;
    must(log.append_at(&statement(id, account).to_string(), published_at))
}

fn actor_snapshot(store: &SqliteStatementStore, actor_id: &str) -> Value {
    match must(store.get_actor(actor_id)) {
        Some(actor) => match serde_json::to_value(actor) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        },
        None => Value::Null,
    }
}

#[test]
fn scan_fills_facts_for_unacknowledged_events() {
    let db = temp_db();
    let (store, log) = fixture(&db);
    for n in 0..5 {
        publish_ago(&log, &format!("s-{n}"), "learner", HOUR_MS);
    }

    let report = must(scanner(&store, log.clone(), 100).scan_window(now_utc()));
    assert_eq!(report.scanned, 5);
    assert_eq!(report.newly_inserted_facts, 5);
    assert_eq!(report.failed, 0);
    assert_eq!(must(store.counts()).facts, 5);

    // Range reads leave group state untouched.
    let summary = must(log.pending("normalizer"));
    assert_eq!(summary.pending, 0);
    assert_eq!(summary.last_delivered_id, 0);
}

#[test]
fn events_outside_the_window_are_not_scanned() {
    let db = temp_db();
    let (store, log) = fixture(&db);
    publish_ago(&log, "s-old", "learner", 10 * HOUR_MS);
    publish_ago(&log, "s-new", "learner", HOUR_MS);

    let report = must(scanner(&store, log.clone(), 100).scan_window(now_utc()));
    assert_eq!(report.scanned, 1);
    assert!(must(store.get_fact("s-new")).is_some());
    assert!(must(store.get_fact("s-old")).is_none());
}

#[test]
fn scan_after_consumer_changes_nothing() {
    let db = temp_db();
    let (store, log) = fixture(&db);
    for n in 0..4 {
        publish_ago(&log, &format!("s-{n}"), "learner", 30 * 60 * 1000);
    }

    let mut consumer = StreamConsumer::with_settings(
        store.clone(),
        log.clone(),
        ConsumerSettings {
            group: "normalizer".to_string(),
            consumer: "c1".to_string(),
            batch_size: 10,
            block: Duration::ZERO,
            max_deliveries: 5,
            backoff_initial: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
        },
    );
    must(consumer.run_cycle());
    let counts_before = must(store.counts());
    let actor_before = actor_snapshot(&store, "learner");
    let fact_before = must(store.get_fact("s-2"));

    let report = must(scanner(&store, log.clone(), 3).scan_window(now_utc()));
    assert_eq!(report.scanned, 4);
    assert_eq!(report.persisted, 4);
    assert_eq!(report.newly_inserted_facts, 0);
    assert_eq!(report.pages, 2);

    assert_eq!(must(store.counts()), counts_before);
    assert_eq!(actor_snapshot(&store, "learner"), actor_before);
    assert_eq!(must(store.get_fact("s-2")), fact_before);
}

#[test]
fn consumer_after_scan_only_sees_duplicates() {
    let db = temp_db();
    let (store, log) = fixture(&db);
    for n in 0..3 {
        publish_ago(&log, &format!("s-{n}"), "learner", 1000);
    }
    must(scanner(&store, log.clone(), 100).scan_window(now_utc()));
    let counts_before = must(store.counts());

    let mut consumer = StreamConsumer::with_settings(
        store.clone(),
        log.clone(),
        ConsumerSettings {
            group: "normalizer".to_string(),
            consumer: "c1".to_string(),
            batch_size: 10,
            block: Duration::ZERO,
            max_deliveries: 5,
            backoff_initial: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
        },
    );
    let report = must(consumer.run_cycle());
    assert_eq!(report.duplicates, 3);
    assert_eq!(report.acknowledged, 3);
    assert_eq!(must(store.counts()), counts_before);
}

#[test]
fn lookback_past_the_earliest_timestamp_is_an_error() {
    let db = temp_db();
    let (store, log) = fixture(&db);
    publish_ago(&log, "s-1", "learner", 1000);

    let recovery = scanner(&store, log.clone(), 100).with_lookback(Duration::from_secs(400_000_000_000));
    assert!(recovery.scan_window(now_utc()).is_err());
    assert_eq!(must(store.counts()).facts, 0);
}

#[test]
fn paging_covers_every_entry_once() {
    let db = temp_db();
    let (store, log) = fixture(&db);
    for n in 0..7 {
        publish_ago(&log, &format!("s-{n}"), &format!("learner-{n}"), 1000);
    }

    let report = must(scanner(&store, log.clone(), 2).scan_window(now_utc()));
    assert_eq!(report.pages, 4);
    assert_eq!(report.scanned, 7);
    assert_eq!(report.newly_inserted_facts, 7);
}

#[test]
fn malformed_events_are_counted_and_skipped() {
    let db = temp_db();
    let (store, log) = fixture(&db);
    publish_ago(&log, "s-ok", "learner", 1000);
    must(log.append_at("{\"id\": 17}", unix_millis(now_utc()) - 1000));

    let report = must(scanner(&store, log.clone(), 100).scan_window(now_utc()));
    assert_eq!(report.scanned, 2);
    assert_eq!(report.persisted, 1);
    assert_eq!(report.failed, 1);
}

/// Fails the first `failures` range reads, then delegates.
struct UnavailableLog {
    inner: Arc<SqliteEventLog>,
    failures: AtomicUsize,
}

impl EventLog for UnavailableLog {
    fn stream(&self) -> &str {
        self.inner.stream()
    }

    fn append(&self, payload: &str) -> Result<LogEntry> {
        self.inner.append(payload)
    }

    fn ensure_group(&self, group: &str) -> Result<()> {
        self.inner.ensure_group(group)
    }

    fn read_group(&self, group: &str, consumer: &str, count: usize, block: Duration) -> Result<Vec<LogEntry>> {
        self.inner.read_group(group, consumer, count, block)
    }

    fn ack(&self, group: &str, ids: &[i64]) -> Result<usize> {
        self.inner.ack(group, ids)
    }

    fn read_range(&self, from_ms: i64, to_ms: i64, after: Option<i64>, limit: usize) -> Result<Vec<LogEntry>> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("event log unavailable"));
        }
        self.inner.read_range(from_ms, to_ms, after, limit)
    }

    fn pending(&self, group: &str) -> Result<PendingSummary> {
        self.inner.pending(group)
    }
}

#[test]
fn failed_scan_is_retried_on_the_next_tick() {
    let db = temp_db();
    let (store, log) = fixture(&db);
    publish_ago(&log, "s-1", "learner", 1000);

    let unavailable = Arc::new(UnavailableLog {
        inner: log.clone(),
        failures: AtomicUsize::new(1),
    });
    let recovery = scanner(&store, unavailable, 100);
    assert!(recovery.scan_window(now_utc()).is_err());
    assert_eq!(must(store.counts()).facts, 0);

    let shutdown = ShutdownSignal::new();
    let stopper = shutdown.clone();
    let watcher_store = store.clone();
    let watcher = std::thread::spawn(move || {
        for _ in 0..200 {
            if matches!(watcher_store.counts(), Ok(counts) if counts.facts == 1) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        stopper.trigger();
    });

    let runs = recovery.run(&shutdown);
    if watcher.join().is_err() {
        panic!("test failure: watcher panicked");
    }
    assert!(runs >= 1);
    assert_eq!(must(store.counts()).facts, 1);
}

#[test]
fn scanner_loop_survives_repeated_failures() {
    let db = temp_db();
    let (store, log) = fixture(&db);
    publish_ago(&log, "s-1", "learner", 1000);

    let unavailable = Arc::new(UnavailableLog {
        inner: log.clone(),
        failures: AtomicUsize::new(3),
    });
    let recovery = scanner(&store, unavailable, 100);

    let shutdown = ShutdownSignal::new();
    let stopper = shutdown.clone();
    let watcher_store = store.clone();
    let watcher = std::thread::spawn(move || {
        for _ in 0..200 {
            if matches!(watcher_store.counts(), Ok(counts) if counts.facts == 1) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        stopper.trigger();
    });

    let runs = recovery.run(&shutdown);
    if watcher.join().is_err() {
        panic!("test failure: watcher panicked");
    }
    assert!(runs >= 4);
    assert_eq!(must(store.counts()).facts, 1);
}
