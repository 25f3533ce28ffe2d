#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

pub mod event_log;
pub mod pool;

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use xapi_pipeline_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, unix_millis, Activity, Actor, Fact,
    NormalizedStatement, RawEvent, Verb,
};

pub use event_log::{EventLog, LogEntry, PendingSummary, SqliteEventLog, DEFAULT_STREAM};
pub use pool::{open_pool, ConnectionPool, PooledConnection, DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_POOL_SIZE};

const STORE_MIGRATION_VERSION: i64 = 1;

// Lowest default SQLITE_MAX_VARIABLE_NUMBER across supported builds.
const MAX_BIND_PARAMS: usize = 999;

const SCHEMA_STORE_V1: &str = r"
CREATE TABLE IF NOT EXISTS raw_events (
  statement_id TEXT PRIMARY KEY,
  payload TEXT NOT NULL,
  log_entry_id INTEGER,
  received_at TEXT NOT NULL,
  ingested_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_raw_events_no_update
BEFORE UPDATE ON raw_events
BEGIN
  SELECT RAISE(FAIL, 'raw_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_raw_events_no_delete
BEFORE DELETE ON raw_events
BEGIN
  SELECT RAISE(FAIL, 'raw_events is append-only');
END;

CREATE TABLE IF NOT EXISTS actors (
  actor_id TEXT PRIMARY KEY,
  object_type TEXT NOT NULL,
  name TEXT,
  mbox TEXT,
  openid TEXT,
  account_name TEXT,
  account_homepage TEXT,
  last_seen_ms INTEGER NOT NULL,
  last_statement_id TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS activities (
  activity_id TEXT PRIMARY KEY,
  object_type TEXT NOT NULL,
  activity_type TEXT,
  name TEXT,
  name_lang TEXT,
  description TEXT,
  description_lang TEXT,
  interaction_type TEXT,
  more_info TEXT,
  correct_responses_pattern TEXT,
  choices TEXT,
  scale TEXT,
  source TEXT,
  target TEXT,
  steps TEXT,
  extensions TEXT,
  last_seen_ms INTEGER NOT NULL,
  last_statement_id TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS verbs (
  verb_id TEXT PRIMARY KEY,
  display TEXT,
  display_lang TEXT,
  last_seen_ms INTEGER NOT NULL,
  last_statement_id TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS facts (
  statement_id TEXT PRIMARY KEY,
  actor_id TEXT,
  verb_id TEXT NOT NULL,
  activity_id TEXT NOT NULL,
  result_success INTEGER CHECK (result_success IN (0, 1) OR result_success IS NULL),
  result_completion INTEGER CHECK (result_completion IN (0, 1) OR result_completion IS NULL),
  result_duration TEXT,
  result_response TEXT,
  result_score_scaled REAL,
  result_score_raw REAL,
  result_score_min REAL,
  result_score_max REAL,
  result_extensions TEXT,
  context_registration TEXT,
  context_platform TEXT,
  context_language TEXT,
  context_instructor TEXT,
  context_activities TEXT,
  context_extensions TEXT,
  statement_version TEXT,
  timestamp TEXT NOT NULL,
  timestamp_ms INTEGER NOT NULL,
  stored TEXT,
  received_at TEXT NOT NULL,
  inserted_at TEXT NOT NULL,
  FOREIGN KEY (statement_id) REFERENCES raw_events(statement_id),
  FOREIGN KEY (actor_id) REFERENCES actors(actor_id),
  FOREIGN KEY (verb_id) REFERENCES verbs(verb_id),
  FOREIGN KEY (activity_id) REFERENCES activities(activity_id)
);

CREATE TRIGGER IF NOT EXISTS trg_facts_no_update
BEFORE UPDATE ON facts
BEGIN
  SELECT RAISE(FAIL, 'facts is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_facts_no_delete
BEFORE DELETE ON facts
BEGIN
  SELECT RAISE(FAIL, 'facts is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_facts_actor_time ON facts(actor_id, timestamp_ms);
CREATE INDEX IF NOT EXISTS idx_facts_activity_time ON facts(activity_id, timestamp_ms);
CREATE INDEX IF NOT EXISTS idx_facts_verb ON facts(verb_id);
CREATE INDEX IF NOT EXISTS idx_facts_registration ON facts(context_registration);

CREATE TABLE IF NOT EXISTS dead_letters (
  group_name TEXT NOT NULL,
  log_entry_id INTEGER NOT NULL,
  statement_id TEXT,
  error TEXT NOT NULL,
  payload TEXT NOT NULL,
  delivery_count INTEGER NOT NULL,
  recorded_at TEXT NOT NULL,
  PRIMARY KEY (group_name, log_entry_id)
);
";

const ACTOR_COLUMNS: usize = 11;
const UPSERT_ACTORS_HEAD: &str = "INSERT INTO actors(
    actor_id, object_type, name, mbox, openid, account_name, account_homepage,
    last_seen_ms, last_statement_id, created_at, updated_at
  ) VALUES ";
const UPSERT_ACTORS_TAIL: &str = " ON CONFLICT(actor_id) DO UPDATE SET
    object_type = excluded.object_type,
    name = excluded.name,
    mbox = excluded.mbox,
    openid = excluded.openid,
    account_name = excluded.account_name,
    account_homepage = excluded.account_homepage,
    last_seen_ms = excluded.last_seen_ms,
    last_statement_id = excluded.last_statement_id,
    updated_at = excluded.updated_at
  WHERE (excluded.last_seen_ms, excluded.last_statement_id)
     >= (actors.last_seen_ms, actors.last_statement_id)";

const ACTIVITY_COLUMNS: usize = 20;
const UPSERT_ACTIVITIES_HEAD: &str = "INSERT INTO activities(
    activity_id, object_type, activity_type, name, name_lang, description, description_lang,
    interaction_type, more_info, correct_responses_pattern, choices, scale, source, target,
    steps, extensions, last_seen_ms, last_statement_id, created_at, updated_at
  ) VALUES ";
const UPSERT_ACTIVITIES_TAIL: &str = " ON CONFLICT(activity_id) DO UPDATE SET
    object_type = excluded.object_type,
    activity_type = excluded.activity_type,
    name = excluded.name,
    name_lang = excluded.name_lang,
    description = excluded.description,
    description_lang = excluded.description_lang,
    interaction_type = excluded.interaction_type,
    more_info = excluded.more_info,
    correct_responses_pattern = excluded.correct_responses_pattern,
    choices = excluded.choices,
    scale = excluded.scale,
    source = excluded.source,
    target = excluded.target,
    steps = excluded.steps,
    extensions = excluded.extensions,
    last_seen_ms = excluded.last_seen_ms,
    last_statement_id = excluded.last_statement_id,
    updated_at = excluded.updated_at
  WHERE (excluded.last_seen_ms, excluded.last_statement_id)
     >= (activities.last_seen_ms, activities.last_statement_id)";

const VERB_COLUMNS: usize = 7;
const UPSERT_VERBS_HEAD: &str = "INSERT INTO verbs(
    verb_id, display, display_lang, last_seen_ms, last_statement_id, created_at, updated_at
  ) VALUES ";
const UPSERT_VERBS_TAIL: &str = " ON CONFLICT(verb_id) DO UPDATE SET
    display = excluded.display,
    display_lang = excluded.display_lang,
    last_seen_ms = excluded.last_seen_ms,
    last_statement_id = excluded.last_statement_id,
    updated_at = excluded.updated_at
  WHERE (excluded.last_seen_ms, excluded.last_statement_id)
     >= (verbs.last_seen_ms, verbs.last_statement_id)";

const FACT_COLUMNS: usize = 25;
const INSERT_FACTS_HEAD: &str = "INSERT INTO facts(
    statement_id, actor_id, verb_id, activity_id, result_success, result_completion,
    result_duration, result_response, result_score_scaled, result_score_raw, result_score_min,
    result_score_max, result_extensions, context_registration, context_platform, context_language,
    context_instructor, context_activities, context_extensions, statement_version, timestamp,
    timestamp_ms, stored, received_at, inserted_at
  ) VALUES ";

const RAW_COLUMNS: usize = 5;
const INSERT_RAW_HEAD: &str =
    "INSERT OR IGNORE INTO raw_events(statement_id, payload, log_entry_id, received_at, ingested_at) VALUES ";

/// Normalized writes for one log entry. `normalized` is `None` when the
/// payload could be keyed but not normalized; only the raw copy is written.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    pub raw: RawEvent,
    pub normalized: Option<NormalizedStatement>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemWrite {
    Persisted { fact_inserted: bool },
    RawOnly,
    Failed { error: String },
}

impl ItemWrite {
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct BatchWriteReport {
    /// One outcome per input item, in input order.
    pub outcomes: Vec<ItemWrite>,
    pub fell_back: bool,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct DeadLetter {
    pub group_name: String,
    pub log_entry_id: i64,
    pub statement_id: Option<String>,
    pub error: String,
    pub payload: String,
    pub delivery_count: u32,
    pub recorded_at: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct StoreCounts {
    pub raw_events: i64,
    pub actors: i64,
    pub activities: i64,
    pub verbs: i64,
    pub facts: i64,
    pub dead_letters: i64,
}

pub struct SqliteStatementStore {
    pool: ConnectionPool,
}

impl SqliteStatementStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_pool(path, DEFAULT_POOL_SIZE, DEFAULT_ACQUIRE_TIMEOUT)
    }

    pub fn open_with_pool(path: &Path, pool_size: usize, acquire_timeout: Duration) -> Result<Self> {
        Ok(Self {
            pool: open_pool(path, pool_size, acquire_timeout)?,
        })
    }

    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn connection(&self) -> Result<PooledConnection> {
        self.pool
            .get()
            .context("failed to check out a pooled sqlite connection")
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        conn.execute_batch(SCHEMA_STORE_V1)
            .context("failed to apply statement store schema")?;

        let now = timestamp_now()?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![STORE_MIGRATION_VERSION, now],
        )
        .context("failed to register statement store migration")?;

        for table in ["raw_events", "actors", "activities", "verbs", "facts", "dead_letters"] {
            if !table_exists(&conn, table)? {
                return Err(anyhow!("statement store migration did not create table {table}"));
            }
        }

        Ok(())
    }

    /// Whether `migrate` has already run against this database.
    pub fn is_migrated(&self) -> Result<bool> {
        let conn = self.connection()?;
        if !table_exists(&conn, "schema_migrations")? {
            return Ok(false);
        }
        let applied: Option<i64> = conn
            .query_row(
                "SELECT version FROM schema_migrations WHERE version = ?1",
                params![STORE_MIGRATION_VERSION],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read schema_migrations")?;
        Ok(applied.is_some())
    }

    /// Returns whether a new raw row was written.
    pub fn write_raw(&self, raw: &RawEvent) -> Result<bool> {
        let conn = self.connection()?;
        let now = timestamp_now()?;
        let written = insert_raw_rows(&conn, &[raw], &now)?;
        Ok(written > 0)
    }

    /// No-op for actors without a stable identifier.
    pub fn upsert_actor(&self, actor: &Actor) -> Result<()> {
        let conn = self.connection()?;
        upsert_actors(&conn, &[actor], &timestamp_now()?)
    }

    pub fn upsert_activity(&self, activity: &Activity) -> Result<()> {
        let conn = self.connection()?;
        upsert_activities(&conn, &[activity], &timestamp_now()?)
    }

    pub fn upsert_verb(&self, verb: &Verb) -> Result<()> {
        let conn = self.connection()?;
        upsert_verbs(&conn, &[verb], &timestamp_now()?)
    }

    /// Returns `false` when a fact with the same statement id already exists.
    pub fn insert_fact(&self, fact: &Fact) -> Result<bool> {
        let conn = self.connection()?;
        let inserted = insert_fact_rows(&conn, &[fact], &timestamp_now()?)?;
        Ok(inserted.contains(&fact.statement_id))
    }

    /// Writes raw copies and normalized entities for a batch in one
    /// transaction. If the batch transaction fails, each item is retried in
    /// its own transaction so one bad item cannot hold back the rest.
    ///
    /// Returns an error when the database is busy or locked, or when every
    /// item fails on its own as well. Both point at the store rather than the
    /// data, so nothing in the batch should be treated as poison.
    pub fn persist_batch(&self, items: &[BatchItem]) -> Result<BatchWriteReport> {
        let started = Instant::now();
        if items.is_empty() {
            return Ok(BatchWriteReport {
                outcomes: Vec::new(),
                fell_back: false,
                elapsed_ms: 0,
            });
        }

        let mut conn = self.connection()?;
        let batch_error = match write_items(&mut conn, items) {
            Ok(outcomes) => {
                return Ok(BatchWriteReport {
                    outcomes,
                    fell_back: false,
                    elapsed_ms: elapsed_ms(started),
                });
            }
            Err(err) => err,
        };

        if is_transient(&batch_error) {
            return Err(batch_error.context("statement store is locked"));
        }

        tracing::warn!(
            items = items.len(),
            error = %format!("{batch_error:#}"),
            "batch write failed; retrying items individually"
        );

        let mut outcomes = Vec::with_capacity(items.len());
        for item in items {
            let outcome = match write_items(&mut conn, std::slice::from_ref(item)) {
                Ok(mut single) => single.pop().unwrap_or(ItemWrite::Failed {
                    error: "item write produced no outcome".to_string(),
                }),
                Err(err) if is_transient(&err) => {
                    return Err(err.context(format!(
                        "statement store is locked while writing {}",
                        item.raw.statement_id
                    )));
                }
                Err(err) => ItemWrite::Failed {
                    error: format!("{err:#}"),
                },
            };
            outcomes.push(outcome);
        }

        if outcomes.iter().all(ItemWrite::is_failed) {
            return Err(batch_error.context("every item in the batch failed to persist"));
        }

        Ok(BatchWriteReport {
            outcomes,
            fell_back: true,
            elapsed_ms: elapsed_ms(started),
        })
    }

    pub fn record_dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT OR REPLACE INTO dead_letters(
                group_name, log_entry_id, statement_id, error, payload, delivery_count, recorded_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                letter.group_name,
                letter.log_entry_id,
                letter.statement_id,
                letter.error,
                letter.payload,
                i64::from(letter.delivery_count),
                letter.recorded_at
            ],
        )
        .context("failed to record dead letter")?;
        Ok(())
    }

    pub fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT group_name, log_entry_id, statement_id, error, payload, delivery_count, recorded_at
             FROM dead_letters
             ORDER BY recorded_at DESC, log_entry_id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
            let delivery_count: i64 = row.get(5)?;
            Ok(DeadLetter {
                group_name: row.get(0)?,
                log_entry_id: row.get(1)?,
                statement_id: row.get(2)?,
                error: row.get(3)?,
                payload: row.get(4)?,
                delivery_count: u32::try_from(delivery_count).map_err(|_| {
                    conversion_error(5, rusqlite::types::Type::Integer, format!("invalid delivery_count: {delivery_count}"))
                })?,
                recorded_at: row.get(6)?,
            })
        })?;
        collect_rows(rows)
    }

    pub fn counts(&self) -> Result<StoreCounts> {
        let conn = self.connection()?;
        let count = |table: &str| -> Result<i64> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .with_context(|| format!("failed to count {table}"))
        };

        Ok(StoreCounts {
            raw_events: count("raw_events")?,
            actors: count("actors")?,
            activities: count("activities")?,
            verbs: count("verbs")?,
            facts: count("facts")?,
            dead_letters: count("dead_letters")?,
        })
    }

    pub fn get_raw_event(&self, statement_id: &str) -> Result<Option<RawEvent>> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT statement_id, payload, log_entry_id, received_at FROM raw_events WHERE statement_id = ?1",
            params![statement_id],
            |row| {
                let received_at: String = row.get(3)?;
                Ok(RawEvent {
                    statement_id: row.get(0)?,
                    payload: row.get(1)?,
                    log_entry_id: row.get(2)?,
                    received_at: parse_timestamp_column(3, &received_at)?,
                })
            },
        )
        .optional()
        .context("failed to read raw event")
    }

    pub fn get_actor(&self, actor_id: &str) -> Result<Option<Actor>> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT actor_id, object_type, name, mbox, openid, account_name, account_homepage,
                    last_seen_ms, last_statement_id
             FROM actors WHERE actor_id = ?1",
            params![actor_id],
            |row| {
                Ok(Actor {
                    actor_id: row.get(0)?,
                    object_type: row.get(1)?,
                    name: row.get(2)?,
                    mbox: row.get(3)?,
                    openid: row.get(4)?,
                    account_name: row.get(5)?,
                    account_homepage: row.get(6)?,
                    last_seen_ms: row.get(7)?,
                    last_statement_id: row.get(8)?,
                })
            },
        )
        .optional()
        .context("failed to read actor")
    }

    pub fn get_activity(&self, activity_id: &str) -> Result<Option<Activity>> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT activity_id, object_type, activity_type, name, name_lang, description,
                    description_lang, interaction_type, more_info, correct_responses_pattern,
                    choices, scale, source, target, steps, extensions, last_seen_ms,
                    last_statement_id
             FROM activities WHERE activity_id = ?1",
            params![activity_id],
            |row| {
                Ok(Activity {
                    activity_id: row.get(0)?,
                    object_type: row.get(1)?,
                    activity_type: row.get(2)?,
                    name: row.get(3)?,
                    name_lang: row.get(4)?,
                    description: row.get(5)?,
                    description_lang: row.get(6)?,
                    interaction_type: row.get(7)?,
                    more_info: row.get(8)?,
                    correct_responses_pattern: row.get(9)?,
                    choices: row.get(10)?,
                    scale: row.get(11)?,
                    source: row.get(12)?,
                    target: row.get(13)?,
                    steps: row.get(14)?,
                    extensions: row.get(15)?,
                    last_seen_ms: row.get(16)?,
                    last_statement_id: row.get(17)?,
                })
            },
        )
        .optional()
        .context("failed to read activity")
    }

    pub fn get_verb(&self, verb_id: &str) -> Result<Option<Verb>> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT verb_id, display, display_lang, last_seen_ms, last_statement_id
             FROM verbs WHERE verb_id = ?1",
            params![verb_id],
            |row| {
                Ok(Verb {
                    verb_id: row.get(0)?,
                    display: row.get(1)?,
                    display_lang: row.get(2)?,
                    last_seen_ms: row.get(3)?,
                    last_statement_id: row.get(4)?,
                })
            },
        )
        .optional()
        .context("failed to read verb")
    }

    pub fn get_fact(&self, statement_id: &str) -> Result<Option<Fact>> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT statement_id, actor_id, verb_id, activity_id, result_success, result_completion,
                    result_duration, result_response, result_score_scaled, result_score_raw,
                    result_score_min, result_score_max, result_extensions, context_registration,
                    context_platform, context_language, context_instructor, context_activities,
                    context_extensions, statement_version, timestamp, stored, received_at
             FROM facts WHERE statement_id = ?1",
            params![statement_id],
            parse_fact_row,
        )
        .optional()
        .context("failed to read fact")
    }
}

fn write_items(conn: &mut Connection, items: &[BatchItem]) -> Result<Vec<ItemWrite>> {
    let now = timestamp_now()?;
    let tx = conn
        .transaction()
        .context("failed to start batch transaction")?;

    let raws: Vec<&RawEvent> = items.iter().map(|item| &item.raw).collect();
    insert_raw_rows(&tx, &raws, &now)?;

    let normalized: Vec<&NormalizedStatement> =
        items.iter().filter_map(|item| item.normalized.as_ref()).collect();

    let actors = latest_by_key(
        normalized.iter().filter_map(|n| {
            n.actor
                .actor_id
                .as_deref()
                .map(|id| (id, (n.actor.last_seen_ms, n.actor.last_statement_id.as_str()), &n.actor))
        }),
    );
    let activities = latest_by_key(normalized.iter().map(|n| {
        (
            n.activity.activity_id.as_str(),
            (n.activity.last_seen_ms, n.activity.last_statement_id.as_str()),
            &n.activity,
        )
    }));
    let verbs = latest_by_key(normalized.iter().map(|n| {
        (
            n.verb.verb_id.as_str(),
            (n.verb.last_seen_ms, n.verb.last_statement_id.as_str()),
            &n.verb,
        )
    }));

    upsert_actors(&tx, &actors, &now)?;
    upsert_activities(&tx, &activities, &now)?;
    upsert_verbs(&tx, &verbs, &now)?;

    // First occurrence of a statement id wins, matching insert-ignore.
    let mut seen = HashSet::new();
    let facts: Vec<&Fact> = normalized
        .iter()
        .map(|n| &n.fact)
        .filter(|fact| seen.insert(fact.statement_id.as_str()))
        .collect();
    let inserted = insert_fact_rows(&tx, &facts, &now)?;

    tx.commit().context("failed to commit batch transaction")?;

    let mut claimed = HashSet::new();
    Ok(items
        .iter()
        .map(|item| match &item.normalized {
            None => ItemWrite::RawOnly,
            Some(n) => {
                let id = n.fact.statement_id.as_str();
                ItemWrite::Persisted {
                    fact_inserted: inserted.contains(id) && claimed.insert(id),
                }
            }
        })
        .collect())
}

/// Keeps the entity with the greatest `(last_seen_ms, last_statement_id)`
/// per key, mirroring the store's update guard.
fn latest_by_key<'a, T>(entries: impl Iterator<Item = (&'a str, (i64, &'a str), &'a T)>) -> Vec<&'a T>
where
    T: 'a,
{
    let mut latest: BTreeMap<&'a str, ((i64, &'a str), &'a T)> = BTreeMap::new();
    for (key, order, entity) in entries {
        match latest.get(key) {
            Some((current, _)) if *current > order => {}
            _ => {
                latest.insert(key, (order, entity));
            }
        }
    }
    latest.into_values().map(|(_, entity)| entity).collect()
}

fn insert_raw_rows(conn: &Connection, raws: &[&RawEvent], now: &str) -> Result<usize> {
    let rows = raws
        .iter()
        .map(|raw| {
            Ok(vec![
                SqlValue::from(raw.statement_id.clone()),
                SqlValue::from(raw.payload.clone()),
                SqlValue::from(raw.log_entry_id),
                SqlValue::from(timestamp_text(raw.received_at)?),
                SqlValue::from(now.to_string()),
            ])
        })
        .collect::<Result<Vec<_>>>()?;
    execute_multi_row(conn, INSERT_RAW_HEAD, "", RAW_COLUMNS, &rows).context("failed to write raw events")
}

fn upsert_actors(conn: &Connection, actors: &[&Actor], now: &str) -> Result<()> {
    let rows: Vec<Vec<SqlValue>> = actors
        .iter()
        .filter_map(|actor| {
            actor.actor_id.as_ref().map(|actor_id| {
                vec![
                    SqlValue::from(actor_id.clone()),
                    SqlValue::from(actor.object_type.clone()),
                    SqlValue::from(actor.name.clone()),
                    SqlValue::from(actor.mbox.clone()),
                    SqlValue::from(actor.openid.clone()),
                    SqlValue::from(actor.account_name.clone()),
                    SqlValue::from(actor.account_homepage.clone()),
                    SqlValue::from(actor.last_seen_ms),
                    SqlValue::from(actor.last_statement_id.clone()),
                    SqlValue::from(now.to_string()),
                    SqlValue::from(now.to_string()),
                ]
            })
        })
        .collect();
    execute_multi_row(conn, UPSERT_ACTORS_HEAD, UPSERT_ACTORS_TAIL, ACTOR_COLUMNS, &rows)
        .context("failed to upsert actors")?;
    Ok(())
}

fn upsert_activities(conn: &Connection, activities: &[&Activity], now: &str) -> Result<()> {
    let rows: Vec<Vec<SqlValue>> = activities
        .iter()
        .map(|activity| {
            vec![
                SqlValue::from(activity.activity_id.clone()),
                SqlValue::from(activity.object_type.clone()),
                SqlValue::from(activity.activity_type.clone()),
                SqlValue::from(activity.name.clone()),
                SqlValue::from(activity.name_lang.clone()),
                SqlValue::from(activity.description.clone()),
                SqlValue::from(activity.description_lang.clone()),
                SqlValue::from(activity.interaction_type.clone()),
                SqlValue::from(activity.more_info.clone()),
                SqlValue::from(activity.correct_responses_pattern.clone()),
                SqlValue::from(activity.choices.clone()),
                SqlValue::from(activity.scale.clone()),
                SqlValue::from(activity.source.clone()),
                SqlValue::from(activity.target.clone()),
                SqlValue::from(activity.steps.clone()),
                SqlValue::from(activity.extensions.clone()),
                SqlValue::from(activity.last_seen_ms),
                SqlValue::from(activity.last_statement_id.clone()),
                SqlValue::from(now.to_string()),
                SqlValue::from(now.to_string()),
            ]
        })
        .collect();
    execute_multi_row(
        conn,
        UPSERT_ACTIVITIES_HEAD,
        UPSERT_ACTIVITIES_TAIL,
        ACTIVITY_COLUMNS,
        &rows,
    )
    .context("failed to upsert activities")?;
    Ok(())
}

fn upsert_verbs(conn: &Connection, verbs: &[&Verb], now: &str) -> Result<()> {
    let rows: Vec<Vec<SqlValue>> = verbs
        .iter()
        .map(|verb| {
            vec![
                SqlValue::from(verb.verb_id.clone()),
                SqlValue::from(verb.display.clone()),
                SqlValue::from(verb.display_lang.clone()),
                SqlValue::from(verb.last_seen_ms),
                SqlValue::from(verb.last_statement_id.clone()),
                SqlValue::from(now.to_string()),
                SqlValue::from(now.to_string()),
            ]
        })
        .collect();
    execute_multi_row(conn, UPSERT_VERBS_HEAD, UPSERT_VERBS_TAIL, VERB_COLUMNS, &rows)
        .context("failed to upsert verbs")?;
    Ok(())
}

/// Returns the statement ids whose facts were newly inserted.
fn insert_fact_rows(conn: &Connection, facts: &[&Fact], now: &str) -> Result<HashSet<String>> {
    let rows = facts
        .iter()
        .map(|fact| fact_row(fact, now))
        .collect::<Result<Vec<_>>>()?;

    let mut inserted = HashSet::new();
    for chunk in rows.chunks(rows_per_statement(FACT_COLUMNS)) {
        let sql = format!(
            "{INSERT_FACTS_HEAD}{} ON CONFLICT(statement_id) DO NOTHING RETURNING statement_id",
            placeholders(FACT_COLUMNS, chunk.len())
        );
        let mut stmt = conn.prepare(&sql).context("failed to prepare fact insert")?;
        let mut result = stmt
            .query(params_from_iter(chunk.iter().flatten()))
            .context("failed to insert facts")?;
        while let Some(row) = result.next()? {
            inserted.insert(row.get::<_, String>(0)?);
        }
    }
    Ok(inserted)
}

fn fact_row(fact: &Fact, now: &str) -> Result<Vec<SqlValue>> {
    Ok(vec![
        SqlValue::from(fact.statement_id.clone()),
        SqlValue::from(fact.actor_id.clone()),
        SqlValue::from(fact.verb_id.clone()),
        SqlValue::from(fact.activity_id.clone()),
        SqlValue::from(fact.result_success.map(bool_to_sql)),
        SqlValue::from(fact.result_completion.map(bool_to_sql)),
        SqlValue::from(fact.result_duration.clone()),
        SqlValue::from(fact.result_response.clone()),
        SqlValue::from(fact.result_score_scaled),
        SqlValue::from(fact.result_score_raw),
        SqlValue::from(fact.result_score_min),
        SqlValue::from(fact.result_score_max),
        SqlValue::from(fact.result_extensions.clone()),
        SqlValue::from(fact.context_registration.clone()),
        SqlValue::from(fact.context_platform.clone()),
        SqlValue::from(fact.context_language.clone()),
        SqlValue::from(fact.context_instructor.clone()),
        SqlValue::from(fact.context_activities.clone()),
        SqlValue::from(fact.context_extensions.clone()),
        SqlValue::from(fact.statement_version.clone()),
        SqlValue::from(timestamp_text(fact.timestamp)?),
        SqlValue::from(unix_millis(fact.timestamp)),
        SqlValue::from(fact.stored.map(timestamp_text).transpose()?),
        SqlValue::from(timestamp_text(fact.received_at)?),
        SqlValue::from(now.to_string()),
    ])
}

fn parse_fact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fact> {
    let timestamp: String = row.get(20)?;
    let stored: Option<String> = row.get(21)?;
    let received_at: String = row.get(22)?;
    let result_success: Option<i64> = row.get(4)?;
    let result_completion: Option<i64> = row.get(5)?;

    Ok(Fact {
        statement_id: row.get(0)?,
        actor_id: row.get(1)?,
        verb_id: row.get(2)?,
        activity_id: row.get(3)?,
        result_success: result_success.map(|value| value == 1),
        result_completion: result_completion.map(|value| value == 1),
        result_duration: row.get(6)?,
        result_response: row.get(7)?,
        result_score_scaled: row.get(8)?,
        result_score_raw: row.get(9)?,
        result_score_min: row.get(10)?,
        result_score_max: row.get(11)?,
        result_extensions: row.get(12)?,
        context_registration: row.get(13)?,
        context_platform: row.get(14)?,
        context_language: row.get(15)?,
        context_instructor: row.get(16)?,
        context_activities: row.get(17)?,
        context_extensions: row.get(18)?,
        statement_version: row.get(19)?,
        timestamp: parse_timestamp_column(20, &timestamp)?,
        stored: stored
            .as_deref()
            .map(|value| parse_timestamp_column(21, value))
            .transpose()?,
        received_at: parse_timestamp_column(22, &received_at)?,
    })
}

fn execute_multi_row(
    conn: &Connection,
    head: &str,
    tail: &str,
    columns: usize,
    rows: &[Vec<SqlValue>],
) -> Result<usize> {
    let mut affected = 0;
    for chunk in rows.chunks(rows_per_statement(columns)) {
        let sql = format!("{head}{}{tail}", placeholders(columns, chunk.len()));
        affected += conn.execute(&sql, params_from_iter(chunk.iter().flatten()))?;
    }
    Ok(affected)
}

fn rows_per_statement(columns: usize) -> usize {
    (MAX_BIND_PARAMS / columns).max(1)
}

fn placeholders(columns: usize, rows: usize) -> String {
    let row = format!("({})", vec!["?"; columns].join(", "));
    vec![row; rows].join(", ")
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn timestamp_now() -> Result<String> {
    timestamp_text(now_utc())
}

fn timestamp_text(value: time::OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn parse_timestamp_column(index: usize, value: &str) -> rusqlite::Result<time::OffsetDateTime> {
    parse_rfc3339_utc(value).map_err(|err| {
        conversion_error(index, rusqlite::types::Type::Text, format!("invalid timestamp {value}: {err}"))
    })
}

fn conversion_error(index: usize, kind: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();
    Ok(exists)
}

/// Lock contention that outlasted the busy timeout. Retrying later can clear
/// it, unlike constraint or data errors.
#[must_use]
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause
                .downcast_ref::<rusqlite::Error>()
                .and_then(rusqlite::Error::sqlite_error_code),
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
        )
    })
}

pub(crate) fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
