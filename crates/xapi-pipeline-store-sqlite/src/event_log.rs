use std::path::Path;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use xapi_pipeline_core::{now_utc, unix_millis};

use crate::collect_rows;
use crate::pool::open_connection;

pub const DEFAULT_STREAM: &str = "xapi_statements";
pub const DEFAULT_REDELIVERY_IDLE: Duration = Duration::from_secs(30);
const WAIT_SLICE: Duration = Duration::from_millis(200);

const SCHEMA_EVENT_LOG_V1: &str = r"
CREATE TABLE IF NOT EXISTS log_entries (
  entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
  stream TEXT NOT NULL,
  published_at_ms INTEGER NOT NULL,
  payload TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_log_entries_stream_time
  ON log_entries(stream, published_at_ms, entry_id);

CREATE TRIGGER IF NOT EXISTS trg_log_entries_no_update
BEFORE UPDATE ON log_entries
BEGIN
  SELECT RAISE(FAIL, 'log_entries is append-only');
END;

CREATE TABLE IF NOT EXISTS log_groups (
  stream TEXT NOT NULL,
  group_name TEXT NOT NULL,
  last_delivered_id INTEGER NOT NULL DEFAULT 0,
  created_at_ms INTEGER NOT NULL,
  PRIMARY KEY (stream, group_name)
);

CREATE TABLE IF NOT EXISTS log_pending (
  stream TEXT NOT NULL,
  group_name TEXT NOT NULL,
  entry_id INTEGER NOT NULL REFERENCES log_entries(entry_id),
  consumer TEXT NOT NULL,
  delivered_at_ms INTEGER NOT NULL,
  delivery_count INTEGER NOT NULL CHECK (delivery_count >= 1),
  PRIMARY KEY (stream, group_name, entry_id)
);

CREATE INDEX IF NOT EXISTS idx_log_pending_idle
  ON log_pending(stream, group_name, delivered_at_ms);
";

/// One published statement as handed out by the log.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub id: i64,
    pub published_at_ms: i64,
    pub payload: String,
    /// Times this entry has been handed to the reading group, including this
    /// delivery. Zero for range reads, which bypass groups.
    pub delivery_count: u32,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct PendingSummary {
    pub stream: String,
    pub group: String,
    pub pending: usize,
    pub oldest_pending_id: Option<i64>,
    pub max_delivery_count: u32,
    pub last_delivered_id: i64,
    pub undelivered: usize,
}

/// Durable, ordered, append-only stream of statements with consumer groups.
///
/// Entries delivered through [`EventLog::read_group`] stay pending for the
/// group until acknowledged. Unacknowledged entries are handed out again once
/// they have been idle for the log's redelivery interval.
pub trait EventLog: Send + Sync {
    fn stream(&self) -> &str;

    fn append(&self, payload: &str) -> Result<LogEntry>;

    /// Creates the group if missing. New groups start at the head of the log.
    fn ensure_group(&self, group: &str) -> Result<()>;

    /// Returns up to `count` entries for `consumer`: pending entries it
    /// already owns or that sat idle past the redelivery interval first, then
    /// never-delivered ones, all in log order. Waits up to `block` when
    /// nothing is available.
    fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>>;

    /// Marks entries as done for the group. Returns how many were pending.
    fn ack(&self, group: &str, ids: &[i64]) -> Result<usize>;

    /// Time-range read independent of any group. `after` pages by entry id.
    fn read_range(
        &self,
        from_ms: i64,
        to_ms: i64,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<LogEntry>>;

    fn pending(&self, group: &str) -> Result<PendingSummary>;
}

pub struct SqliteEventLog {
    stream: String,
    redelivery_idle: Duration,
    conn: Mutex<Connection>,
    appended: Condvar,
}

impl SqliteEventLog {
    pub fn open(path: &Path, stream: &str) -> Result<Self> {
        if stream.trim().is_empty() {
            return Err(anyhow!("stream name must not be empty"));
        }

        let conn = open_connection(path)?;
        conn.execute_batch(SCHEMA_EVENT_LOG_V1)
            .context("failed to apply event log schema")?;

        Ok(Self {
            stream: stream.to_string(),
            redelivery_idle: DEFAULT_REDELIVERY_IDLE,
            conn: Mutex::new(conn),
            appended: Condvar::new(),
        })
    }

    #[must_use]
    pub fn with_redelivery_idle(mut self, idle: Duration) -> Self {
        self.redelivery_idle = idle;
        self
    }

    #[must_use]
    pub fn redelivery_idle(&self) -> Duration {
        self.redelivery_idle
    }

    /// Appends with an explicit publish time. Used for backfills and replays
    /// where the original publish time is known.
    pub fn append_at(&self, payload: &str, published_at_ms: i64) -> Result<LogEntry> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO log_entries(stream, published_at_ms, payload) VALUES (?1, ?2, ?3)",
            params![self.stream, published_at_ms, payload],
        )
        .context("failed to append log entry")?;
        let id = conn.last_insert_rowid();
        drop(conn);

        self.appended.notify_all();
        Ok(LogEntry {
            id,
            published_at_ms,
            payload: payload.to_string(),
            delivery_count: 0,
        })
    }

    pub fn latest_id(&self) -> Result<i64> {
        let conn = self.lock()?;
        let latest: Option<i64> = conn
            .query_row(
                "SELECT MAX(entry_id) FROM log_entries WHERE stream = ?1",
                params![self.stream],
                |row| row.get(0),
            )
            .context("failed to query latest log entry")?;
        Ok(latest.unwrap_or(0))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("event log connection lock poisoned"))
    }

    fn claim(&self, conn: &mut Connection, group: &str, consumer: &str, count: usize) -> Result<Vec<LogEntry>> {
        let now_ms = unix_millis(now_utc());
        let idle_ms = i64::try_from(self.redelivery_idle.as_millis()).unwrap_or(i64::MAX);
        let idle_cutoff = now_ms.saturating_sub(idle_ms);
        let limit = i64::try_from(count).unwrap_or(i64::MAX);

        let tx = conn.transaction().context("failed to start claim transaction")?;
        ensure_group_row(&tx, &self.stream, group, now_ms)?;

        let mut claimed = {
            let mut stmt = tx.prepare(
                "SELECT p.entry_id, e.published_at_ms, e.payload, p.delivery_count
                 FROM log_pending p
                 JOIN log_entries e ON e.entry_id = p.entry_id
                 WHERE p.stream = ?1 AND p.group_name = ?2
                   AND (p.consumer = ?3 OR p.delivered_at_ms <= ?4)
                 ORDER BY p.entry_id ASC
                 LIMIT ?5",
            )?;
            let rows = stmt.query_map(params![self.stream, group, consumer, idle_cutoff, limit], |row| {
                let previous: i64 = row.get(3)?;
                Ok(LogEntry {
                    id: row.get(0)?,
                    published_at_ms: row.get(1)?,
                    payload: row.get(2)?,
                    delivery_count: u32::try_from(previous.saturating_add(1)).unwrap_or(u32::MAX),
                })
            })?;
            collect_rows(rows)?
        };

        for entry in &claimed {
            tx.execute(
                "UPDATE log_pending
                 SET consumer = ?1, delivered_at_ms = ?2, delivery_count = delivery_count + 1
                 WHERE stream = ?3 AND group_name = ?4 AND entry_id = ?5",
                params![consumer, now_ms, self.stream, group, entry.id],
            )
            .context("failed to reclaim pending entry")?;
        }

        let remaining = count.saturating_sub(claimed.len());
        if remaining > 0 {
            let last_delivered: i64 = tx
                .query_row(
                    "SELECT last_delivered_id FROM log_groups WHERE stream = ?1 AND group_name = ?2",
                    params![self.stream, group],
                    |row| row.get(0),
                )
                .context("failed to read group cursor")?;

            let fresh = {
                let mut stmt = tx.prepare(
                    "SELECT entry_id, published_at_ms, payload
                     FROM log_entries
                     WHERE stream = ?1 AND entry_id > ?2
                     ORDER BY entry_id ASC
                     LIMIT ?3",
                )?;
                let rows = stmt.query_map(
                    params![self.stream, last_delivered, i64::try_from(remaining).unwrap_or(i64::MAX)],
                    |row| {
                        Ok(LogEntry {
                            id: row.get(0)?,
                            published_at_ms: row.get(1)?,
                            payload: row.get(2)?,
                            delivery_count: 1,
                        })
                    },
                )?;
                collect_rows(rows)?
            };

            for entry in &fresh {
                tx.execute(
                    "INSERT INTO log_pending(stream, group_name, entry_id, consumer, delivered_at_ms, delivery_count)
                     VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                    params![self.stream, group, entry.id, consumer, now_ms],
                )
                .context("failed to record pending entry")?;
            }

            if let Some(last) = fresh.last() {
                tx.execute(
                    "UPDATE log_groups SET last_delivered_id = ?1 WHERE stream = ?2 AND group_name = ?3",
                    params![last.id, self.stream, group],
                )
                .context("failed to advance group cursor")?;
            }

            claimed.extend(fresh);
        }

        tx.commit().context("failed to commit claim transaction")?;
        Ok(claimed)
    }
}

impl EventLog for SqliteEventLog {
    fn stream(&self) -> &str {
        &self.stream
    }

    fn append(&self, payload: &str) -> Result<LogEntry> {
        self.append_at(payload, unix_millis(now_utc()))
    }

    fn ensure_group(&self, group: &str) -> Result<()> {
        if group.trim().is_empty() {
            return Err(anyhow!("consumer group name must not be empty"));
        }
        let conn = self.lock()?;
        ensure_group_row(&conn, &self.stream, group, unix_millis(now_utc()))
    }

    fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + block;
        let mut conn = self.lock()?;
        loop {
            let entries = self.claim(&mut conn, group, consumer, count)?;
            if !entries.is_empty() {
                return Ok(entries);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(entries);
            }

            // Pending entries become eligible by time alone, so wake
            // periodically even without an append.
            let (guard, _) = self
                .appended
                .wait_timeout(conn, (deadline - now).min(WAIT_SLICE))
                .map_err(|_| anyhow!("event log connection lock poisoned"))?;
            conn = guard;
        }
    }

    fn ack(&self, group: &str, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction().context("failed to start ack transaction")?;
        let mut acknowledged = 0;
        for id in ids {
            acknowledged += tx
                .execute(
                    "DELETE FROM log_pending WHERE stream = ?1 AND group_name = ?2 AND entry_id = ?3",
                    params![self.stream, group, id],
                )
                .context("failed to acknowledge entry")?;
        }
        tx.commit().context("failed to commit ack transaction")?;
        Ok(acknowledged)
    }

    fn read_range(
        &self,
        from_ms: i64,
        to_ms: i64,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT entry_id, published_at_ms, payload
             FROM log_entries
             WHERE stream = ?1 AND published_at_ms >= ?2 AND published_at_ms <= ?3 AND entry_id > ?4
             ORDER BY entry_id ASC
             LIMIT ?5",
        )?;
        let rows = stmt.query_map(
            params![
                self.stream,
                from_ms,
                to_ms,
                after.unwrap_or(0),
                i64::try_from(limit).unwrap_or(i64::MAX)
            ],
            |row| {
                Ok(LogEntry {
                    id: row.get(0)?,
                    published_at_ms: row.get(1)?,
                    payload: row.get(2)?,
                    delivery_count: 0,
                })
            },
        )?;
        collect_rows(rows)
    }

    fn pending(&self, group: &str) -> Result<PendingSummary> {
        let conn = self.lock()?;
        let last_delivered_id: i64 = conn
            .query_row(
                "SELECT last_delivered_id FROM log_groups WHERE stream = ?1 AND group_name = ?2",
                params![self.stream, group],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read group cursor")?
            .unwrap_or(0);

        let (pending, oldest_pending_id, max_delivery_count): (i64, Option<i64>, Option<i64>) = conn
            .query_row(
                "SELECT COUNT(*), MIN(entry_id), MAX(delivery_count)
                 FROM log_pending WHERE stream = ?1 AND group_name = ?2",
                params![self.stream, group],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .context("failed to summarize pending entries")?;

        let undelivered: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM log_entries WHERE stream = ?1 AND entry_id > ?2",
                params![self.stream, last_delivered_id],
                |row| row.get(0),
            )
            .context("failed to count undelivered entries")?;

        Ok(PendingSummary {
            stream: self.stream.clone(),
            group: group.to_string(),
            pending: usize::try_from(pending).unwrap_or(0),
            oldest_pending_id,
            max_delivery_count: max_delivery_count
                .and_then(|value| u32::try_from(value).ok())
                .unwrap_or(0),
            last_delivered_id,
            undelivered: usize::try_from(undelivered).unwrap_or(0),
        })
    }
}

fn ensure_group_row(conn: &Connection, stream: &str, group: &str, now_ms: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO log_groups(stream, group_name, last_delivered_id, created_at_ms)
         VALUES (?1, ?2, 0, ?3)",
        params![stream, group, now_ms],
    )
    .context("failed to ensure consumer group")?;
    Ok(())
}
