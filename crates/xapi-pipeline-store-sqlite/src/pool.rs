use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

pub type ConnectionPool = r2d2::Pool<SqliteConnectionManager>;
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

pub const DEFAULT_POOL_SIZE: usize = 4;
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

// busy_timeout goes first so concurrent opens wait out the WAL switch.
const CONNECTION_PRAGMAS: &str = "PRAGMA busy_timeout = 5000;
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;";

fn configure(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(CONNECTION_PRAGMAS)
}

/// Opens a standalone connection with the pragmas every pipeline connection
/// relies on.
pub fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
    configure(&conn).context("failed to configure sqlite pragmas")?;
    Ok(conn)
}

/// Builds the bounded pool shared by consumer and recovery threads. Callers
/// that find it exhausted wait up to `acquire_timeout` before failing.
pub fn open_pool(path: &Path, size: usize, acquire_timeout: Duration) -> Result<ConnectionPool> {
    if size == 0 {
        return Err(anyhow!("connection pool size must be at least 1"));
    }

    // Every `:memory:` connection is its own database, so keep exactly one
    // and never recycle it.
    let in_memory = path == Path::new(":memory:");
    let size = if in_memory { 1 } else { size };
    let max_size = u32::try_from(size).unwrap_or(u32::MAX);

    let manager = SqliteConnectionManager::file(path).with_init(|conn| configure(conn));
    let mut builder = r2d2::Pool::builder()
        .max_size(max_size)
        .connection_timeout(acquire_timeout);
    if in_memory {
        builder = builder.idle_timeout(None).max_lifetime(None);
    }
    builder
        .build(manager)
        .with_context(|| format!("failed to open sqlite pool at {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn temp_db() -> PathBuf {
        std::env::temp_dir().join(format!("xapi-pool-{}.sqlite3", Ulid::new()))
    }

    fn checkout(pool: &ConnectionPool) -> PooledConnection {
        must(pool.get().map_err(anyhow::Error::from))
    }

    #[test]
    fn connections_carry_pipeline_pragmas() {
        let pool = must(open_pool(&temp_db(), 2, DEFAULT_ACQUIRE_TIMEOUT));
        let conn = checkout(&pool);
        let foreign_keys: i64 = must(
            conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))
                .map_err(anyhow::Error::from),
        );
        let journal_mode: String = must(
            conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .map_err(anyhow::Error::from),
        );
        let busy_timeout: i64 = must(
            conn.query_row("PRAGMA busy_timeout", [], |row| row.get(0))
                .map_err(anyhow::Error::from),
        );
        assert_eq!(foreign_keys, 1);
        assert_eq!(journal_mode.to_ascii_lowercase(), "wal");
        assert_eq!(busy_timeout, 5000);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let pool = must(open_pool(&temp_db(), 1, Duration::from_millis(50)));
        let held = checkout(&pool);
        assert!(pool.get().is_err());
        drop(held);
        assert!(pool.get().is_ok());
    }

    #[test]
    fn pool_never_exceeds_its_size() {
        let pool = must(open_pool(&temp_db(), 2, DEFAULT_ACQUIRE_TIMEOUT));
        {
            let _a = checkout(&pool);
            let _b = checkout(&pool);
        }
        let _c = checkout(&pool);
        let _d = checkout(&pool);
        assert_eq!(pool.state().connections, 2);
        assert_eq!(pool.max_size(), 2);
    }

    #[test]
    fn memory_database_is_clamped_to_one_connection() {
        let pool = must(open_pool(Path::new(":memory:"), 8, DEFAULT_ACQUIRE_TIMEOUT));
        assert_eq!(pool.max_size(), 1);
    }

    #[test]
    fn zero_sized_pool_is_rejected() {
        assert!(open_pool(&temp_db(), 0, DEFAULT_ACQUIRE_TIMEOUT).is_err());
    }
}
