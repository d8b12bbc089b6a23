//! SQLite pool shared by the archive readers and the request tracker.
//!
//! The archive tables are written by an external inventory process while
//! the services read them, so every connection runs in WAL mode and waits
//! on a busy database instead of failing straight away.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

/// Connection tunables taken from the `[database]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// How long a statement waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,
    pub pool_max_size: u32,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
        }
    }
}

pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to open archive database: {0}")]
    PoolInit(#[from] r2d2::Error),
}

/// Per-connection setup. `:memory:` connections report journal mode
/// "memory" and are accepted as they are.
fn prepare_connection(conn: &mut Connection, busy_timeout_ms: u64) -> rusqlite::Result<()> {
    let mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
    if !matches!(mode.as_str(), "wal" | "memory") {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("archive database refused WAL mode ({mode})")),
        ));
    }
    conn.execute_batch(&format!(
        "PRAGMA foreign_keys = ON;\nPRAGMA busy_timeout = {busy_timeout_ms};"
    ))
}

/// Opens (creating if needed) the database at `db_path`.
///
/// Each `:memory:` connection is a separate database, so in-memory pools
/// only make sense with a size of one.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_init(move |conn| prepare_connection(conn, settings.busy_timeout_ms));

    let pool = Pool::builder()
        .max_size(settings.pool_max_size)
        .build(manager)?;
    tracing::debug!(
        path = db_path,
        max_size = settings.pool_max_size,
        "archive database pool ready"
    );
    Ok(pool)
}
