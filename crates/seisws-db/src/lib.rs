//! Database layer for seisws.
//!
//! Provides the SQLite connection pool (via `r2d2`), WAL-mode initialization,
//! embedded SQL migrations, and the column helpers shared by every crate that
//! reads archive summaries, access rules, or the request log.
//!
//! Instants are stored as INTEGER microseconds since the Unix epoch.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};

use chrono::DateTime;
use seisws_types::Time;

/// Converts an instant to its stored column value.
pub fn time_to_micros(time: &Time) -> i64 {
    time.timestamp_micros()
}

/// Converts a stored column value back to an instant.
///
/// Out-of-range values clamp to the epoch rather than failing the row.
pub fn time_from_micros(micros: i64) -> Time {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

/// Reads an optional instant column.
pub fn opt_time_from_micros(micros: Option<i64>) -> Option<Time> {
    micros.map(time_from_micros)
}
