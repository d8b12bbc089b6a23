use rusqlite::Connection;
use seisws_db::opt_time_from_micros;

use crate::{AccessError, AccessRule};

/// Reads every row of `access_rules`.
///
/// Rows without a network code or identity pattern can never match and are
/// skipped with a warning.
pub fn load_rules(conn: &Connection) -> Result<Vec<AccessRule>, AccessError> {
    let mut stmt = conn.prepare(
        "SELECT id, network, station, location, channel, pattern, start_us, end_us
         FROM access_rules ORDER BY id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            AccessRule {
                network: row.get(1)?,
                station: row.get(2)?,
                location: row.get(3)?,
                channel: row.get(4)?,
                pattern: row.get(5)?,
                start: opt_time_from_micros(row.get(6)?),
                end: opt_time_from_micros(row.get(7)?),
            },
        ))
    })?;

    let mut rules = Vec::new();
    for row in rows {
        let (id, rule) = row?;
        let reason = if rule.network.is_empty() {
            Some("empty network code")
        } else if rule.pattern.trim().is_empty() {
            Some("empty identity pattern")
        } else {
            None
        };
        if let Some(reason) = reason {
            let err = AccessError::InvalidRule {
                id,
                reason: reason.to_string(),
            };
            tracing::warn!(error = %err, "skipping access rule");
            continue;
        }
        rules.push(rule);
    }

    tracing::debug!(count = rules.len(), "access rules loaded");
    Ok(rules)
}
