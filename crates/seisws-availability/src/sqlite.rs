//! Archive summaries read from the `data_*` tables.

use std::ops::ControlFlow;

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Row};
use seisws_db::{time_from_micros, time_to_micros, DbPool};
use seisws_types::{ArchiveObject, AttributeExtent, Extent, ExtentId, Segment, StreamId};

use crate::source::{ExtentSource, SegmentQuery, SegmentSource, SourceError};

/// SQLite-backed [`ExtentSource`] and [`SegmentSource`].
#[derive(Debug, Clone)]
pub struct SqliteArchive {
    pool: DbPool,
}

impl SqliteArchive {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn count(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    Ok(row.get::<_, i64>(idx)?.max(0) as u64)
}

impl ExtentSource for SqliteArchive {
    fn load_objects(&self) -> Result<Vec<ArchiveObject>, SourceError> {
        let conn = self.pool.get()?;

        let mut stmt = conn.prepare(
            "SELECT id, network, station, location, channel,
                    start_us, end_us, updated_us, segment_count, segment_overflow
             FROM data_extents ORDER BY id",
        )?;
        let extents = stmt.query_map([], |row| {
            Ok(ArchiveObject::Extent {
                id: row.get(0)?,
                extent: Extent {
                    stream: StreamId::new(
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ),
                    start: time_from_micros(row.get(5)?),
                    end: time_from_micros(row.get(6)?),
                    updated: time_from_micros(row.get(7)?),
                    segment_count: count(row, 8)?,
                    segment_overflow: row.get(9)?,
                    attributes: Vec::new(),
                },
            })
        })?;
        let mut objects = extents.collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT extent_id, quality, sample_rate, start_us, end_us, updated_us, segment_count
             FROM data_attribute_extents ORDER BY extent_id, id",
        )?;
        let attributes = stmt.query_map([], |row| {
            Ok(ArchiveObject::AttributeExtent {
                extent_id: row.get(0)?,
                attribute: AttributeExtent {
                    quality: row.get(1)?,
                    sample_rate: row.get(2)?,
                    start: time_from_micros(row.get(3)?),
                    end: time_from_micros(row.get(4)?),
                    updated: time_from_micros(row.get(5)?),
                    segment_count: count(row, 6)?,
                },
            })
        })?;
        for attribute in attributes {
            objects.push(attribute?);
        }

        Ok(objects)
    }
}

impl SegmentSource for SqliteArchive {
    fn scan_segments(
        &self,
        query: &SegmentQuery,
        visit: &mut dyn FnMut(ExtentId, Segment) -> ControlFlow<()>,
    ) -> Result<(), SourceError> {
        if query.extent_ids.is_empty() {
            return Ok(());
        }

        let mut sql = String::from(
            "SELECT extent_id, start_us, end_us, updated_us, quality, sample_rate
             FROM data_segments WHERE extent_id IN (",
        );
        let mut values: Vec<Value> = Vec::with_capacity(query.extent_ids.len() + 4);
        for (i, id) in query.extent_ids.iter().enumerate() {
            sql.push_str(if i == 0 { "?" } else { ",?" });
            values.push(Value::Integer(*id));
        }
        sql.push(')');

        if let Some(start) = &query.window.start {
            sql.push_str(" AND end_us >= ?");
            values.push(Value::Integer(time_to_micros(start)));
        }
        if let Some(end) = &query.window.end {
            sql.push_str(" AND start_us < ?");
            values.push(Value::Integer(time_to_micros(end)));
        }
        if let Some(quality) = &query.quality {
            sql.push_str(" AND quality IN (");
            for (i, q) in quality.iter().enumerate() {
                sql.push_str(if i == 0 { "?" } else { ",?" });
                values.push(Value::Text(q.clone()));
            }
            sql.push(')');
        }
        sql.push_str(" ORDER BY extent_id, start_us");

        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(values))?;

        // Dropping `rows` on break finalizes the statement.
        while let Some(row) = rows.next()? {
            let extent_id: ExtentId = row.get(0)?;
            let segment = Segment {
                start: time_from_micros(row.get(1)?),
                end: time_from_micros(row.get(2)?),
                updated: time_from_micros(row.get(3)?),
                quality: row.get(4)?,
                sample_rate: row.get(5)?,
            };
            if visit(extent_id, segment).is_break() {
                break;
            }
        }

        Ok(())
    }
}
