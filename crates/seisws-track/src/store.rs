//! Request tracking persisted to SQLite.
//!
//! Trackers never touch the database themselves. They push events onto a
//! channel drained by a single writer task, which applies each event on the
//! blocking pool. A slow database therefore delays the log, never the
//! response.

use rusqlite::{params, Connection};
use seisws_db::{time_to_micros, DbPool};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{LineStatus, RequestInfo, TrackError, TrackStatus, TrackingSink};

#[derive(Debug)]
enum TrackEvent {
    Begin(RequestInfo),
    Line {
        request_id: String,
        line: LineStatus,
    },
    Volume {
        request_id: String,
        status: TrackStatus,
        bytes: u64,
        message: String,
    },
    End {
        request_id: String,
    },
}

/// Handle for creating database trackers. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DbTrackWriter {
    tx: mpsc::UnboundedSender<TrackEvent>,
}

impl DbTrackWriter {
    /// Opens a `request_log` row for `info` and returns its tracker.
    pub fn tracker(&self, info: RequestInfo) -> DbTracker {
        let request_id = info.request_id.clone();
        self.send(TrackEvent::Begin(info));
        DbTracker {
            writer: self.clone(),
            request_id,
        }
    }

    fn send(&self, event: TrackEvent) {
        if self.tx.send(event).is_err() {
            tracing::warn!("tracking writer stopped, dropping event");
        }
    }
}

/// Starts the writer task. It exits once every [`DbTrackWriter`] and
/// [`DbTracker`] has been dropped.
pub fn spawn_db_writer(pool: DbPool) -> (DbTrackWriter, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<TrackEvent>();
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let pool = pool.clone();
            let result = tokio::task::spawn_blocking(move || -> Result<(), TrackError> {
                let conn = pool.get()?;
                apply_event(&conn, event)
            })
            .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(error = %err, "failed to record tracking event"),
                Err(err) => tracing::error!(error = %err, "tracking writer task panicked"),
            }
        }
        tracing::debug!("tracking writer finished");
    });
    (DbTrackWriter { tx }, handle)
}

fn apply_event(conn: &Connection, event: TrackEvent) -> Result<(), TrackError> {
    match event {
        TrackEvent::Begin(info) => {
            conn.execute(
                "INSERT INTO request_log (request_id, service, user_id, client_ip, user_agent)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    info.request_id,
                    info.service,
                    info.user_name.unwrap_or_default(),
                    info.client_ip,
                    info.user_agent,
                ],
            )?;
        }
        TrackEvent::Line { request_id, line } => {
            conn.execute(
                "INSERT INTO request_log_lines
                    (request_id, kind, network, station, location, channel,
                     start_us, end_us, status, bytes, message)
                 VALUES (?1, 'WAVEFORM', ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    request_id,
                    line.stream.network,
                    line.stream.station,
                    line.stream.location,
                    line.stream.channel,
                    time_to_micros(&line.start),
                    time_to_micros(&line.end),
                    line.status.as_str(),
                    line.bytes as i64,
                    line.message,
                ],
            )?;
        }
        TrackEvent::Volume {
            request_id,
            status,
            bytes,
            message,
        } => {
            conn.execute(
                "UPDATE request_log SET status = ?2, bytes = ?3, message = ?4
                 WHERE request_id = ?1",
                params![request_id, status.as_str(), bytes as i64, message],
            )?;
        }
        TrackEvent::End { request_id } => {
            conn.execute(
                "UPDATE request_log SET finished_at = datetime('now') WHERE request_id = ?1",
                params![request_id],
            )?;
        }
    }
    Ok(())
}

/// Tracker for one request backed by the database writer.
#[derive(Debug, Clone)]
pub struct DbTracker {
    writer: DbTrackWriter,
    request_id: String,
}

impl TrackingSink for DbTracker {
    fn line_status(&self, line: &LineStatus) {
        self.writer.send(TrackEvent::Line {
            request_id: self.request_id.clone(),
            line: line.clone(),
        });
    }

    fn volume_status(&self, status: TrackStatus, bytes: u64, message: &str) {
        self.writer.send(TrackEvent::Volume {
            request_id: self.request_id.clone(),
            status,
            bytes,
            message: message.to_string(),
        });
    }

    fn request_status(&self, _message: &str) {
        self.writer.send(TrackEvent::End {
            request_id: self.request_id.clone(),
        });
    }
}
