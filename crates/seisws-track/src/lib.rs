//! Request tracking for the seisws services.
//!
//! Every request gets one tracker (usually a [`TrackerList`] fanning out to
//! several sinks). Delivery reports one line per requested stream, one
//! volume status for the whole response, and a final request status.
//!
//! | Sink | Destination |
//! |------|-------------|
//! | [`NoopTracker`] | nowhere |
//! | [`RequestLogTracker`] | one JSON line on the `seisws::reqlog` tracing target |
//! | [`DbTracker`] | `request_log` and `request_log_lines` tables |

mod error;
mod reqlog;
mod status;
mod store;

pub use error::TrackError;
pub use reqlog::{user_id_hash, RequestLogTracker};
pub use status::{LineStatus, ParseTrackStatusError, RequestInfo, TrackStatus};
pub use store::{spawn_db_writer, DbTrackWriter, DbTracker};

use std::sync::Arc;

/// Receives outcome events for a single request.
pub trait TrackingSink: Send + Sync {
    fn line_status(&self, line: &LineStatus);
    fn volume_status(&self, status: TrackStatus, bytes: u64, message: &str);
    /// Called once when the request is over, whatever its outcome.
    fn request_status(&self, message: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracker;

impl TrackingSink for NoopTracker {
    fn line_status(&self, _line: &LineStatus) {}
    fn volume_status(&self, _status: TrackStatus, _bytes: u64, _message: &str) {}
    fn request_status(&self, _message: &str) {}
}

/// Forwards every event to each contained sink in order.
#[derive(Default, Clone)]
pub struct TrackerList {
    sinks: Vec<Arc<dyn TrackingSink>>,
}

impl TrackerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: Arc<dyn TrackingSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Reports a terminal volume status and closes the request in one go.
    pub fn finish(&self, status: TrackStatus, bytes: u64, message: &str) {
        self.volume_status(status, bytes, message);
        self.request_status("END");
    }
}

impl TrackingSink for TrackerList {
    fn line_status(&self, line: &LineStatus) {
        for sink in &self.sinks {
            sink.line_status(line);
        }
    }

    fn volume_status(&self, status: TrackStatus, bytes: u64, message: &str) {
        for sink in &self.sinks {
            sink.volume_status(status, bytes, message);
        }
    }

    fn request_status(&self, message: &str) {
        for sink in &self.sinks {
            sink.request_status(message);
        }
    }
}
