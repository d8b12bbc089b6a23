//! Time instants, windows, and their text forms.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::ServiceError;

/// UTC instant with microsecond precision.
pub type Time = DateTime<Utc>;

/// Earliest instant a delivery window may start at (1970-01-01T00:00:00.000001).
pub fn min_time() -> Time {
    DateTime::<Utc>::from_timestamp_micros(1).unwrap_or_default()
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y,%m,%d,%H,%M,%S",
];

/// Parses the ISO 8601 subset accepted by the FDSN web services.
///
/// A trailing `Z` is optional, the fractional part may carry up to six
/// digits, and a bare date means midnight.
pub fn parse_time(value: &str) -> Option<Time> {
    let value = value.trim();
    let value = value.strip_suffix('Z').unwrap_or(value);

    for fmt in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Formats an instant as `YYYY-MM-DDTHH:MM:SS[.ffffff]Z`.
pub fn format_time(time: &Time, micros: bool) -> String {
    if micros {
        time.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
    } else {
        time.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }
}

/// Signed distance `to - from` in fractional seconds.
pub fn seconds_between(from: &Time, to: &Time) -> f64 {
    let delta = *to - *from;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => delta.num_milliseconds() as f64 / 1_000.0,
    }
}

/// A time window that may be open on either side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: Option<Time>,
    pub end: Option<Time>,
}

impl TimeWindow {
    /// Builds a window, rejecting `start >= end` when both bounds are set.
    pub fn new(start: Option<Time>, end: Option<Time>) -> Result<Self, ServiceError> {
        if let (Some(s), Some(e)) = (start, end) {
            if s >= e {
                return Err(ServiceError::invalid(format!(
                    "start time {} is not before end time {}",
                    format_time(&s, true),
                    format_time(&e, true)
                )));
            }
        }
        Ok(Self { start, end })
    }

    /// A window with no bounds.
    pub fn open() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// Whether the span `[start, end]` intersects this window.
    ///
    /// A span touching the window start is included, one starting exactly
    /// at the window end is not.
    pub fn overlaps(&self, start: &Time, end: &Time) -> bool {
        self.start.map_or(true, |s| *end >= s) && self.end.map_or(true, |e| *start < e)
    }

    /// Intersects the span `[start, end]` with this window.
    pub fn clamp(&self, start: Time, end: Time) -> (Time, Time) {
        let start = match self.start {
            Some(s) if s > start => s,
            _ => start,
        };
        let end = match self.end {
            Some(e) if e < end => e,
            _ => end,
        };
        (start, end)
    }
}
