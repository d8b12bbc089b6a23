//! Outcome codes and the records they travel in.

use seisws_types::{StreamId, Time};
use serde::{Deserialize, Serialize};

/// Outcome of one stream line or of a whole response volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "NODATA")]
    NoData,
    #[serde(rename = "DENIED")]
    Denied,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl TrackStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::NoData => "NODATA",
            Self::Denied => "DENIED",
            Self::Error => "ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for TrackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TrackStatus {
    type Err = ParseTrackStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(Self::Ok),
            "NODATA" => Ok(Self::NoData),
            "DENIED" => Ok(Self::Denied),
            "ERROR" => Ok(Self::Error),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(ParseTrackStatusError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParseTrackStatusError(pub String);

impl std::fmt::Display for ParseTrackStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown tracking status: {}", self.0)
    }
}

impl std::error::Error for ParseTrackStatusError {}

/// Result for one requested (stream, window) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct LineStatus {
    pub stream: StreamId,
    pub start: Time,
    pub end: Time,
    pub restricted: bool,
    pub status: TrackStatus,
    pub bytes: u64,
    pub message: String,
}

/// Who asked for what, captured when the request arrives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestInfo {
    pub request_id: String,
    pub service: String,
    /// Authenticated user name, if any.
    pub user_name: Option<String>,
    pub client_ip: String,
    pub user_agent: String,
}
