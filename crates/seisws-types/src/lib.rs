//! Shared types, error definitions, and request parsing for seisws.
//!
//! This crate holds the data model every other seisws crate speaks:
//! stream identifiers, time windows, archive summaries (extents, attribute
//! extents, segments), the service-level error enum, and [`RequestOptions`],
//! the typed form of an inbound query.
//!
//! Nothing in here performs I/O. Parsing a request is synchronous and
//! never touches the archive.

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod options;
mod pattern;
mod time;

pub use options::{
    MergeOptions, NoDataStatus, OrderBy, OutputFormat, RequestOptions, Service, StreamFilter,
};
pub use pattern::{glob_match, ChannelFilter};
pub use time::{format_time, min_time, parse_time, seconds_between, Time, TimeWindow};

/// Errors surfaced to a client for a single request.
///
/// Every variant is scoped to the request that produced it. None of them
/// invalidates cached snapshots or affects concurrent requests.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ServiceError {
    /// Malformed input, unknown enum value, or incompatible options.
    #[error("{0}")]
    Validation(String),
    /// Candidates matched but the caller may not see any of them.
    #[error("access denied")]
    AuthorizationDenied,
    /// Nothing matched the request.
    #[error("{0}")]
    EmptyResult(String),
    /// An external collaborator (database, archive) failed.
    #[error("service unavailable: {0}")]
    SourceFailure(String),
    /// A budget or size pre-check failed.
    #[error("{0}")]
    OversizeRequest(String),
}

impl ServiceError {
    /// Shorthand for a [`ServiceError::Validation`] with a formatted message.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

/// Network, station, location, channel.
///
/// The derived ordering is the NSLC order used by every sorted listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
}

impl StreamId {
    pub fn new(
        network: impl Into<String>,
        station: impl Into<String>,
        location: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            network: network.into(),
            station: station.into(),
            location: location.into(),
            channel: channel.into(),
        }
    }

    /// Parses a dotted `NET.STA.LOC.CHA` code. The location may be empty.
    pub fn parse(code: &str) -> Option<Self> {
        let mut parts = code.split('.');
        let id = Self::new(parts.next()?, parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }
        Some(id)
    }

    /// Location code as printed in tabular output, `--` when empty.
    pub fn location_or_dashes(&self) -> &str {
        if self.location.is_empty() {
            "--"
        } else {
            &self.location
        }
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.network, self.station, self.location, self.channel
        )
    }
}

/// Opaque identifier the archive assigns to an extent.
pub type ExtentId = i64;

/// Summary of one stream's archived data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub stream: StreamId,
    pub start: Time,
    pub end: Time,
    pub updated: Time,
    pub segment_count: u64,
    /// The archive holds more segments for this stream than it can enumerate.
    pub segment_overflow: bool,
    /// Finer summaries keyed by (quality, sample rate).
    pub attributes: Vec<AttributeExtent>,
}

impl Extent {
    /// Highest sample rate seen in any attribute extent, if any.
    pub fn nominal_sample_rate(&self) -> Option<f64> {
        self.attributes
            .iter()
            .map(|a| a.sample_rate)
            .filter(|r| *r > 0.0)
            .fold(None, |acc: Option<f64>, r| Some(acc.map_or(r, |a| a.max(r))))
    }
}

/// Summary of one (quality, sample rate) combination under an [`Extent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeExtent {
    pub quality: String,
    pub sample_rate: f64,
    pub start: Time,
    pub end: Time,
    pub updated: Time,
    pub segment_count: u64,
}

/// A contiguous span of archived samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: Time,
    pub end: Time,
    pub updated: Time,
    pub quality: String,
    pub sample_rate: f64,
}

/// Heterogeneous archive rows, discriminated where they enter the system.
#[derive(Debug, Clone, PartialEq)]
pub enum ArchiveObject {
    Extent { id: ExtentId, extent: Extent },
    AttributeExtent {
        extent_id: ExtentId,
        attribute: AttributeExtent,
    },
    Segment { extent_id: ExtentId, segment: Segment },
}
