//! Typed request options for the availability and dataselect services.
//!
//! Requests arrive either as GET query pairs (a single stream filter) or as
//! a POST body: `key=value` lines followed by one
//! `NET STA LOC CHA START END` line per filter.

use std::fmt;
use std::str::FromStr;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::pattern::{normalize_location, ChannelFilter};
use crate::time::{min_time, parse_time, Time, TimeWindow};
use crate::{ServiceError, StreamId};

/// The endpoint a request was addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Service {
    AvailabilityExtent,
    AvailabilityQuery,
    DataSelect,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AvailabilityExtent => "availability-extent",
            Self::AvailabilityQuery => "availability-query",
            Self::DataSelect => "fdsnws-dataselect",
        }
    }

    pub fn is_availability(&self) -> bool {
        !matches!(self, Self::DataSelect)
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One channel selection paired with its time window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFilter {
    pub channel: ChannelFilter,
    pub time: TimeWindow,
}

impl StreamFilter {
    /// Whether `id` over `[start, end]` falls under this filter.
    pub fn matches(&self, id: &StreamId, start: &Time, end: &Time) -> bool {
        self.channel.matches(id) && self.time.overlaps(start, end)
    }
}

/// Independent merge switches for availability output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeOptions {
    pub by_quality: bool,
    pub by_sample_rate: bool,
    pub overlap: bool,
    /// Largest gap in seconds still bridged when merging segments.
    pub gap_threshold: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderBy {
    #[default]
    NslcTimeQualitySampleRate,
    TimeSpanCount,
    TimeSpanCountDesc,
    LatestUpdate,
    LatestUpdateDesc,
}

impl OrderBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NslcTimeQualitySampleRate => "nslc_time_quality_samplerate",
            Self::TimeSpanCount => "timespancount",
            Self::TimeSpanCountDesc => "timespancount_desc",
            Self::LatestUpdate => "latestupdate",
            Self::LatestUpdateDesc => "latestupdate_desc",
        }
    }
}

impl FromStr for OrderBy {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nslc_time_quality_samplerate" => Ok(Self::NslcTimeQualitySampleRate),
            "timespancount" => Ok(Self::TimeSpanCount),
            "timespancount_desc" => Ok(Self::TimeSpanCountDesc),
            "latestupdate" => Ok(Self::LatestUpdate),
            "latestupdate_desc" => Ok(Self::LatestUpdateDesc),
            other => Err(ServiceError::invalid(format!("unknown orderby value: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputFormat {
    Text,
    GeoCsv,
    Json,
    Request,
    MiniSeed,
}

impl OutputFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Text | Self::Request => "text/plain; charset=utf-8",
            Self::GeoCsv => "text/csv; charset=utf-8",
            Self::Json => "application/json; charset=utf-8",
            Self::MiniSeed => "application/vnd.fdsn.mseed",
        }
    }

    fn parse_for(service: Service, value: &str) -> Option<Self> {
        let value = value.to_ascii_lowercase();
        match (service, value.as_str()) {
            (Service::DataSelect, "miniseed" | "mseed") => Some(Self::MiniSeed),
            (Service::DataSelect, _) => None,
            (_, "text") => Some(Self::Text),
            (_, "geocsv") => Some(Self::GeoCsv),
            (_, "json") => Some(Self::Json),
            (_, "request") => Some(Self::Request),
            _ => None,
        }
    }
}

/// Status reported when a request matches nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NoDataStatus {
    #[default]
    NoContent,
    NotFound,
}

impl NoDataStatus {
    pub fn code(&self) -> u16 {
        match self {
            Self::NoContent => 204,
            Self::NotFound => 404,
        }
    }
}

/// Parsed, validated form of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
    pub service: Service,
    pub streams: Vec<StreamFilter>,
    /// Accepted quality codes; `None` accepts all.
    pub quality: Option<Vec<String>>,
    pub merge: MergeOptions,
    pub order_by: OrderBy,
    pub format: OutputFormat,
    pub limit: Option<u64>,
    pub include_restricted: bool,
    pub exclude_too_large: bool,
    pub show_latest_update: bool,
    pub no_data: NoDataStatus,
    /// Wall-clock time the request was received.
    pub access_time: Time,
}

const DATASELECT_QUALITIES: &[&str] = &["B", "D", "M", "Q", "R"];

fn canonical_key(key: &str) -> Option<&'static str> {
    Some(match key.to_ascii_lowercase().as_str() {
        "starttime" | "start" => "starttime",
        "endtime" | "end" => "endtime",
        "network" | "net" => "network",
        "station" | "sta" => "station",
        "location" | "loc" => "location",
        "channel" | "cha" => "channel",
        "format" => "format",
        "nodata" => "nodata",
        "quality" => "quality",
        "merge" => "merge",
        "orderby" => "orderby",
        "limit" => "limit",
        "includerestricted" => "includerestricted",
        "mergegaps" => "mergegaps",
        "show" => "show",
        "excludetoolarge" => "excludetoolarge",
        "minimumlength" => "minimumlength",
        "longestonly" => "longestonly",
        _ => return None,
    })
}

fn is_selection_key(key: &str) -> bool {
    matches!(
        key,
        "starttime" | "endtime" | "network" | "station" | "location" | "channel"
    )
}

fn service_accepts(service: Service, key: &str) -> bool {
    match key {
        "starttime" | "endtime" | "network" | "station" | "location" | "channel" | "format"
        | "nodata" | "quality" => true,
        "merge" | "orderby" | "limit" | "includerestricted" => service.is_availability(),
        "mergegaps" | "show" | "excludetoolarge" => service == Service::AvailabilityQuery,
        "minimumlength" | "longestonly" => service == Service::DataSelect,
        _ => false,
    }
}

fn invalid_value(key: &str) -> ServiceError {
    ServiceError::invalid(format!("invalid value in parameter: {key}"))
}

/// Collected `key=value` pairs under their canonical names.
#[derive(Debug, Default)]
struct Params {
    values: Vec<(&'static str, String)>,
}

impl Params {
    fn push(
        &mut self,
        service: Service,
        key: &str,
        value: &str,
        post: bool,
    ) -> Result<(), ServiceError> {
        let canonical = canonical_key(key.trim())
            .filter(|k| service_accepts(service, k))
            .filter(|k| !(post && is_selection_key(k)))
            .ok_or_else(|| ServiceError::invalid(format!("invalid parameter: {}", key.trim())))?;
        self.values.push((canonical, value.trim().to_string()));
        Ok(())
    }

    fn first(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    fn contains(&self, key: &str) -> bool {
        self.values.iter().any(|(k, _)| *k == key)
    }

    /// Comma-separated values across every occurrence of `key`.
    fn list(&self, key: &str) -> Option<Vec<String>> {
        if !self.contains(key) {
            return None;
        }
        Some(
            self.values
                .iter()
                .filter(|(k, _)| *k == key)
                .flat_map(|(_, v)| v.split(','))
                .map(|v| v.trim().to_string())
                .collect(),
        )
    }

    fn bool(&self, key: &str) -> Result<Option<bool>, ServiceError> {
        match self.first(key).map(str::to_ascii_lowercase).as_deref() {
            None => Ok(None),
            Some("true") | Some("1") => Ok(Some(true)),
            Some("false") | Some("0") => Ok(Some(false)),
            Some(_) => Err(invalid_value(key)),
        }
    }

    fn time(&self, key: &str) -> Result<Option<Time>, ServiceError> {
        match self.first(key) {
            None => Ok(None),
            Some(v) => parse_time(v).map(Some).ok_or_else(|| invalid_value(key)),
        }
    }
}

fn valid_code(pattern: &str, location: bool) -> bool {
    if pattern.is_empty() {
        return location;
    }
    pattern
        .bytes()
        .all(|c| c.is_ascii_alphanumeric() || c == b'*' || c == b'?')
}

fn parse_codes(params: &Params, key: &str) -> Result<Option<Vec<String>>, ServiceError> {
    let location = key == "location";
    let Some(list) = params.list(key) else {
        return Ok(None);
    };
    let mut codes = Vec::with_capacity(list.len());
    for raw in list {
        let code = if location {
            normalize_location(&raw)
        } else {
            raw
        };
        if !valid_code(&code, location) {
            return Err(invalid_value(key));
        }
        codes.push(code);
    }
    Ok(Some(codes))
}

fn parse_post_line(line: &str, number: usize) -> Result<StreamFilter, ServiceError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let [net, sta, loc, cha, start, end] = fields.as_slice() else {
        return Err(ServiceError::invalid(format!(
            "invalid selection on line {number}: expected NET STA LOC CHA START END"
        )));
    };

    for (code, location) in [(net, false), (sta, false), (loc, true), (cha, false)] {
        if !valid_code(&normalize_location(code), location) {
            return Err(ServiceError::invalid(format!(
                "invalid stream code on line {number}: {code}"
            )));
        }
    }

    let bound = |value: &str| -> Result<Option<Time>, ServiceError> {
        if value == "*" {
            return Ok(None);
        }
        parse_time(value)
            .map(Some)
            .ok_or_else(|| ServiceError::invalid(format!("invalid time on line {number}: {value}")))
    };

    Ok(StreamFilter {
        channel: ChannelFilter::single(net, sta, loc, cha),
        time: TimeWindow::new(bound(*start)?, bound(*end)?)?,
    })
}

impl RequestOptions {
    fn defaults(service: Service) -> Self {
        Self {
            service,
            streams: Vec::new(),
            quality: None,
            merge: MergeOptions::default(),
            order_by: OrderBy::default(),
            format: if service == Service::DataSelect {
                OutputFormat::MiniSeed
            } else {
                OutputFormat::Text
            },
            limit: None,
            include_restricted: false,
            exclude_too_large: true,
            show_latest_update: service == Service::AvailabilityExtent,
            no_data: NoDataStatus::default(),
            access_time: Utc::now(),
        }
    }

    /// Parses a GET request. The query carries exactly one stream filter.
    pub fn from_query<K, V>(service: Service, pairs: &[(K, V)]) -> Result<Self, ServiceError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut params = Params::default();
        for (key, value) in pairs {
            params.push(service, key.as_ref(), value.as_ref(), false)?;
        }

        let has_selection = ["network", "station", "location", "channel"]
            .iter()
            .any(|k| params.contains(k));
        let filter = StreamFilter {
            channel: ChannelFilter {
                network: parse_codes(&params, "network")?,
                station: parse_codes(&params, "station")?,
                location: parse_codes(&params, "location")?,
                channel: parse_codes(&params, "channel")?,
            },
            time: TimeWindow::new(params.time("starttime")?, params.time("endtime")?)?,
        };

        let mut options = Self::defaults(service);
        options.apply(&params)?;
        options.streams.push(filter);
        options.check_selection(has_selection)?;
        Ok(options)
    }

    /// Parses a POST body of option lines followed by selection lines.
    pub fn from_post(service: Service, body: &str) -> Result<Self, ServiceError> {
        let mut params = Params::default();
        let mut streams = Vec::new();

        for (idx, line) in body.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once('=') {
                Some((key, value)) if streams.is_empty() => {
                    params.push(service, key, value, true)?;
                }
                Some(_) => {
                    return Err(ServiceError::invalid(format!(
                        "parameter on line {} follows a selection",
                        idx + 1
                    )));
                }
                None => streams.push(parse_post_line(line, idx + 1)?),
            }
        }

        let mut options = Self::defaults(service);
        options.apply(&params)?;
        let has_selection = !streams.is_empty();
        options.streams = streams;
        options.check_selection(has_selection)?;
        Ok(options)
    }

    fn apply(&mut self, params: &Params) -> Result<(), ServiceError> {
        if let Some(value) = params.first("format") {
            self.format = OutputFormat::parse_for(self.service, value)
                .ok_or_else(|| invalid_value("format"))?;
        }

        match params.first("nodata") {
            None => {}
            Some("204") => self.no_data = NoDataStatus::NoContent,
            Some("404") => self.no_data = NoDataStatus::NotFound,
            Some(_) => return Err(invalid_value("nodata")),
        }

        if self.service == Service::DataSelect {
            return self.apply_dataselect(params);
        }

        if let Some(values) = params.list("quality") {
            let mut quality = Vec::new();
            for v in values {
                if v == "*" {
                    quality.clear();
                    break;
                }
                if v.len() != 1 || !v.bytes().all(|c| c.is_ascii_uppercase()) {
                    return Err(invalid_value("quality"));
                }
                quality.push(v);
            }
            self.quality = if quality.is_empty() {
                None
            } else {
                Some(quality)
            };
        }

        for v in params.list("merge").unwrap_or_default() {
            match v.to_ascii_lowercase().as_str() {
                "quality" => self.merge.by_quality = true,
                "samplerate" => self.merge.by_sample_rate = true,
                "overlap" if self.service == Service::AvailabilityQuery => {
                    self.merge.overlap = true
                }
                _ => return Err(invalid_value("merge")),
            }
        }

        if let Some(value) = params.first("orderby") {
            if self.service == Service::AvailabilityQuery {
                return Err(ServiceError::invalid("orderby not supported for query request"));
            }
            self.order_by = value.parse().map_err(|_| invalid_value("orderby"))?;
        }

        if let Some(value) = params.first("limit") {
            let limit: u64 = value.parse().map_err(|_| invalid_value("limit"))?;
            if limit == 0 {
                return Err(invalid_value("limit"));
            }
            self.limit = Some(limit);
        }

        self.include_restricted = params.bool("includerestricted")?.unwrap_or(false);

        if self.service == Service::AvailabilityQuery {
            if let Some(value) = params.first("mergegaps") {
                let gap: f64 = value.parse().map_err(|_| invalid_value("mergegaps"))?;
                if !gap.is_finite() || gap < 0.0 {
                    return Err(invalid_value("mergegaps"));
                }
                self.merge.gap_threshold = Some(gap);
            }

            for v in params.list("show").unwrap_or_default() {
                if v.to_ascii_lowercase() != "latestupdate" {
                    return Err(invalid_value("show"));
                }
                self.show_latest_update = true;
            }

            self.exclude_too_large = params.bool("excludetoolarge")?.unwrap_or(true);
        }

        Ok(())
    }

    fn apply_dataselect(&mut self, params: &Params) -> Result<(), ServiceError> {
        let quality = params
            .first("quality")
            .map(str::to_ascii_uppercase)
            .unwrap_or_else(|| "B".to_string());
        if !DATASELECT_QUALITIES.contains(&quality.as_str()) {
            return Err(invalid_value("quality"));
        }
        if quality != "B" && quality != "M" {
            return Err(ServiceError::invalid(
                "quality other than 'B' or 'M' not supported",
            ));
        }
        self.quality = Some(vec![quality]);

        if let Some(value) = params.first("minimumlength") {
            let length: f64 = value.parse().map_err(|_| invalid_value("minimumlength"))?;
            if !length.is_finite() || length < 0.0 {
                return Err(invalid_value("minimumlength"));
            }
            if length > 0.0 {
                return Err(ServiceError::invalid(
                    "enforcing of minimum record length not supported",
                ));
            }
        }

        if params.bool("longestonly")? == Some(true) {
            return Err(ServiceError::invalid(
                "limitation to longest segment not supported",
            ));
        }

        Ok(())
    }

    fn check_selection(&self, has_selection: bool) -> Result<(), ServiceError> {
        if self.service == Service::AvailabilityQuery && !has_selection {
            return Err(ServiceError::invalid("request contains no selections"));
        }
        if self.streams.is_empty() {
            return Err(ServiceError::invalid("request contains no selections"));
        }
        Ok(())
    }

    /// Restricts every filter window to `[min_time, access_time - realtime_gap]`
    /// and drops filters left empty.
    pub fn clamp_windows(&mut self, realtime_gap: Option<Duration>) {
        let max_end = match realtime_gap {
            Some(gap) => self.access_time - gap,
            None => self.access_time,
        };
        let min = min_time();

        for filter in &mut self.streams {
            let start = match filter.time.start {
                Some(s) if s >= min => s,
                _ => min,
            };
            let end = match filter.time.end {
                Some(e) if e <= max_end => e,
                _ => max_end,
            };
            filter.time = TimeWindow {
                start: Some(start),
                end: Some(end),
            };
        }

        self.streams
            .retain(|f| matches!((f.time.start, f.time.end), (Some(s), Some(e)) if s < e));
    }

    /// The request's window when it carries a single filter, otherwise open.
    pub fn single_window(&self) -> TimeWindow {
        match self.streams.as_slice() {
            [only] => only.time,
            _ => TimeWindow::open(),
        }
    }

    /// Whether any filter selects `id` over `[start, end]`.
    pub fn matches(&self, id: &StreamId, start: &Time, end: &Time) -> bool {
        self.streams.iter().any(|f| f.matches(id, start, end))
    }

    /// Whether `quality` passes the quality filter.
    pub fn accepts_quality(&self, quality: &str) -> bool {
        match &self.quality {
            None => true,
            Some(list) => list.iter().any(|q| q == quality),
        }
    }
}
