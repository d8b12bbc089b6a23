//! Response bodies for availability rows.
//!
//! Formatters write nothing until the first row arrives, so an empty
//! result leaves the body empty and the caller can answer with the
//! configured no-data status instead.

use serde::Serialize;

use seisws_types::{
    format_time, ExtentId, OutputFormat, RequestOptions, Service, ServiceError, StreamId, Time,
    TimeWindow,
};

use crate::aggregate::ExtentRow;
use crate::merge::MergedSegment;

/// The fields every formatter reads from a row.
#[derive(Debug, Clone, Copy)]
pub struct Line<'a> {
    pub extent_id: ExtentId,
    pub stream: &'a StreamId,
    pub quality: &'a str,
    pub sample_rate: f64,
    pub start: &'a Time,
    pub end: &'a Time,
    pub updated: &'a Time,
    /// Only extent rows carry a segment count.
    pub segment_count: Option<u64>,
    pub restricted: bool,
}

pub trait AvailabilityRow {
    fn line(&self) -> Line<'_>;
}

impl AvailabilityRow for ExtentRow {
    fn line(&self) -> Line<'_> {
        Line {
            extent_id: self.entry.id,
            stream: &self.entry.extent.stream,
            quality: &self.attribute.quality,
            sample_rate: self.attribute.sample_rate,
            start: &self.attribute.start,
            end: &self.attribute.end,
            updated: &self.attribute.updated,
            segment_count: Some(self.attribute.segment_count),
            restricted: self.entry.restricted,
        }
    }
}

impl AvailabilityRow for MergedSegment {
    fn line(&self) -> Line<'_> {
        Line {
            extent_id: self.entry.id,
            stream: &self.entry.extent.stream,
            quality: &self.segment.quality,
            sample_rate: self.segment.sample_rate,
            start: &self.segment.start,
            end: &self.segment.end,
            updated: &self.segment.updated,
            segment_count: None,
            restricted: self.entry.restricted,
        }
    }
}

/// Renders rows incrementally into a text buffer.
pub trait RowFormatter: Send {
    fn write_row(&mut self, line: &Line<'_>, out: &mut String);

    /// Writes any trailer. Does nothing when no row was written.
    fn finish(&mut self, out: &mut String);
}

/// Optional columns, derived from the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Columns {
    quality: bool,
    sample_rate: bool,
    updated: bool,
    extent: bool,
}

impl Columns {
    fn new(options: &RequestOptions) -> Self {
        Self {
            quality: !options.merge.by_quality,
            sample_rate: !options.merge.by_sample_rate,
            updated: options.show_latest_update,
            extent: options.service == Service::AvailabilityExtent,
        }
    }
}

fn restriction(restricted: bool) -> &'static str {
    if restricted {
        "RESTRICTED"
    } else {
        "OPEN"
    }
}

/// Picks the formatter for the request's output format.
pub fn formatter_for(options: &RequestOptions) -> Result<Box<dyn RowFormatter>, ServiceError> {
    let columns = Columns::new(options);
    Ok(match options.format {
        OutputFormat::Text => Box::new(TextFormatter::new(columns)),
        OutputFormat::GeoCsv => Box::new(GeoCsvFormatter::new(columns)),
        OutputFormat::Request => Box::new(RequestFormatter::new(options.single_window())),
        OutputFormat::Json if columns.extent => {
            Box::new(JsonExtentFormatter::new(columns, options.access_time))
        }
        OutputFormat::Json => Box::new(JsonQueryFormatter::new(columns, options.access_time)),
        OutputFormat::MiniSeed => {
            return Err(ServiceError::invalid("miniseed is not an availability format"))
        }
    })
}

pub struct TextFormatter {
    columns: Columns,
    started: bool,
}

impl TextFormatter {
    fn new(columns: Columns) -> Self {
        Self {
            columns,
            started: false,
        }
    }

    fn header(&self) -> String {
        let c = &self.columns;
        let mut line = format!("{:<2}  {:<5}  {:<2}  {:<3}", "#N", "S", "L", "C");
        if c.quality {
            line.push_str(&format!("  {:<1}", "Q"));
        }
        if c.sample_rate {
            line.push_str(&format!("  {:>11}", "SampleRate"));
        }
        line.push_str(&format!("  {:<27}  {:<27}", "Earliest", "Latest"));
        if c.updated {
            line.push_str(&format!("  {:<20}", "Updated"));
        }
        if c.extent {
            line.push_str(&format!("  {:>10}", "TimeSpans"));
            line.push_str(&format!("  {:<11}", "Restriction"));
        }
        line.push('\n');
        line
    }
}

impl RowFormatter for TextFormatter {
    fn write_row(&mut self, line: &Line<'_>, out: &mut String) {
        if !self.started {
            self.started = true;
            out.push_str(&self.header());
        }
        let c = &self.columns;
        let id = line.stream;
        out.push_str(&format!(
            "{:<2}  {:<5}  {:<2}  {:<3}",
            id.network,
            id.station,
            id.location_or_dashes(),
            id.channel
        ));
        if c.quality {
            out.push_str(&format!("  {:<1}", line.quality));
        }
        if c.sample_rate {
            out.push_str(&format!("  {:>11.1}", line.sample_rate));
        }
        out.push_str(&format!(
            "  {:<27}  {:<27}",
            format_time(line.start, true),
            format_time(line.end, true)
        ));
        if c.updated {
            out.push_str(&format!("  {:<20}", format_time(line.updated, false)));
        }
        if c.extent {
            out.push_str(&format!("  {:>10}", line.segment_count.unwrap_or_default()));
            out.push_str(&format!("  {:<11}", restriction(line.restricted)));
        }
        out.push('\n');
    }

    fn finish(&mut self, _out: &mut String) {}
}

pub struct GeoCsvFormatter {
    columns: Columns,
    started: bool,
}

impl GeoCsvFormatter {
    fn new(columns: Columns) -> Self {
        Self {
            columns,
            started: false,
        }
    }

    fn header(&self) -> String {
        let c = &self.columns;
        let mut units = vec!["unitless"; 4];
        let mut types = vec!["string"; 4];
        let mut names = vec!["Network", "Station", "Location", "Channel"];
        let mut add = |unit, kind, name| {
            units.push(unit);
            types.push(kind);
            names.push(name);
        };
        if c.quality {
            add("unitless", "string", "Quality");
        }
        if c.sample_rate {
            add("hertz", "float", "SampleRate");
        }
        add("ISO_8601", "datetime", "Earliest");
        add("ISO_8601", "datetime", "Latest");
        if c.updated {
            add("ISO_8601", "datetime", "Updated");
        }
        if c.extent {
            add("unitless", "integer", "TimeSpans");
            add("unitless", "string", "Restriction");
        }
        format!(
            "#dataset: GeoCSV 2.0\n#delimiter: |\n#field_unit: {}\n#field_type: {}\n{}\n",
            units.join("|"),
            types.join("|"),
            names.join("|")
        )
    }
}

impl RowFormatter for GeoCsvFormatter {
    fn write_row(&mut self, line: &Line<'_>, out: &mut String) {
        if !self.started {
            self.started = true;
            out.push_str(&self.header());
        }
        let c = &self.columns;
        let id = line.stream;
        out.push_str(&format!(
            "{}|{}|{}|{}",
            id.network, id.station, id.location, id.channel
        ));
        if c.quality {
            out.push_str(&format!("|{}", line.quality));
        }
        if c.sample_rate {
            out.push_str(&format!("|{:.1}", line.sample_rate));
        }
        out.push_str(&format!(
            "|{}|{}",
            format_time(line.start, true),
            format_time(line.end, true)
        ));
        if c.updated {
            out.push_str(&format!("|{}", format_time(line.updated, false)));
        }
        if c.extent {
            out.push_str(&format!(
                "|{}|{}",
                line.segment_count.unwrap_or_default(),
                restriction(line.restricted)
            ));
        }
        out.push('\n');
    }

    fn finish(&mut self, _out: &mut String) {}
}

/// One `NET STA LOC CHA START END` line per row, ready to post to
/// dataselect. Spans are cut to the request window.
pub struct RequestFormatter {
    window: TimeWindow,
}

impl RequestFormatter {
    fn new(window: TimeWindow) -> Self {
        Self { window }
    }
}

impl RowFormatter for RequestFormatter {
    fn write_row(&mut self, line: &Line<'_>, out: &mut String) {
        let (start, end) = self.window.clamp(*line.start, *line.end);
        let id = line.stream;
        out.push_str(&format!(
            "{} {} {} {} {} {}\n",
            id.network,
            id.station,
            id.location_or_dashes(),
            id.channel,
            format_time(&start, true),
            format_time(&end, true)
        ));
    }

    fn finish(&mut self, _out: &mut String) {}
}

fn json_header(created: &Time) -> String {
    format!(
        "{{\"created\":\"{}\",\"version\":1.0,\"datasources\":[",
        format_time(created, false)
    )
}

const JSON_FOOTER: &str = "]}";

fn push_json<T: Serialize>(value: &T, out: &mut String) {
    match serde_json::to_string(value) {
        Ok(json) => out.push_str(&json),
        Err(err) => tracing::error!(error = %err, "failed to serialize availability row"),
    }
}

#[derive(Serialize)]
struct JsonExtent<'a> {
    network: &'a str,
    station: &'a str,
    location: &'a str,
    channel: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    quality: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    samplerate: Option<f64>,
    earliest: String,
    latest: String,
    #[serde(rename = "timespanCount")]
    timespan_count: u64,
    updated: String,
    restriction: &'static str,
}

/// One flat object per extent row.
pub struct JsonExtentFormatter {
    columns: Columns,
    created: Time,
    rows: u64,
}

impl JsonExtentFormatter {
    fn new(columns: Columns, created: Time) -> Self {
        Self {
            columns,
            created,
            rows: 0,
        }
    }
}

impl RowFormatter for JsonExtentFormatter {
    fn write_row(&mut self, line: &Line<'_>, out: &mut String) {
        if self.rows == 0 {
            out.push_str(&json_header(&self.created));
        } else {
            out.push(',');
        }
        self.rows += 1;

        let id = line.stream;
        push_json(
            &JsonExtent {
                network: &id.network,
                station: &id.station,
                location: &id.location,
                channel: &id.channel,
                quality: self.columns.quality.then_some(line.quality),
                samplerate: self.columns.sample_rate.then_some(line.sample_rate),
                earliest: format_time(line.start, true),
                latest: format_time(line.end, true),
                timespan_count: line.segment_count.unwrap_or_default(),
                updated: format_time(line.updated, false),
                restriction: restriction(line.restricted),
            },
            out,
        );
    }

    fn finish(&mut self, out: &mut String) {
        if self.rows > 0 {
            out.push_str(JSON_FOOTER);
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonChannel {
    network: String,
    station: String,
    location: String,
    channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    quality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    samplerate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    updated: Option<String>,
    timespans: Vec<[String; 2]>,
}

#[derive(Debug)]
struct SpanGroup {
    quality: Option<String>,
    sample_rate: Option<f64>,
    updated: Time,
    spans: Vec<[String; 2]>,
}

/// Groups consecutive rows of one stream into channel objects, one per
/// distinct unmerged (quality, sample rate), in first-seen order.
pub struct JsonQueryFormatter {
    columns: Columns,
    created: Time,
    started: bool,
    current: Option<(ExtentId, StreamId)>,
    groups: Vec<SpanGroup>,
}

impl JsonQueryFormatter {
    fn new(columns: Columns, created: Time) -> Self {
        Self {
            columns,
            created,
            started: false,
            current: None,
            groups: Vec::new(),
        }
    }

    fn flush(&mut self, out: &mut String) {
        let Some((_, id)) = self.current.take() else {
            return;
        };
        for group in self.groups.drain(..) {
            if self.started {
                out.push(',');
            } else {
                out.push_str(&json_header(&self.created));
                self.started = true;
            }
            push_json(
                &JsonChannel {
                    network: id.network.clone(),
                    station: id.station.clone(),
                    location: id.location.clone(),
                    channel: id.channel.clone(),
                    quality: group.quality,
                    samplerate: group.sample_rate,
                    updated: self
                        .columns
                        .updated
                        .then(|| format_time(&group.updated, false)),
                    timespans: group.spans,
                },
                out,
            );
        }
    }
}

impl RowFormatter for JsonQueryFormatter {
    fn write_row(&mut self, line: &Line<'_>, out: &mut String) {
        if self.current.as_ref().map(|(id, _)| *id) != Some(line.extent_id) {
            self.flush(out);
            self.current = Some((line.extent_id, line.stream.clone()));
        }

        let quality = self.columns.quality.then(|| line.quality.to_string());
        let sample_rate = self.columns.sample_rate.then_some(line.sample_rate);
        let span = [format_time(line.start, true), format_time(line.end, true)];

        match self
            .groups
            .iter_mut()
            .find(|g| g.quality == quality && g.sample_rate == sample_rate)
        {
            Some(group) => {
                if *line.updated > group.updated {
                    group.updated = *line.updated;
                }
                group.spans.push(span);
            }
            None => self.groups.push(SpanGroup {
                quality,
                sample_rate,
                updated: *line.updated,
                spans: vec![span],
            }),
        }
    }

    fn finish(&mut self, out: &mut String) {
        self.flush(out);
        if self.started {
            out.push_str(JSON_FOOTER);
        }
    }
}

/// Formats a complete row set in one go.
pub fn render<R: AvailabilityRow>(
    options: &RequestOptions,
    rows: &[R],
) -> Result<String, ServiceError> {
    let mut formatter = formatter_for(options)?;
    let mut out = String::new();
    for row in rows {
        formatter.write_row(&row.line(), &mut out);
    }
    formatter.finish(&mut out);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexedExtent;
    use seisws_types::{parse_time, AttributeExtent, Extent, Segment};
    use std::sync::Arc;

    fn t(s: &str) -> Time {
        parse_time(s).expect("valid time")
    }

    fn entry(id: ExtentId, loc: &str, restricted: bool) -> Arc<IndexedExtent> {
        Arc::new(IndexedExtent {
            id,
            extent: Extent {
                stream: StreamId::new("AM", "R1234", loc, "EHZ"),
                start: t("2021-01-01"),
                end: t("2021-02-01"),
                updated: t("2021-02-01"),
                segment_count: 3,
                segment_overflow: false,
                attributes: Vec::new(),
            },
            restricted,
        })
    }

    fn extent_row(restricted: bool) -> ExtentRow {
        ExtentRow {
            entry: entry(1, "", restricted),
            attribute: AttributeExtent {
                quality: "D".to_string(),
                sample_rate: 100.0,
                start: t("2021-01-01T00:00:00"),
                end: t("2021-01-31T12:00:00.5"),
                updated: t("2021-02-01T03:04:05.678"),
                segment_count: 3,
            },
        }
    }

    fn segment_row(entry: &Arc<IndexedExtent>, start: &str, end: &str, quality: &str) -> MergedSegment {
        MergedSegment {
            entry: Arc::clone(entry),
            segment: Segment {
                start: t(start),
                end: t(end),
                updated: t(end),
                quality: quality.to_string(),
                sample_rate: 100.0,
            },
        }
    }

    fn extent_options(query: &[(&str, &str)]) -> RequestOptions {
        RequestOptions::from_query(Service::AvailabilityExtent, query).expect("valid options")
    }

    fn query_options(query: &[(&str, &str)]) -> RequestOptions {
        let mut all = vec![("net", "AM")];
        all.extend_from_slice(query);
        RequestOptions::from_query(Service::AvailabilityQuery, &all).expect("valid options")
    }

    #[test]
    fn text_extent_layout() {
        let out = render(&extent_options(&[]), &[extent_row(false)]).expect("render");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines[0],
            "#N  S      L   C    Q   SampleRate  Earliest                     Latest                       \
             Updated                TimeSpans  Restriction"
        );
        assert_eq!(
            lines[1],
            "AM  R1234  --  EHZ  D        100.0  2021-01-01T00:00:00.000000Z  2021-01-31T12:00:00.500000Z  \
             2021-02-01T03:04:05Z           3  OPEN       "
        );
    }

    #[test]
    fn text_query_drops_merged_columns() {
        let e = entry(1, "00", false);
        let options = query_options(&[("merge", "quality,samplerate")]);
        let out = render(
            &options,
            &[segment_row(&e, "2021-01-01T00:00:00", "2021-01-01T01:00:00", "D")],
        )
        .expect("render");
        assert_eq!(
            out,
            "#N  S      L   C    Earliest                     Latest                     \n\
             AM  R1234  00  EHZ  2021-01-01T00:00:00.000000Z  2021-01-01T01:00:00.000000Z\n"
        );
    }

    #[test]
    fn geocsv_header_and_row() {
        let out = render(&extent_options(&[]), &[extent_row(true)]).expect("render");
        let mut options = extent_options(&[]);
        options.format = OutputFormat::GeoCsv;
        let csv = render(&options, &[extent_row(true)]).expect("render");
        assert_ne!(out, csv);

        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "#dataset: GeoCSV 2.0");
        assert_eq!(lines[1], "#delimiter: |");
        assert_eq!(
            lines[2],
            "#field_unit: unitless|unitless|unitless|unitless|unitless|hertz|ISO_8601|ISO_8601|ISO_8601|unitless|unitless"
        );
        assert_eq!(
            lines[4],
            "Network|Station|Location|Channel|Quality|SampleRate|Earliest|Latest|Updated|TimeSpans|Restriction"
        );
        assert_eq!(
            lines[5],
            "AM|R1234||EHZ|D|100.0|2021-01-01T00:00:00.000000Z|2021-01-31T12:00:00.500000Z|2021-02-01T03:04:05Z|3|RESTRICTED"
        );
    }

    #[test]
    fn request_format_clamps_to_window() {
        let e = entry(1, "", false);
        let options = query_options(&[
            ("format", "request"),
            ("start", "2021-01-01T00:30:00"),
        ]);
        let out = render(
            &options,
            &[segment_row(&e, "2021-01-01T00:00:00", "2021-01-01T01:00:00", "D")],
        )
        .expect("render");
        assert_eq!(
            out,
            "AM R1234 -- EHZ 2021-01-01T00:30:00.000000Z 2021-01-01T01:00:00.000000Z\n"
        );
    }

    #[test]
    fn json_extent_objects_are_flat() {
        let options = extent_options(&[("format", "json"), ("merge", "samplerate")]);
        let out = render(&options, &[extent_row(false)]).expect("render");
        let doc: serde_json::Value = serde_json::from_str(&out).expect("valid json");

        assert_eq!(doc["version"], 1.0);
        let ds = &doc["datasources"][0];
        assert_eq!(ds["network"], "AM");
        assert_eq!(ds["location"], "");
        assert_eq!(ds["quality"], "D");
        assert!(ds.get("samplerate").is_none());
        assert_eq!(ds["timespanCount"], 3);
        assert_eq!(ds["restriction"], "OPEN");
        assert_eq!(ds["updated"], "2021-02-01T03:04:05Z");
    }

    #[test]
    fn json_query_groups_spans_per_quality() {
        let a = entry(1, "", false);
        let b = entry(2, "00", false);
        let options = query_options(&[("format", "json"), ("show", "latestupdate")]);
        let rows = [
            segment_row(&a, "2021-01-01T00:00:00", "2021-01-01T01:00:00", "D"),
            segment_row(&a, "2021-01-01T01:00:00", "2021-01-01T02:00:00", "M"),
            segment_row(&a, "2021-01-01T03:00:00", "2021-01-01T04:00:00", "D"),
            segment_row(&b, "2021-01-01T00:00:00", "2021-01-01T01:00:00", "D"),
        ];
        let out = render(&options, &rows).expect("render");
        let doc: serde_json::Value = serde_json::from_str(&out).expect("valid json");
        let sources = doc["datasources"].as_array().expect("array");

        assert_eq!(sources.len(), 3);
        assert_eq!(sources[0]["quality"], "D");
        assert_eq!(sources[0]["samplerate"], 100.0);
        assert_eq!(sources[0]["timespans"].as_array().map(Vec::len), Some(2));
        assert_eq!(sources[0]["updated"], "2021-01-01T04:00:00Z");
        assert_eq!(sources[1]["quality"], "M");
        assert_eq!(sources[2]["location"], "00");
        assert!(out.contains("\"samplerate\":100.0"));
    }

    #[test]
    fn empty_result_writes_nothing() {
        let options = query_options(&[("format", "json")]);
        let out = render::<MergedSegment>(&options, &[]).expect("render");
        assert!(out.is_empty());
    }

    #[test]
    fn miniseed_is_not_an_availability_format() {
        let mut options = extent_options(&[]);
        options.format = OutputFormat::MiniSeed;
        assert!(formatter_for(&options).is_err());
    }
}
