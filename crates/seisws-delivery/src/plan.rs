//! Turns a dataselect request into the ordered (stream, window) list the
//! pipeline delivers.

use std::collections::HashMap;

use seisws_access::{AccessControlList, Identity};
use seisws_availability::ExtentIndex;
use seisws_track::{LineStatus, TrackStatus, TrackingSink};
use seisws_types::{seconds_between, RequestOptions, ServiceError, StreamId, Time};

pub(crate) const NO_METADATA: &str = "no metadata found";

/// One stream window to deliver.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    /// Public stream code.
    pub stream: StreamId,
    /// Network code the archive stores the stream under.
    pub archive_network: String,
    pub start: Time,
    pub end: Time,
    pub restricted: bool,
}

impl StreamRequest {
    pub fn archive_stream(&self) -> StreamId {
        StreamId {
            network: self.archive_network.clone(),
            ..self.stream.clone()
        }
    }

    pub fn needs_rewrite(&self) -> bool {
        self.archive_network != self.stream.network
    }

    pub(crate) fn line(&self, status: TrackStatus, bytes: u64) -> LineStatus {
        LineStatus {
            stream: self.stream.clone(),
            start: self.start,
            end: self.end,
            restricted: self.restricted,
            status,
            bytes,
            message: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlanLimits {
    /// Sample budget in millions; `None` disables the check.
    pub samples_m: Option<f64>,
    /// Public network code to archive network code.
    pub archive_networks: HashMap<String, String>,
}

fn close(tracker: &dyn TrackingSink, status: TrackStatus, message: &str) {
    tracker.volume_status(status, 0, message);
    tracker.request_status("END");
}

/// Enumerates the stream windows selected by `options`, in filter order
/// and NSLC order within a filter.
///
/// `options` is expected to have its windows clamped already. Restricted
/// streams the caller may not read are reported `DENIED` to `tracker` and
/// left out. When the request is rejected the volume status is reported
/// before returning.
pub fn plan_streams(
    options: &RequestOptions,
    index: &ExtentIndex,
    identity: Option<&Identity>,
    acl: &AccessControlList,
    limits: &PlanLimits,
    tracker: &dyn TrackingSink,
) -> Result<Vec<StreamRequest>, ServiceError> {
    let mut planned = Vec::new();
    // None: nothing matched. Some(true): everything matched was denied.
    let mut forbidden: Option<bool> = None;
    let mut samples = 0.0;

    for filter in &options.streams {
        for entry in index.iter() {
            let extent = &entry.extent;
            if !filter.matches(&extent.stream, &extent.start, &extent.end) {
                continue;
            }
            let (start, end) = filter.time.clamp(extent.start, extent.end);
            if start >= end {
                continue;
            }
            let id = &extent.stream;
            let request = StreamRequest {
                stream: id.clone(),
                archive_network: limits
                    .archive_networks
                    .get(&id.network)
                    .cloned()
                    .unwrap_or_else(|| id.network.clone()),
                start,
                end,
                restricted: entry.restricted,
            };

            if entry.restricted {
                let allowed = identity.is_some_and(|identity| {
                    acl.authorize(
                        identity,
                        &id.network,
                        &id.station,
                        &id.location,
                        &id.channel,
                        &start,
                        &end,
                    )
                });
                if !allowed {
                    tracing::debug!(stream = %id, "restricted stream denied");
                    tracker.line_status(&request.line(TrackStatus::Denied, 0));
                    forbidden.get_or_insert(true);
                    continue;
                }
            }
            forbidden = Some(false);

            if let Some(limit) = limits.samples_m {
                // Without a rate the stream cannot be counted against the budget.
                let Some(rate) = extent.nominal_sample_rate() else {
                    tracing::warn!(stream = %id, "stream has no sample rate, skipping");
                    continue;
                };
                samples += (seconds_between(&start, &end) * rate).trunc();
                if samples > limit * 1_000_000.0 {
                    close(tracker, TrackStatus::Error, "sample limit exceeded");
                    return Err(ServiceError::OversizeRequest(format!(
                        "maximum number of {limit}M samples exceeded"
                    )));
                }
            }

            planned.push(request);
        }
    }

    match forbidden {
        Some(true) => {
            close(tracker, TrackStatus::Denied, "access denied");
            Err(ServiceError::AuthorizationDenied)
        }
        None => {
            close(tracker, TrackStatus::NoData, NO_METADATA);
            Err(ServiceError::EmptyResult(NO_METADATA.to_string()))
        }
        Some(false) => Ok(planned),
    }
}

/// Attachment name for a delivery started at `now`.
pub fn attachment_name(prefix: &str, now: &Time) -> String {
    format!(
        "{}.mseed",
        prefix.replace("%time", &now.format("%Y-%m-%dT%H:%M:%S").to_string())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use seisws_access::AccessRule;
    use seisws_availability::RestrictionPolicy;
    use seisws_types::{parse_time, ArchiveObject, AttributeExtent, Extent, Service};
    use std::sync::Mutex;

    fn t(s: &str) -> Time {
        parse_time(s).expect("valid time")
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl TrackingSink for Recorder {
        fn line_status(&self, line: &LineStatus) {
            self.0
                .lock()
                .expect("lock")
                .push(format!("line:{}:{}", line.stream, line.status));
        }
        fn volume_status(&self, status: TrackStatus, _bytes: u64, _message: &str) {
            self.0.lock().expect("lock").push(format!("volume:{status}"));
        }
        fn request_status(&self, message: &str) {
            self.0.lock().expect("lock").push(format!("request:{message}"));
        }
    }

    fn extent(id: i64, code: &str, rate: f64) -> [ArchiveObject; 2] {
        let stream = StreamId::parse(code).expect("valid stream");
        let (start, end) = (t("2021-01-01"), t("2021-01-03"));
        [
            ArchiveObject::Extent {
                id,
                extent: Extent {
                    stream,
                    start,
                    end,
                    updated: end,
                    segment_count: 1,
                    segment_overflow: false,
                    attributes: Vec::new(),
                },
            },
            ArchiveObject::AttributeExtent {
                extent_id: id,
                attribute: AttributeExtent {
                    quality: "D".to_string(),
                    sample_rate: rate,
                    start,
                    end,
                    updated: end,
                    segment_count: 1,
                },
            },
        ]
    }

    fn index() -> ExtentIndex {
        let objects: Vec<ArchiveObject> = [
            extent(1, "AM.R1..EHZ", 100.0),
            extent(2, "AM.R2..EHZ", 100.0),
            extent(3, "XX.S1..BHZ", 20.0),
            extent(4, "AM.R3..EHZ", 0.0),
        ]
        .into_iter()
        .flatten()
        .collect();
        ExtentIndex::build(
            objects,
            &RestrictionPolicy {
                open_streams: Some(
                    ["AM.R1..EHZ", "AM.R2..EHZ", "AM.R3..EHZ"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                ),
                allow_restricted: true,
            },
            t("2030-01-01"),
        )
    }

    fn options(query: &[(&str, &str)]) -> RequestOptions {
        let mut options =
            RequestOptions::from_query(Service::DataSelect, query).expect("valid options");
        options.clamp_windows(None);
        options
    }

    #[test]
    fn clamps_windows_to_extents_and_maps_networks() {
        let limits = PlanLimits {
            samples_m: None,
            archive_networks: HashMap::from([("AM".to_string(), "A1".to_string())]),
        };
        let planned = plan_streams(
            &options(&[
                ("net", "AM"),
                ("start", "2020-12-31T12:00:00"),
                ("end", "2021-01-02"),
            ]),
            &index(),
            None,
            &AccessControlList::default(),
            &limits,
            &Recorder::default(),
        )
        .expect("planned");

        let codes: Vec<_> = planned.iter().map(|r| r.stream.to_string()).collect();
        assert_eq!(codes, ["AM.R1..EHZ", "AM.R2..EHZ", "AM.R3..EHZ"]);
        assert_eq!(planned[0].start, t("2021-01-01"));
        assert_eq!(planned[0].end, t("2021-01-02"));
        assert_eq!(planned[0].archive_stream().to_string(), "A1.R1..EHZ");
        assert!(planned[0].needs_rewrite());
    }

    #[test]
    fn restricted_stream_denied_without_identity() {
        let recorder = Recorder::default();
        let err = plan_streams(
            &options(&[("net", "XX")]),
            &index(),
            None,
            &AccessControlList::default(),
            &PlanLimits::default(),
            &recorder,
        )
        .expect_err("denied");
        assert_eq!(err, ServiceError::AuthorizationDenied);
        assert_eq!(
            *recorder.0.lock().expect("lock"),
            ["line:XX.S1..BHZ:DENIED", "volume:DENIED", "request:END"]
        );

        let acl = AccessControlList::new([AccessRule::network("XX", "alice@example.org")]);
        let alice = Identity::with_email("alice@example.org");
        let planned = plan_streams(
            &options(&[("net", "XX")]),
            &index(),
            Some(&alice),
            &acl,
            &PlanLimits::default(),
            &Recorder::default(),
        )
        .expect("planned");
        assert_eq!(planned.len(), 1);
        assert!(planned[0].restricted);
    }

    #[test]
    fn one_allowed_stream_outweighs_denials() {
        let recorder = Recorder::default();
        let planned = plan_streams(
            &options(&[("net", "AM,XX")]),
            &index(),
            None,
            &AccessControlList::default(),
            &PlanLimits::default(),
            &recorder,
        )
        .expect("planned");
        assert_eq!(planned.len(), 2);
        assert_eq!(
            *recorder.0.lock().expect("lock"),
            ["line:XX.S1..BHZ:DENIED"]
        );
    }

    #[test]
    fn nothing_matched_is_no_metadata() {
        let recorder = Recorder::default();
        let err = plan_streams(
            &options(&[("net", "GE")]),
            &index(),
            None,
            &AccessControlList::default(),
            &PlanLimits::default(),
            &recorder,
        )
        .expect_err("empty");
        assert_eq!(err, ServiceError::EmptyResult("no metadata found".to_string()));
        assert_eq!(
            *recorder.0.lock().expect("lock"),
            ["volume:NODATA", "request:END"]
        );
    }

    #[test]
    fn sample_budget_rejects_whole_request() {
        // One day at 100 Hz is 8.64M samples per stream.
        let limits = PlanLimits {
            samples_m: Some(10.0),
            ..PlanLimits::default()
        };
        let opts = options(&[("net", "AM"), ("start", "2021-01-01"), ("end", "2021-01-02")]);
        let err = plan_streams(
            &opts,
            &index(),
            None,
            &AccessControlList::default(),
            &limits,
            &seisws_track::NoopTracker,
        )
        .expect_err("oversize");
        assert_eq!(
            err,
            ServiceError::OversizeRequest("maximum number of 10M samples exceeded".to_string())
        );

        let opts = options(&[("sta", "R1"), ("start", "2021-01-01"), ("end", "2021-01-02")]);
        assert!(plan_streams(
            &opts,
            &index(),
            None,
            &AccessControlList::default(),
            &limits,
            &seisws_track::NoopTracker,
        )
        .is_ok());
    }

    #[test]
    fn streams_without_rate_skip_only_under_a_budget() {
        let [bare, _] = extent(7, "GE.APE..BHZ", 0.0);
        let index = ExtentIndex::build(
            vec![bare],
            &RestrictionPolicy {
                open_streams: Some(["GE.APE..BHZ".to_string()].into_iter().collect()),
                allow_restricted: true,
            },
            t("2030-01-01"),
        );
        let opts = options(&[("net", "GE"), ("start", "2021-01-01"), ("end", "2021-01-02")]);

        let planned = plan_streams(
            &opts,
            &index,
            None,
            &AccessControlList::default(),
            &PlanLimits::default(),
            &seisws_track::NoopTracker,
        )
        .expect("planned");
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].stream.to_string(), "GE.APE..BHZ");

        let limits = PlanLimits {
            samples_m: Some(10.0),
            ..PlanLimits::default()
        };
        let planned = plan_streams(
            &opts,
            &index,
            None,
            &AccessControlList::default(),
            &limits,
            &seisws_track::NoopTracker,
        )
        .expect("planned");
        assert!(planned.is_empty());
    }

    #[test]
    fn attachment_name_substitutes_time() {
        assert_eq!(
            attachment_name("archive_%time", &t("2021-03-04T05:06:07.5")),
            "archive_2021-03-04T05:06:07.mseed"
        );
        assert_eq!(attachment_name("data", &t("2021-03-04")), "data.mseed");
    }
}
