//! Extent listing: attribute extents folded per stream, sorted and limited.

use std::cmp::Ordering;
use std::sync::Arc;

use seisws_types::{AttributeExtent, MergeOptions, OrderBy, RequestOptions};

use crate::index::IndexedExtent;

/// One line of an extent listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtentRow {
    pub entry: Arc<IndexedExtent>,
    pub attribute: AttributeExtent,
}

impl ExtentRow {
    pub fn restricted(&self) -> bool {
        self.entry.restricted
    }
}

/// Which attribute fields separate rows of the same stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKey {
    /// Every attribute extent is its own row.
    None,
    /// Rows per quality, sample rates merged.
    Quality,
    /// Rows per sample rate, qualities merged.
    SampleRate,
    /// One row per stream.
    Both,
}

impl GroupKey {
    pub fn from_merge(merge: &MergeOptions) -> Self {
        match (merge.by_quality, merge.by_sample_rate) {
            (false, false) => Self::None,
            (true, false) => Self::SampleRate,
            (false, true) => Self::Quality,
            (true, true) => Self::Both,
        }
    }

    fn same_group(&self, a: &AttributeExtent, b: &AttributeExtent) -> bool {
        match self {
            Self::None => false,
            Self::Quality => a.quality == b.quality,
            Self::SampleRate => a.sample_rate == b.sample_rate,
            Self::Both => true,
        }
    }
}

fn absorb(into: &mut AttributeExtent, other: &AttributeExtent) {
    if other.start < into.start {
        into.start = other.start;
    }
    if other.end > into.end {
        into.end = other.end;
    }
    if other.updated > into.updated {
        into.updated = other.updated;
    }
    into.segment_count += other.segment_count;
}

/// Groups one extent's attribute extents, keeping first-seen group order.
pub fn fold_attributes<'a>(
    attributes: impl IntoIterator<Item = &'a AttributeExtent>,
    key: GroupKey,
) -> Vec<AttributeExtent> {
    let mut groups: Vec<AttributeExtent> = Vec::new();
    for attribute in attributes {
        match groups.iter_mut().find(|g| key.same_group(g, attribute)) {
            Some(group) => absorb(group, attribute),
            None => groups.push(attribute.clone()),
        }
    }
    groups
}

/// Builds, sorts and truncates the rows for an extent listing.
pub fn aggregate_extents<'a>(
    entries: impl IntoIterator<Item = &'a Arc<IndexedExtent>>,
    options: &RequestOptions,
) -> Vec<ExtentRow> {
    let key = GroupKey::from_merge(&options.merge);
    let window = options.single_window();

    let mut rows = Vec::new();
    for entry in entries {
        let selected = entry
            .extent
            .attributes
            .iter()
            .filter(|a| window.overlaps(&a.start, &a.end) && options.accepts_quality(&a.quality));
        for attribute in fold_attributes(selected, key) {
            rows.push(ExtentRow {
                entry: Arc::clone(entry),
                attribute,
            });
        }
    }

    sort_rows(&mut rows, options.order_by, &options.merge);
    if let Some(limit) = options.limit {
        rows.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
    }
    rows
}

fn cmp_nslc(a: &ExtentRow, b: &ExtentRow, merge: &MergeOptions) -> Ordering {
    let (x, y) = (&a.attribute, &b.attribute);
    a.entry
        .extent
        .stream
        .cmp(&b.entry.extent.stream)
        .then(x.start.cmp(&y.start))
        .then(x.end.cmp(&y.end))
        .then_with(|| {
            if merge.by_quality {
                Ordering::Equal
            } else {
                x.quality.cmp(&y.quality)
            }
        })
        .then_with(|| {
            if merge.by_sample_rate {
                Ordering::Equal
            } else {
                x.sample_rate.total_cmp(&y.sample_rate)
            }
        })
}

/// Stable sort by the requested order, NSLC order breaking ties.
pub fn sort_rows(rows: &mut [ExtentRow], order_by: OrderBy, merge: &MergeOptions) {
    rows.sort_by(|a, b| {
        let (x, y) = (&a.attribute, &b.attribute);
        let primary = match order_by {
            OrderBy::NslcTimeQualitySampleRate => Ordering::Equal,
            OrderBy::TimeSpanCount => x.segment_count.cmp(&y.segment_count),
            OrderBy::TimeSpanCountDesc => y.segment_count.cmp(&x.segment_count),
            OrderBy::LatestUpdate => x.updated.cmp(&y.updated),
            OrderBy::LatestUpdateDesc => y.updated.cmp(&x.updated),
        };
        primary.then_with(|| cmp_nslc(a, b, merge))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{ExtentIndex, RestrictionPolicy};
    use seisws_access::AccessControlList;
    use seisws_types::{parse_time, ArchiveObject, Extent, Service, StreamId, Time};

    fn t(s: &str) -> Time {
        parse_time(s).expect("valid time")
    }

    fn attr(quality: &str, rate: f64, start: &str, end: &str, count: u64) -> AttributeExtent {
        AttributeExtent {
            quality: quality.to_string(),
            sample_rate: rate,
            start: t(start),
            end: t(end),
            updated: t(end),
            segment_count: count,
        }
    }

    fn index() -> ExtentIndex {
        let extent = |id, sta: &str, attributes: Vec<AttributeExtent>| ArchiveObject::Extent {
            id,
            extent: Extent {
                stream: StreamId::new("AM", sta, "", "EHZ"),
                start: t("2021-01-01"),
                end: t("2021-12-01"),
                updated: t("2021-12-01"),
                segment_count: attributes.iter().map(|a| a.segment_count).sum(),
                segment_overflow: false,
                attributes,
            },
        };
        ExtentIndex::build(
            [
                extent(
                    1,
                    "R1",
                    vec![
                        attr("D", 100.0, "2021-01-01", "2021-03-01", 4),
                        attr("M", 100.0, "2021-02-01", "2021-05-01", 2),
                        attr("D", 50.0, "2021-06-01", "2021-07-01", 1),
                    ],
                ),
                extent(2, "R2", vec![attr("D", 100.0, "2021-01-01", "2021-12-01", 9)]),
            ],
            &RestrictionPolicy {
                open_streams: Some(["AM.R1..EHZ".to_string(), "AM.R2..EHZ".to_string()].into()),
                allow_restricted: false,
            },
            t("2030-01-01"),
        )
    }

    fn listing(query: &[(&str, &str)]) -> Vec<ExtentRow> {
        let index = index();
        let options =
            RequestOptions::from_query(Service::AvailabilityExtent, query).expect("valid options");
        let acl = AccessControlList::default();
        aggregate_extents(index.extent_iter(&options, None, &acl), &options)
    }

    fn summary(rows: &[ExtentRow]) -> Vec<(String, String, f64, u64)> {
        rows.iter()
            .map(|r| {
                (
                    r.entry.extent.stream.station.clone(),
                    r.attribute.quality.clone(),
                    r.attribute.sample_rate,
                    r.attribute.segment_count,
                )
            })
            .collect()
    }

    #[test]
    fn unmerged_rows_sort_by_stream_then_time() {
        let rows = listing(&[]);
        assert_eq!(
            summary(&rows),
            [
                ("R1".into(), "D".into(), 100.0, 4),
                ("R1".into(), "M".into(), 100.0, 2),
                ("R1".into(), "D".into(), 50.0, 1),
                ("R2".into(), "D".into(), 100.0, 9),
            ]
        );
    }

    #[test]
    fn merge_quality_groups_by_rate() {
        let rows = listing(&[("merge", "quality")]);
        let r1: Vec<_> = rows.iter().filter(|r| r.entry.id == 1).collect();
        assert_eq!(r1.len(), 2);
        assert_eq!(r1[0].attribute.sample_rate, 100.0);
        assert_eq!(r1[0].attribute.segment_count, 6);
        assert_eq!(r1[0].attribute.start, t("2021-01-01"));
        assert_eq!(r1[0].attribute.end, t("2021-05-01"));
        assert_eq!(r1[1].attribute.sample_rate, 50.0);
    }

    #[test]
    fn merge_both_gives_one_row_per_stream() {
        let rows = listing(&[("merge", "quality,samplerate")]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].attribute.segment_count, 7);
        assert_eq!(rows[0].attribute.end, t("2021-07-01"));
        assert_eq!(rows[0].attribute.updated, t("2021-07-01"));
    }

    #[test]
    fn quality_and_window_filter_attributes() {
        let rows = listing(&[("quality", "M")]);
        assert_eq!(summary(&rows), [("R1".into(), "M".into(), 100.0, 2)]);

        let rows = listing(&[("start", "2021-05-15"), ("end", "2021-06-15")]);
        assert_eq!(
            summary(&rows),
            [("R1".into(), "D".into(), 50.0, 1), ("R2".into(), "D".into(), 100.0, 9)]
        );
    }

    #[test]
    fn order_by_count_and_limit() {
        let rows = listing(&[("orderby", "timespancount_desc"), ("limit", "2")]);
        assert_eq!(
            summary(&rows),
            [("R2".into(), "D".into(), 100.0, 9), ("R1".into(), "D".into(), 100.0, 4)]
        );

        let rows = listing(&[("orderby", "timespancount")]);
        assert_eq!(rows[0].attribute.segment_count, 1);
    }

    #[test]
    fn order_by_update_breaks_ties_by_nslc() {
        let rows = listing(&[("orderby", "latestupdate"), ("merge", "quality,samplerate")]);
        let stations: Vec<_> = rows.iter().map(|r| r.entry.extent.stream.station.as_str()).collect();
        assert_eq!(stations, ["R1", "R2"]);

        let rows = listing(&[("orderby", "latestupdate_desc"), ("merge", "quality,samplerate")]);
        let stations: Vec<_> = rows.iter().map(|r| r.entry.extent.stream.station.as_str()).collect();
        assert_eq!(stations, ["R2", "R1"]);
    }
}
