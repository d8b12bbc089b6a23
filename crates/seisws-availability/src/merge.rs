//! Streaming fold of raw segments into availability rows.

use std::sync::Arc;

use seisws_types::{seconds_between, MergeOptions, Segment};

use crate::index::IndexedExtent;

/// A merged span ready for output. Immutable once emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedSegment {
    pub entry: Arc<IndexedExtent>,
    pub segment: Segment,
}

impl MergedSegment {
    pub fn restricted(&self) -> bool {
        self.entry.restricted
    }
}

/// Half a sample period in seconds, zero for unknown rates.
fn half_period(sample_rate: f64) -> f64 {
    if sample_rate > 0.0 {
        1.0 / (2.0 * sample_rate)
    } else {
        0.0
    }
}

/// Folds segments sorted by (extent, start) into merged rows.
///
/// At most one row is open at a time. A row is emitted when the next
/// segment cannot extend it, so memory stays constant however many
/// segments the archive returns.
#[derive(Debug)]
pub struct SegmentMerger {
    merge: MergeOptions,
    limit: Option<u64>,
    emitted: u64,
    open: Option<MergedSegment>,
    jitter: f64,
}

impl SegmentMerger {
    pub fn new(merge: MergeOptions, limit: Option<u64>) -> Self {
        Self {
            merge,
            limit,
            emitted: 0,
            open: None,
            jitter: 0.0,
        }
    }

    /// Rows emitted so far.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Whether the row limit has been reached. Further input is ignored.
    pub fn is_full(&self) -> bool {
        self.limit.is_some_and(|limit| self.emitted >= limit)
    }

    fn mergeable(&self, acc: &MergedSegment, entry: &IndexedExtent, next: &Segment) -> bool {
        let gap = seconds_between(&acc.segment.end, &next.start);
        let threshold = self.merge.gap_threshold.unwrap_or(self.jitter);

        acc.entry.id == entry.id
            && (self.merge.by_quality || acc.segment.quality == next.quality)
            && (self.merge.by_sample_rate || acc.segment.sample_rate == next.sample_rate)
            && gap <= threshold
            && (-gap <= self.jitter || self.merge.overlap)
    }

    /// Folds `segment` into the open row. Returns the row it closed, if any.
    pub fn push(&mut self, entry: Arc<IndexedExtent>, segment: Segment) -> Option<MergedSegment> {
        if self.is_full() {
            return None;
        }

        let fold = match &self.open {
            None => {
                self.jitter = half_period(segment.sample_rate);
                self.open = Some(MergedSegment { entry, segment });
                return None;
            }
            Some(acc) => self.mergeable(acc, &entry, &segment),
        };

        if fold {
            if let Some(acc) = self.open.as_mut() {
                let acc = &mut acc.segment;
                if segment.end > acc.end {
                    acc.end = segment.end;
                }
                if segment.updated > acc.updated {
                    acc.updated = segment.updated;
                }
            }
            return None;
        }

        let rate = segment.sample_rate;
        let closed = self.open.replace(MergedSegment { entry, segment })?;
        if closed.segment.sample_rate != rate {
            self.jitter = half_period(rate);
        }
        self.emitted += 1;
        Some(closed)
    }

    /// Closes the open row unless the limit was reached.
    pub fn finish(&mut self) -> Option<MergedSegment> {
        if self.is_full() {
            self.open = None;
            return None;
        }
        let row = self.open.take()?;
        self.emitted += 1;
        Some(row)
    }
}

/// Lazy iterator adapter over [`SegmentMerger`].
pub struct MergeSegments<I> {
    input: I,
    merger: SegmentMerger,
    done: bool,
}

/// Merges an (extent, segment) stream without materializing it.
pub fn merge_segments<I>(input: I, merge: MergeOptions, limit: Option<u64>) -> MergeSegments<I::IntoIter>
where
    I: IntoIterator<Item = (Arc<IndexedExtent>, Segment)>,
{
    MergeSegments {
        input: input.into_iter(),
        merger: SegmentMerger::new(merge, limit),
        done: false,
    }
}

impl<I> Iterator for MergeSegments<I>
where
    I: Iterator<Item = (Arc<IndexedExtent>, Segment)>,
{
    type Item = MergedSegment;

    fn next(&mut self) -> Option<MergedSegment> {
        if self.done {
            return None;
        }
        while !self.merger.is_full() {
            let Some((entry, segment)) = self.input.next() else {
                break;
            };
            if let Some(row) = self.merger.push(entry, segment) {
                return Some(row);
            }
        }
        self.done = true;
        self.merger.finish()
    }
}
