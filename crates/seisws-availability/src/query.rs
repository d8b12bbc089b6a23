//! Request execution for the extent and query endpoints.

use std::ops::ControlFlow;

use seisws_access::{AccessControlList, Identity};
use seisws_types::{ExtentId, RequestOptions, ServiceError};

use crate::aggregate::{aggregate_extents, ExtentRow};
use crate::index::ExtentIndex;
use crate::merge::{MergedSegment, SegmentMerger};
use crate::source::{SegmentQuery, SegmentSource};

/// Largest number of extent ids handed to the segment source at once.
pub const EXTENT_BATCH_SIZE: usize = 1000;

pub const NO_AVAILABILITY: &str = "no matching availability information found";

/// Extent listing for `options`, or [`ServiceError::EmptyResult`].
pub fn list_extents(
    index: &ExtentIndex,
    options: &RequestOptions,
    identity: Option<&Identity>,
    acl: &AccessControlList,
) -> Result<Vec<ExtentRow>, ServiceError> {
    let rows = aggregate_extents(index.extent_iter(options, identity, acl), options);
    if rows.is_empty() {
        return Err(ServiceError::EmptyResult(NO_AVAILABILITY.to_string()));
    }
    Ok(rows)
}

/// Extent ids a segment query will scan, in batches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentPlan {
    pub batches: Vec<Vec<ExtentId>>,
}

impl SegmentPlan {
    pub fn extent_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }
}

/// Selects the extents a segment query touches.
///
/// Extents whose segments cannot be enumerated are dropped when the
/// request excludes them and reject the request otherwise.
pub fn plan_segments(
    index: &ExtentIndex,
    options: &RequestOptions,
    identity: Option<&Identity>,
    acl: &AccessControlList,
) -> Result<SegmentPlan, ServiceError> {
    let mut ids = Vec::new();
    let mut too_large = Vec::new();
    for entry in index.extent_iter(options, identity, acl) {
        if entry.extent.segment_overflow {
            if !options.exclude_too_large {
                too_large.push(entry.extent.stream.to_string());
            }
            continue;
        }
        ids.push(entry.id);
    }

    if !too_large.is_empty() {
        return Err(ServiceError::OversizeRequest(format!(
            "Unable to process request due to database limitations. Some selections have \
             too many segments to process. Rejected extents: {{{}}}. This limitation may be \
             resolved in a future version of this webservice.",
            too_large.join(", ")
        )));
    }
    if ids.is_empty() {
        return Err(ServiceError::EmptyResult(NO_AVAILABILITY.to_string()));
    }

    Ok(SegmentPlan {
        batches: ids.chunks(EXTENT_BATCH_SIZE).map(<[ExtentId]>::to_vec).collect(),
    })
}

/// Scans and merges the planned segments, handing each row to `emit`.
///
/// `emit` breaking stops the scan and releases the cursor. The row limit
/// counts across batches. Returns the number of rows emitted.
pub fn run_segments(
    source: &dyn SegmentSource,
    index: &ExtentIndex,
    plan: &SegmentPlan,
    options: &RequestOptions,
    emit: &mut dyn FnMut(MergedSegment) -> ControlFlow<()>,
) -> Result<u64, ServiceError> {
    let mut merger = SegmentMerger::new(options.merge, options.limit);
    let mut stopped = false;

    for batch in &plan.batches {
        if stopped || merger.is_full() {
            break;
        }
        let query = SegmentQuery {
            extent_ids: batch.clone(),
            window: options.single_window(),
            quality: options.quality.clone(),
        };
        source.scan_segments(&query, &mut |extent_id, segment| {
            let Some(entry) = index.get(extent_id) else {
                tracing::warn!(extent_id, "segment refers to unknown extent, skipping");
                return ControlFlow::Continue(());
            };
            if let Some(row) = merger.push(entry.clone(), segment) {
                if emit(row).is_break() {
                    stopped = true;
                    return ControlFlow::Break(());
                }
            }
            if merger.is_full() {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;
    }

    if !stopped {
        if let Some(row) = merger.finish() {
            // The scan is over; a disconnect here changes nothing.
            let _ = emit(row);
        }
    }

    Ok(merger.emitted())
}
