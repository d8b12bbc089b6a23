//! Data availability: extent listings and merged segment queries.
//!
//! An [`ExtentIndexCache`] keeps a sorted snapshot of every stream extent
//! the archive knows, rebuilt lazily once it expires. Extent requests fold
//! the snapshot's attribute extents ([`aggregate_extents`]); segment
//! requests stream raw segments from a [`SegmentSource`] through a
//! [`SegmentMerger`]. Rows are rendered by a [`RowFormatter`].
//!
//! All entry points here block on the archive. Async callers run them on
//! the blocking pool.

mod aggregate;
mod format;
mod index;
mod merge;
mod query;
mod source;
mod sqlite;

pub use aggregate::{aggregate_extents, fold_attributes, sort_rows, ExtentRow, GroupKey};
pub use format::{
    formatter_for, render, AvailabilityRow, GeoCsvFormatter, JsonExtentFormatter,
    JsonQueryFormatter, Line, RequestFormatter, RowFormatter, TextFormatter,
};
pub use index::{CacheMode, ExtentIndex, ExtentIndexCache, IndexedExtent, RestrictionPolicy};
pub use merge::{merge_segments, MergeSegments, MergedSegment, SegmentMerger};
pub use query::{
    list_extents, plan_segments, run_segments, SegmentPlan, EXTENT_BATCH_SIZE, NO_AVAILABILITY,
};
pub use source::{
    ExtentSource, MemoryArchive, SegmentQuery, SegmentSource, SourceError,
};
pub use sqlite::SqliteArchive;
