//! Collaborators that feed archive summaries into the service.

use std::collections::HashSet;
use std::ops::ControlFlow;

use seisws_types::{ArchiveObject, ExtentId, Segment, ServiceError, TimeWindow};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("archive database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("archive pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("archive unavailable: {0}")]
    Unavailable(String),
}

impl From<SourceError> for ServiceError {
    fn from(err: SourceError) -> Self {
        ServiceError::SourceFailure(err.to_string())
    }
}

/// Lists every extent and attribute extent the archive knows about.
///
/// Attribute extents refer to their parent by the id carried in the
/// matching [`ArchiveObject::Extent`].
pub trait ExtentSource: Send + Sync {
    fn load_objects(&self) -> Result<Vec<ArchiveObject>, SourceError>;
}

/// What a segment scan should return.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentQuery {
    pub extent_ids: Vec<ExtentId>,
    pub window: TimeWindow,
    pub quality: Option<Vec<String>>,
}

impl SegmentQuery {
    /// Window and quality test; extent membership is up to the source.
    pub fn accepts(&self, segment: &Segment) -> bool {
        self.window.overlaps(&segment.start, &segment.end)
            && self
                .quality
                .as_ref()
                .map_or(true, |q| q.iter().any(|q| *q == segment.quality))
    }
}

/// Streams segments ordered by (extent id, start).
///
/// The scan stops as soon as `visit` breaks; implementations must release
/// their cursor at that point rather than draining it.
pub trait SegmentSource: Send + Sync {
    fn scan_segments(
        &self,
        query: &SegmentQuery,
        visit: &mut dyn FnMut(ExtentId, Segment) -> ControlFlow<()>,
    ) -> Result<(), SourceError>;
}

/// In-memory archive, mainly for tests and demos.
#[derive(Debug, Clone, Default)]
pub struct MemoryArchive {
    objects: Vec<ArchiveObject>,
}

impl MemoryArchive {
    pub fn new(objects: Vec<ArchiveObject>) -> Self {
        Self { objects }
    }

    pub fn push(&mut self, object: ArchiveObject) {
        self.objects.push(object);
    }
}

impl ExtentSource for MemoryArchive {
    fn load_objects(&self) -> Result<Vec<ArchiveObject>, SourceError> {
        Ok(self
            .objects
            .iter()
            .filter(|o| !matches!(o, ArchiveObject::Segment { .. }))
            .cloned()
            .collect())
    }
}

impl SegmentSource for MemoryArchive {
    fn scan_segments(
        &self,
        query: &SegmentQuery,
        visit: &mut dyn FnMut(ExtentId, Segment) -> ControlFlow<()>,
    ) -> Result<(), SourceError> {
        let wanted: HashSet<ExtentId> = query.extent_ids.iter().copied().collect();
        let mut segments: Vec<(ExtentId, &Segment)> = self
            .objects
            .iter()
            .filter_map(|o| match o {
                ArchiveObject::Segment { extent_id, segment }
                    if wanted.contains(extent_id) && query.accepts(segment) =>
                {
                    Some((*extent_id, segment))
                }
                _ => None,
            })
            .collect();
        segments.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.start.cmp(&b.1.start)));

        for (extent_id, segment) in segments {
            if visit(extent_id, segment.clone()).is_break() {
                break;
            }
        }
        Ok(())
    }
}
