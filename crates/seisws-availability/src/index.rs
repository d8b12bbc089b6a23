//! Cached, NSLC-sorted snapshot of every stream extent.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, TryLockError};

use chrono::{Duration, Utc};
use seisws_access::{AccessControlList, Identity};
use seisws_types::{ArchiveObject, AttributeExtent, Extent, ExtentId, RequestOptions, StreamId, Time};
use serde::{Deserialize, Serialize};

use crate::source::{ExtentSource, SourceError};

/// One stream extent together with the flags the index derives for it.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedExtent {
    pub id: ExtentId,
    pub extent: Extent,
    pub restricted: bool,
}

/// Decides which streams are restricted and whether those are served.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestrictionPolicy {
    /// Dotted stream codes served without authentication. `None` marks
    /// every stream restricted.
    pub open_streams: Option<HashSet<String>>,
    pub allow_restricted: bool,
}

impl RestrictionPolicy {
    pub fn is_restricted(&self, stream: &StreamId) -> bool {
        self.open_streams
            .as_ref()
            .map_or(true, |open| !open.contains(&stream.to_string()))
    }
}

/// Immutable extent snapshot.
#[derive(Debug, Clone)]
pub struct ExtentIndex {
    sorted: Vec<Arc<IndexedExtent>>,
    by_id: HashMap<ExtentId, Arc<IndexedExtent>>,
    valid_until: Time,
}

impl ExtentIndex {
    /// Builds a snapshot from raw archive rows.
    ///
    /// Restricted streams are dropped unless the policy allows them.
    /// Attribute extents whose parent was dropped or never listed are
    /// ignored.
    pub fn build(
        objects: impl IntoIterator<Item = ArchiveObject>,
        policy: &RestrictionPolicy,
        valid_until: Time,
    ) -> Self {
        let mut extents: Vec<(ExtentId, Extent)> = Vec::new();
        let mut attributes: HashMap<ExtentId, Vec<AttributeExtent>> = HashMap::new();
        for object in objects {
            match object {
                ArchiveObject::Extent { id, extent } => extents.push((id, extent)),
                ArchiveObject::AttributeExtent {
                    extent_id,
                    attribute,
                } => attributes.entry(extent_id).or_default().push(attribute),
                ArchiveObject::Segment { extent_id, .. } => {
                    tracing::debug!(extent_id, "segment row ignored while building extent index");
                }
            }
        }

        let mut by_stream: HashMap<StreamId, IndexedExtent> = HashMap::with_capacity(extents.len());
        for (id, mut extent) in extents {
            let restricted = policy.is_restricted(&extent.stream);
            if restricted && !policy.allow_restricted {
                continue;
            }
            if let Some(attrs) = attributes.remove(&id) {
                extent.attributes.extend(attrs);
            }
            let entry = IndexedExtent {
                id,
                extent,
                restricted,
            };
            if let Some(previous) = by_stream.insert(entry.extent.stream.clone(), entry) {
                tracing::warn!(
                    stream = %previous.extent.stream,
                    replaced_id = previous.id,
                    "duplicate extent for stream, keeping the later one"
                );
            }
        }

        let mut sorted: Vec<Arc<IndexedExtent>> = by_stream.into_values().map(Arc::new).collect();
        sorted.sort_by(|a, b| a.extent.stream.cmp(&b.extent.stream));
        let by_id = sorted.iter().map(|e| (e.id, Arc::clone(e))).collect();

        Self {
            sorted,
            by_id,
            valid_until,
        }
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn valid_until(&self) -> Time {
        self.valid_until
    }

    pub fn is_expired_at(&self, now: &Time) -> bool {
        *now > self.valid_until
    }

    pub fn get(&self, id: ExtentId) -> Option<&Arc<IndexedExtent>> {
        self.by_id.get(&id)
    }

    pub fn lookup(&self, stream: &StreamId) -> Option<&Arc<IndexedExtent>> {
        self.sorted
            .binary_search_by(|e| e.extent.stream.cmp(stream))
            .ok()
            .map(|i| &self.sorted[i])
    }

    /// All extents in NSLC order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<IndexedExtent>> {
        self.sorted.iter()
    }

    /// Extents visible to the caller and selected by `options`, in NSLC
    /// order. Each extent is yielded at most once.
    ///
    /// Restricted extents are skipped for anonymous callers and unless the
    /// request includes them. Authorization runs over the request window
    /// clamped to the extent's span.
    pub fn extent_iter<'a>(
        &'a self,
        options: &'a RequestOptions,
        identity: Option<&'a Identity>,
        acl: &'a AccessControlList,
    ) -> impl Iterator<Item = &'a Arc<IndexedExtent>> + 'a {
        let window = options.single_window();
        self.sorted.iter().filter(move |entry| {
            let extent = &entry.extent;
            if entry.restricted {
                if !options.include_restricted {
                    return false;
                }
                let Some(identity) = identity else {
                    return false;
                };
                let (t1, t2) = window.clamp(extent.start, extent.end);
                let id = &extent.stream;
                if !acl.authorize(
                    identity,
                    &id.network,
                    &id.station,
                    &id.location,
                    &id.channel,
                    &t1,
                    &t2,
                ) {
                    return false;
                }
            }
            options.matches(&extent.stream, &extent.start, &extent.end)
        })
    }
}

/// How queries behave while an expired snapshot is being rebuilt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// One caller rebuilds, everyone else keeps reading the old snapshot.
    #[default]
    Stale,
    /// Every caller observing expiry waits for the rebuild.
    Strict,
}

/// Lazily rebuilt [`ExtentIndex`].
pub struct ExtentIndexCache {
    source: Arc<dyn ExtentSource>,
    policy: RestrictionPolicy,
    ttl: Duration,
    mode: CacheMode,
    current: RwLock<Option<Arc<ExtentIndex>>>,
    rebuild: Mutex<()>,
}

impl std::fmt::Debug for ExtentIndexCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtentIndexCache")
            .field("policy", &self.policy)
            .field("ttl", &self.ttl)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl ExtentIndexCache {
    pub fn new(
        source: Arc<dyn ExtentSource>,
        policy: RestrictionPolicy,
        ttl: Duration,
        mode: CacheMode,
    ) -> Self {
        Self {
            source,
            policy,
            ttl,
            mode,
            current: RwLock::new(None),
            rebuild: Mutex::new(()),
        }
    }

    /// Current snapshot, rebuilding first if it has expired.
    ///
    /// Blocks on the archive; call from a blocking context.
    pub fn get(&self) -> Result<Arc<ExtentIndex>, SourceError> {
        self.get_at(Utc::now())
    }

    pub fn get_at(&self, now: Time) -> Result<Arc<ExtentIndex>, SourceError> {
        let current = self.snapshot();
        if let Some(index) = &current {
            if !index.is_expired_at(&now) {
                return Ok(Arc::clone(index));
            }
        }

        let _guard = match (self.mode, &current) {
            (CacheMode::Stale, Some(stale)) => match self.rebuild.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::WouldBlock) => {
                    tracing::debug!("extent index rebuild in progress, serving stale snapshot");
                    return Ok(Arc::clone(stale));
                }
                Err(TryLockError::Poisoned(poisoned)) => {
                    tracing::error!("extent index rebuild lock poisoned, recovering");
                    poisoned.into_inner()
                }
            },
            _ => match self.rebuild.lock() {
                Ok(guard) => guard,
                Err(poisoned) => {
                    tracing::error!("extent index rebuild lock poisoned, recovering");
                    poisoned.into_inner()
                }
            },
        };

        // Another caller may have finished a rebuild while we waited.
        let current = self.snapshot();
        if let Some(index) = &current {
            if !index.is_expired_at(&now) {
                return Ok(Arc::clone(index));
            }
        }

        match self.source.load_objects() {
            Ok(objects) => {
                let index = Arc::new(ExtentIndex::build(objects, &self.policy, now + self.ttl));
                tracing::info!(
                    extents = index.len(),
                    valid_until = %index.valid_until(),
                    "extent index rebuilt"
                );
                self.publish(Arc::clone(&index));
                Ok(index)
            }
            Err(err) => match current {
                Some(previous) => {
                    tracing::warn!(error = %err, "extent index rebuild failed, keeping previous snapshot");
                    Ok(previous)
                }
                None => Err(err),
            },
        }
    }

    fn snapshot(&self) -> Option<Arc<ExtentIndex>> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => {
                tracing::error!("extent index lock poisoned, serving last snapshot");
                poisoned.into_inner().clone()
            }
        }
    }

    fn publish(&self, index: Arc<ExtentIndex>) {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(index);
    }
}
