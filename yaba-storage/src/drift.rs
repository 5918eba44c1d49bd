//! Drift detection between the entity store and the cache.

use crate::cache::CacheWriter;
use crate::database::Database;
use crate::entity_store::EntityStore;
use crate::error::StorageResult;
use std::collections::{BTreeSet, HashSet};
use yaba_types::{EntityId, EntityKind};

/// An entity address. Orders folders before tags before bookmarks.
pub type EntityKey = (EntityKind, EntityId);

/// Differences between the entity store and the cache, as three disjoint sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriftReport {
    /// Live in the entity store, absent from the cache.
    pub missing_in_cache: BTreeSet<EntityKey>,
    /// In the cache, with neither a document nor a marker in the entity store.
    pub missing_in_filesystem: BTreeSet<EntityKey>,
    /// In the cache, but deleted in the entity store.
    pub deleted_but_in_cache: BTreeSet<EntityKey>,
}

impl DriftReport {
    pub fn has_drift(&self) -> bool {
        !self.missing_in_cache.is_empty()
            || !self.missing_in_filesystem.is_empty()
            || !self.deleted_but_in_cache.is_empty()
    }

    pub fn len(&self) -> usize {
        self.missing_in_cache.len()
            + self.missing_in_filesystem.len()
            + self.deleted_but_in_cache.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_drift()
    }
}

/// Compares id sets. Beyond one directory listing per kind, the only
/// per-entity I/O is a document and marker existence check.
pub struct DriftDetector<'a> {
    store: &'a EntityStore,
    db: &'a Database,
}

impl<'a> DriftDetector<'a> {
    pub fn new(store: &'a EntityStore, db: &'a Database) -> Self {
        Self { store, db }
    }

    /// Computes the drift report. Has no side effects.
    pub fn detect(&self) -> StorageResult<DriftReport> {
        let mut report = DriftReport::default();
        for kind in EntityKind::ALL {
            let mut live = HashSet::new();
            let mut tombstoned = HashSet::new();
            for id in self.store.scan_ids(kind)? {
                let id = id?;
                if self.store.is_deleted(kind, id) {
                    tombstoned.insert(id);
                } else if self.store.has_document(kind, id) {
                    live.insert(id);
                }
            }
            let cached = self.db.with_conn(|conn| CacheWriter::new(conn).ids(kind))?;

            report
                .missing_in_cache
                .extend(live.difference(&cached).map(|id| (kind, *id)));
            report
                .deleted_but_in_cache
                .extend(tombstoned.intersection(&cached).map(|id| (kind, *id)));
            report.missing_in_filesystem.extend(
                cached
                    .iter()
                    .filter(|id| !live.contains(*id) && !tombstoned.contains(*id))
                    .map(|id| (kind, *id)),
            );
        }
        Ok(report)
    }
}
