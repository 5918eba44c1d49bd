//! Full and incremental cache reconstruction from the entity store.

use crate::cache::CacheWriter;
use crate::database::Database;
use crate::drift::{DriftDetector, DriftReport, EntityKey};
use crate::entity_store::{BookmarkAux, EntityStore};
use crate::error::{StorageError, StorageResult};
use crate::state::{CacheState, CacheStatus};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, TryLockError};
use tracing::{debug, info, warn};
use yaba_types::{Entity, EntityId, EntityKind};

/// What a rebuild or repair did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairStats {
    pub inserted: usize,
    pub deleted: usize,
    /// Entities whose documents failed to parse and were left out. They show
    /// up as missing from the cache on the next drift check.
    pub skipped: Vec<EntityKey>,
}

/// Rebuilds or repairs the cache. Only one rebuild or repair runs at a time;
/// a concurrent call fails with [`StorageError::StateConflict`].
pub struct CacheRebuilder {
    db: Database,
    store: EntityStore,
    status: CacheStatus,
    max_parse_retries: u32,
    running: Mutex<()>,
    parse_failures: Mutex<HashMap<EntityKey, u32>>,
}

impl CacheRebuilder {
    /// Creates a rebuilder. If a previous full rebuild never finished, the
    /// cache state becomes [`CacheState::RebuildRequired`].
    pub fn new(
        db: Database,
        store: EntityStore,
        status: CacheStatus,
        max_parse_retries: u32,
    ) -> StorageResult<Self> {
        let pending = db.with_conn(|conn| CacheWriter::new(conn).is_rebuild_pending())?;
        if pending {
            warn!("previous cache rebuild did not finish; cache is unusable until rebuilt");
            status.set(CacheState::RebuildRequired);
        }
        Ok(Self {
            db,
            store,
            status,
            max_parse_retries,
            running: Mutex::new(()),
            parse_failures: Mutex::new(HashMap::new()),
        })
    }

    pub fn status(&self) -> &CacheStatus {
        &self.status
    }

    /// Runs the drift detector. Moves a usable cache to `SyncNeeded` when
    /// drift is found.
    pub fn detect_drift(&self) -> StorageResult<DriftReport> {
        let report = DriftDetector::new(&self.store, &self.db).detect()?;
        if report.has_drift() && self.status.current().is_usable() {
            self.status.set(CacheState::SyncNeeded);
        }
        Ok(report)
    }

    /// Clears every cache table and repopulates it from the entity store.
    ///
    /// A marker is committed before the clear and removed in the same
    /// transaction that finishes the rebuild, so an interrupted rebuild is
    /// detected on the next open.
    pub fn rebuild_from_filesystem(&self) -> StorageResult<RepairStats> {
        let _running = self.try_start()?;
        self.status.set(CacheState::Syncing);
        let result = self.rebuild_locked();
        self.finish("rebuild", result)
    }

    /// Repairs only the drifted entities. Falls back to a full rebuild when a
    /// previous one was interrupted.
    pub fn fix_drift(&self) -> StorageResult<RepairStats> {
        let _running = self.try_start()?;

        let pending = self
            .db
            .with_conn(|conn| CacheWriter::new(conn).is_rebuild_pending());
        match pending {
            Ok(true) => {
                info!("interrupted rebuild found, rebuilding the whole cache");
                self.status.set(CacheState::Syncing);
                let result = self.rebuild_locked();
                return self.finish("rebuild", result);
            }
            Ok(false) => {}
            Err(e) => return self.finish("repair", Err(e)),
        }

        let report = match DriftDetector::new(&self.store, &self.db).detect() {
            Ok(report) => report,
            Err(e) => return self.finish("repair", Err(e)),
        };
        if !report.has_drift() {
            debug!("no drift");
            self.status.set(CacheState::InSync);
            return Ok(RepairStats::default());
        }

        self.status.set(CacheState::Syncing);
        let result = self.repair(&report);
        self.finish("repair", result)
    }

    // ── Internals ────────────────────────────────────────────────

    fn try_start(&self) -> StorageResult<MutexGuard<'_, ()>> {
        match self.running.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(StorageError::StateConflict(
                "a cache rebuild is already running".into(),
            )),
            // The lock guards no data. An interrupted rebuild is caught by the
            // pending marker, not here.
            Err(TryLockError::Poisoned(poisoned)) => {
                warn!("previous cache rebuild panicked");
                Ok(poisoned.into_inner())
            }
        }
    }

    fn finish(&self, what: &str, result: StorageResult<RepairStats>) -> StorageResult<RepairStats> {
        match result {
            Ok(stats) => {
                info!(
                    inserted = stats.inserted,
                    deleted = stats.deleted,
                    skipped = stats.skipped.len(),
                    "cache {what} complete"
                );
                self.status.set(CacheState::InSync);
                Ok(stats)
            }
            Err(e) => {
                warn!(error = %e, "cache {what} failed");
                self.status.set(CacheState::SyncFailed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn rebuild_locked(&self) -> StorageResult<RepairStats> {
        self.db
            .with_conn(|conn| CacheWriter::new(conn).set_rebuild_pending())?;

        self.db.transaction(|tx| {
            let writer = CacheWriter::new(tx);
            writer.clear()?;
            let mut stats = RepairStats::default();
            for kind in EntityKind::ALL {
                for id in self.store.live_ids(kind)? {
                    if self.load_into(&writer, kind, id, &mut stats)? {
                        stats.inserted += 1;
                    }
                }
            }
            writer.clear_rebuild_pending()?;
            Ok(stats)
        })
    }

    fn repair(&self, report: &DriftReport) -> StorageResult<RepairStats> {
        self.db.transaction(|tx| {
            let writer = CacheWriter::new(tx);
            let mut stats = RepairStats::default();

            for (kind, id) in report
                .deleted_but_in_cache
                .iter()
                .chain(&report.missing_in_filesystem)
            {
                if writer.delete(*kind, *id)? {
                    stats.deleted += 1;
                }
            }

            for (kind, id) in &report.missing_in_cache {
                // Deleted between detection and repair.
                if self.store.is_deleted(*kind, *id) {
                    continue;
                }
                if self.load_into(&writer, *kind, *id, &mut stats)? {
                    stats.inserted += 1;
                }
            }
            Ok(stats)
        })
    }

    /// Reads an entity (and a bookmark's auxiliary files) and upserts it.
    /// Returns `false` when the entity vanished or was skipped.
    fn load_into(
        &self,
        writer: &CacheWriter<'_>,
        kind: EntityKind,
        id: EntityId,
        stats: &mut RepairStats,
    ) -> StorageResult<bool> {
        match self.load(kind, id) {
            Ok(Some((entity, aux))) => {
                writer.upsert(&entity, aux.as_ref())?;
                self.parse_failures.lock().unwrap().remove(&(kind, id));
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(StorageError::Parse { path, source }) => {
                let attempts = {
                    let mut failures = self.parse_failures.lock().unwrap();
                    let n = failures.entry((kind, id)).or_insert(0);
                    *n += 1;
                    *n
                };
                if attempts >= self.max_parse_retries {
                    return Err(StorageError::Parse { path, source });
                }
                warn!(
                    %kind,
                    %id,
                    path = %path.display(),
                    attempts,
                    error = %source,
                    "skipping unparseable document"
                );
                stats.skipped.push((kind, id));
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn load(
        &self,
        kind: EntityKind,
        id: EntityId,
    ) -> StorageResult<Option<(Entity, Option<BookmarkAux>)>> {
        let Some(entity) = self.store.read(kind, id)? else {
            return Ok(None);
        };
        let aux = match kind {
            EntityKind::Bookmark => Some(self.store.aux(id)?),
            EntityKind::Folder | EntityKind::Tag => None,
        };
        Ok(Some((entity, aux)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use yaba_types::{Tag, Timestamp};

    #[test]
    fn rebuild_recovers_after_a_panicked_run() {
        let dir = TempDir::new().unwrap();
        let store = EntityStore::open(dir.path().join("entities")).unwrap();
        store
            .write(&Entity::Tag(Tag::new("rust", Timestamp::from_millis(1))))
            .unwrap();
        let rebuilder = CacheRebuilder::new(
            Database::open_in_memory().unwrap(),
            store,
            CacheStatus::default(),
            3,
        )
        .unwrap();

        std::thread::scope(|s| {
            let crashed = s
                .spawn(|| {
                    let _running = rebuilder.running.lock().unwrap();
                    panic!("rebuild crashed");
                })
                .join();
            assert!(crashed.is_err());
        });
        assert!(rebuilder.running.is_poisoned());

        let stats = rebuilder.rebuild_from_filesystem().unwrap();
        assert_eq!(stats.inserted, 1);
        assert_eq!(rebuilder.status().current(), CacheState::InSync);
        // A second run is not mistaken for a concurrent one either.
        rebuilder.fix_drift().unwrap();
    }
}
