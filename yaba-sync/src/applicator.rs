//! Applies ops and snapshots to the entity store, the cache and the
//! entity clocks.
//!
//! Every write follows one rule: an incoming version replaces the current one
//! only if it wins the `(timestamp, origin)` comparison, and a tombstone
//! dominates any record edited at or before its timestamp. Field deltas are
//! compared field by field, so concurrent edits to different fields both
//! land. Documents go to the entity store first; the cache row and the clocks
//! follow in the same database transaction, and the files are put back if
//! that transaction does not commit.

use crate::error::SyncResult;
use crate::merge::{MergedSnapshot, latest_by_entity};
use rusqlite::{Connection, Transaction};
use std::collections::BTreeMap;
use tracing::{debug, warn};
use yaba_storage::{
    CacheWriter, Database, EntityClock, EntityStore, FieldClock, OpLog, ReplicaRegistry, Storage,
    StorageError, StorageResult, WriteJournal,
};
use yaba_types::{
    ActionType, Entity, EntityId, EntityKind, FieldChange, OpDraft, OpLogEntry, OpPayload,
    ReplicaId, Timestamp, Tombstone, Version,
};

/// What happened to one op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The op changed the entity.
    Applied,
    /// The entity already reflects a later write.
    Stale,
    /// A tombstone dominates it.
    Suppressed,
    /// An update for an entity this replica does not hold yet.
    Missing,
    /// The op was already in the log.
    Duplicate,
}

/// Tally of a batch of remote ops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub stale: usize,
    pub suppressed: usize,
    pub missing: usize,
    pub duplicates: usize,
    /// Lowest sequence number per origin that was held back as
    /// [`ApplyOutcome::Missing`]. Held-back ops are not logged, and the
    /// cursor for their origin stays below them so they are sent again.
    pub held_back: BTreeMap<ReplicaId, u64>,
}

impl ApplyReport {
    fn record(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied => self.applied += 1,
            ApplyOutcome::Stale => self.stale += 1,
            ApplyOutcome::Suppressed => self.suppressed += 1,
            ApplyOutcome::Missing => self.missing += 1,
            ApplyOutcome::Duplicate => self.duplicates += 1,
        }
    }

    /// The highest sequence number of `origin` that may be marked as
    /// integrated, given that everything up to `seq` was received.
    pub fn integrated_up_to(&self, origin: ReplicaId, seq: u64) -> u64 {
        self.held_back
            .get(&origin)
            .map_or(seq, |first| seq.min(first.saturating_sub(1)))
    }
}

/// What persisting a merged snapshot or a delete-log changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistStats {
    pub written: usize,
    pub deleted: usize,
}

/// Applies ops and snapshots for one replica.
#[derive(Clone)]
pub struct OpApplicator {
    entities: EntityStore,
    db: Database,
}

impl OpApplicator {
    pub fn new(storage: &Storage) -> Self {
        Self {
            entities: storage.entities.clone(),
            db: storage.db.clone(),
        }
    }

    /// Stamps a local draft with this replica's id and next sequence number,
    /// applies it and appends it to the op log, all in one transaction.
    ///
    /// An update of an entity that does not exist fails with
    /// [`StorageError::NotFound`] and consumes no sequence number.
    pub fn apply_local(&self, draft: OpDraft) -> SyncResult<(OpLogEntry, ApplyOutcome)> {
        let result = self.in_transaction(|tx, journal| {
            let registry = ReplicaRegistry::new(tx);
            let origin = registry.ensure_info()?.device_id;
            let entry = draft.stamp(origin, registry.next_seq()?);
            let absent = entry.action_type == ActionType::Updated
                && !self.entities.has_document(entry.entity_type, entry.entity_id);
            let outcome = if absent {
                ApplyOutcome::Missing
            } else {
                self.apply_op(tx, journal, &entry)?
            };
            if outcome == ApplyOutcome::Missing {
                return Err(StorageError::NotFound(format!(
                    "{} {}",
                    entry.entity_type, entry.entity_id
                )));
            }
            OpLog::new(tx).append(&entry)?;
            Ok((entry, outcome))
        })?;
        debug!(
            seq = result.0.origin_seq,
            action = %result.0.action_type,
            kind = %result.0.entity_type,
            id = %result.0.entity_id,
            outcome = ?result.1,
            "applied local op"
        );
        Ok(result)
    }

    /// Applies a batch of remote ops in causal order: by timestamp, then
    /// `(origin, seq)`.
    ///
    /// Ops already in the log are skipped. An update for an entity this
    /// replica does not hold is retried after the rest of the batch; if its
    /// entity still has not appeared it is held back, unlogged. Every other
    /// op is appended whether or not it won, and the cursor for its origin
    /// moves past it but never past a held-back op.
    pub fn apply_remote(&self, ops: &[OpLogEntry]) -> SyncResult<ApplyReport> {
        let mut pending: Vec<&OpLogEntry> = ops.iter().collect();
        pending.sort_by_key(|op| (op.happened_at, op.key()));

        let report = self.in_transaction(|tx, journal| {
            let log = OpLog::new(tx);
            let mut report = ApplyReport::default();
            let mut received: BTreeMap<ReplicaId, u64> = BTreeMap::new();

            loop {
                let attempted = pending.len();
                let mut deferred = Vec::new();
                for op in pending {
                    if log.contains(op.origin_device_id, op.origin_seq)? {
                        report.record(ApplyOutcome::Duplicate);
                        continue;
                    }
                    let outcome = self.apply_op(tx, journal, op)?;
                    if outcome == ApplyOutcome::Missing {
                        deferred.push(op);
                        continue;
                    }
                    debug!(
                        origin = %op.origin_device_id,
                        seq = op.origin_seq,
                        action = %op.action_type,
                        id = %op.entity_id,
                        ?outcome,
                        "applied remote op"
                    );
                    report.record(outcome);
                    log.append(op)?;
                    let seq = received.entry(op.origin_device_id).or_default();
                    *seq = (*seq).max(op.origin_seq);
                }
                pending = deferred;
                if pending.is_empty() || pending.len() == attempted {
                    break;
                }
            }

            for op in pending {
                warn!(
                    origin = %op.origin_device_id,
                    seq = op.origin_seq,
                    kind = %op.entity_type,
                    id = %op.entity_id,
                    "holding back update for an entity this replica does not hold"
                );
                report.record(ApplyOutcome::Missing);
                let first = report.held_back.entry(op.origin_device_id).or_insert(op.origin_seq);
                *first = (*first).min(op.origin_seq);
            }

            let registry = ReplicaRegistry::new(tx);
            for (origin, seq) in received {
                let seq = report.integrated_up_to(origin, seq);
                if seq > 0 {
                    // Last-seen moves only when the origin itself syncs with us.
                    registry.advance_cursor(origin, seq, Timestamp::ZERO)?;
                }
            }
            Ok(report)
        })?;
        Ok(report)
    }

    /// Persists a merged snapshot received from or agreed with `peer`.
    ///
    /// Records that differ from the local copy are written with a clock
    /// attributed to `peer`; the newest tombstone for every entity is then
    /// applied. A local edit made after the snapshot was taken is kept.
    /// Nothing is persisted if any write fails.
    pub fn apply_merged(
        &self,
        merged: &MergedSnapshot,
        peer: ReplicaId,
    ) -> SyncResult<PersistStats> {
        self.in_transaction(|tx, journal| {
            let clock = EntityClock::new(tx);
            let fields = FieldClock::new(tx);
            let mut stats = PersistStats::default();

            for entity in &merged.entities {
                let (kind, id) = (entity.kind(), entity.id());
                let local = self.read_lenient(kind, id)?;
                if local.as_ref() == Some(entity) {
                    continue;
                }
                // Edited locally after the snapshot was taken.
                if local
                    .as_ref()
                    .is_some_and(|doc| doc.edited_at() > entity.edited_at())
                {
                    debug!(%kind, %id, "local copy is newer than merged record, keeping it");
                    continue;
                }
                journal.record(&self.entities, kind, id)?;
                self.write_entity(tx, entity)?;
                let version = Version::new(entity.edited_at(), peer);
                clock.upsert(kind, id, version)?;
                fields.set_document(kind, id, version)?;
                stats.written += 1;
            }

            for tombstone in latest_by_entity(&merged.tombstones).into_values() {
                if self.apply_tombstone(tx, journal, tombstone, peer)? {
                    stats.deleted += 1;
                }
            }
            Ok(stats)
        })
    }

    /// Applies a peer's delete-log. Returns how many live entities it removed.
    pub fn apply_tombstones(
        &self,
        tombstones: &[Tombstone],
        peer: ReplicaId,
    ) -> SyncResult<PersistStats> {
        self.in_transaction(|tx, journal| {
            let mut stats = PersistStats::default();
            for tombstone in latest_by_entity(tombstones).into_values() {
                if self.apply_tombstone(tx, journal, tombstone, peer)? {
                    stats.deleted += 1;
                }
            }
            Ok(stats)
        })
    }

    // ── Internals ────────────────────────────────────────────────

    /// Runs `f` in a database transaction. If the transaction does not
    /// commit, every entity the journal recorded is restored on disk.
    fn in_transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>, &mut WriteJournal) -> StorageResult<T>,
    ) -> SyncResult<T> {
        let mut journal = WriteJournal::new();
        let result = self.db.transaction(|tx| f(tx, &mut journal));
        if result.is_err() && !journal.is_empty() {
            let touched = journal.len();
            match journal.restore() {
                Ok(()) => warn!(touched, "write failed, restored entity files"),
                Err(e) => warn!(
                    touched,
                    error = %e,
                    "write failed and entity files could not be restored"
                ),
            }
        }
        Ok(result?)
    }

    fn apply_op(
        &self,
        conn: &Connection,
        journal: &mut WriteJournal,
        op: &OpLogEntry,
    ) -> StorageResult<ApplyOutcome> {
        let (kind, id) = (op.entity_type, op.entity_id);
        let version = Version::new(op.happened_at, op.origin_device_id);

        match (op.action_type, &op.payload) {
            (ActionType::DeletedAll, _) => self.apply_delete_all(conn, journal, kind, version),
            (ActionType::Created, OpPayload::Document(entity)) => {
                if entity.kind() != kind || entity.id() != id {
                    return Err(StorageError::InvalidData(format!(
                        "op for {kind} {id} carries document for {} {}",
                        entity.kind(),
                        entity.id()
                    )));
                }
                self.apply_created(conn, journal, entity, version)
            }
            (ActionType::Updated, OpPayload::Fields(changes)) => {
                self.apply_fields(conn, journal, kind, id, changes, version)
            }
            (ActionType::Deleted, _) => self.apply_deleted(conn, journal, kind, id, version),
            (action, _) => Err(StorageError::InvalidData(format!(
                "{action} op for {kind} {id} has a mismatched payload"
            ))),
        }
    }

    /// Writes a whole document if it wins the entity's clock. For a deleted
    /// entity only the deletion marker counts, since a field delta it
    /// suppressed may have moved the clock past the marker.
    fn apply_created(
        &self,
        conn: &Connection,
        journal: &mut WriteJournal,
        entity: &Entity,
        version: Version,
    ) -> StorageResult<ApplyOutcome> {
        let (kind, id) = (entity.kind(), entity.id());
        let clock = EntityClock::new(conn);
        let deleted = !self.entities.has_document(kind, id) && self.entities.is_deleted(kind, id);
        if !deleted
            && clock
                .get(kind, id)?
                .is_some_and(|current| !version.wins(&current))
        {
            return Ok(ApplyOutcome::Stale);
        }
        if self.suppressed(kind, id, version.timestamp)? {
            return Ok(ApplyOutcome::Suppressed);
        }
        journal.record(&self.entities, kind, id)?;
        self.write_entity(conn, entity)?;
        clock.upsert(kind, id, version)?;
        FieldClock::new(conn).set_document(kind, id, version)?;
        Ok(ApplyOutcome::Applied)
    }

    /// Applies the changes that win their field's clock and drops the rest.
    /// The document's `editedAt` and the entity clock only move forward.
    fn apply_fields(
        &self,
        conn: &Connection,
        journal: &mut WriteJournal,
        kind: EntityKind,
        id: EntityId,
        changes: &[FieldChange],
        version: Version,
    ) -> StorageResult<ApplyOutcome> {
        if self.suppressed(kind, id, version.timestamp)? {
            return Ok(ApplyOutcome::Suppressed);
        }
        let Some(mut doc) = self.entities.read(kind, id)? else {
            // A delta cannot bring back a deleted entity.
            if self.entities.is_deleted(kind, id) {
                return Ok(ApplyOutcome::Suppressed);
            }
            return Ok(ApplyOutcome::Missing);
        };

        let fields = FieldClock::new(conn);
        let mut winning = Vec::with_capacity(changes.len());
        for change in changes {
            if fields
                .field(kind, id, change.field())?
                .is_none_or(|current| version.wins(&current))
            {
                winning.push(change.clone());
            }
        }
        if winning.is_empty() {
            return Ok(ApplyOutcome::Stale);
        }
        if winning.len() < changes.len() {
            debug!(
                %kind,
                %id,
                kept = changes.len() - winning.len(),
                "some fields hold newer values"
            );
        }

        doc.apply_changes(&winning)?;
        if version.timestamp > doc.edited_at() {
            doc.set_edited_at(version.timestamp);
        }
        journal.record(&self.entities, kind, id)?;
        self.write_entity(conn, &doc)?;
        for change in &winning {
            fields.set_field(kind, id, change.field(), version)?;
        }
        self.advance_clock(conn, kind, id, version)?;
        Ok(ApplyOutcome::Applied)
    }

    /// Deletes the entity if the op wins its document version. Later field
    /// deltas do not keep a deleted entity alive.
    fn apply_deleted(
        &self,
        conn: &Connection,
        journal: &mut WriteJournal,
        kind: EntityKind,
        id: EntityId,
        version: Version,
    ) -> StorageResult<ApplyOutcome> {
        if self
            .document_version(conn, kind, id)?
            .is_some_and(|current| !version.wins(&current))
        {
            return Ok(ApplyOutcome::Stale);
        }
        journal.record(&self.entities, kind, id)?;
        self.delete_entity(conn, &Tombstone::new(kind, id, version.timestamp))?;
        self.advance_clock(conn, kind, id, version)?;
        Ok(ApplyOutcome::Applied)
    }

    /// Tombstones every live entity of `kind` whose document loses to
    /// `version`.
    fn apply_delete_all(
        &self,
        conn: &Connection,
        journal: &mut WriteJournal,
        kind: EntityKind,
        version: Version,
    ) -> StorageResult<ApplyOutcome> {
        let mut deleted = 0;
        for id in self.entities.live_ids(kind)? {
            let older = match self.document_version(conn, kind, id)? {
                Some(current) => version.wins(&current),
                None => self
                    .read_lenient(kind, id)?
                    .is_none_or(|doc| doc.edited_at() <= version.timestamp),
            };
            if !older {
                continue;
            }
            journal.record(&self.entities, kind, id)?;
            self.delete_entity(conn, &Tombstone::new(kind, id, version.timestamp))?;
            self.advance_clock(conn, kind, id, version)?;
            deleted += 1;
        }
        debug!(%kind, deleted, "applied delete-all");
        Ok(if deleted > 0 {
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::Stale
        })
    }

    /// Applies one tombstone unless a strictly newer write recreated the
    /// entity. Returns whether a live entity was removed.
    fn apply_tombstone(
        &self,
        conn: &Connection,
        journal: &mut WriteJournal,
        tombstone: &Tombstone,
        origin: ReplicaId,
    ) -> StorageResult<bool> {
        let (kind, id) = (tombstone.entity_type, tombstone.entity_id);
        let doc = self.read_lenient(kind, id)?;
        if doc
            .as_ref()
            .is_some_and(|doc| !tombstone.suppresses(doc.edited_at()))
        {
            return Ok(false);
        }
        let existing = self.entities.tombstone(kind, id)?;
        if doc.is_none()
            && existing
                .as_ref()
                .is_some_and(|t| t.timestamp >= tombstone.timestamp)
        {
            return Ok(false);
        }

        journal.record(&self.entities, kind, id)?;
        self.delete_entity(conn, tombstone)?;
        self.advance_clock(conn, kind, id, Version::new(tombstone.timestamp, origin))?;
        Ok(doc.is_some())
    }

    /// Version of the last whole-document write, or the entity clock for an
    /// entity that has none recorded.
    fn document_version(
        &self,
        conn: &Connection,
        kind: EntityKind,
        id: EntityId,
    ) -> StorageResult<Option<Version>> {
        match FieldClock::new(conn).document(kind, id)? {
            Some(version) => Ok(Some(version)),
            None => EntityClock::new(conn).get(kind, id),
        }
    }

    fn advance_clock(
        &self,
        conn: &Connection,
        kind: EntityKind,
        id: EntityId,
        version: Version,
    ) -> StorageResult<()> {
        let clock = EntityClock::new(conn);
        if clock
            .get(kind, id)?
            .is_none_or(|current| version.wins(&current))
        {
            clock.upsert(kind, id, version)?;
        }
        Ok(())
    }

    fn suppressed(&self, kind: EntityKind, id: EntityId, at: Timestamp) -> StorageResult<bool> {
        Ok(self
            .entities
            .tombstone(kind, id)?
            .is_some_and(|t| t.suppresses(at)))
    }

    fn write_entity(&self, conn: &Connection, entity: &Entity) -> StorageResult<()> {
        self.entities.write(entity)?;
        let aux = match entity {
            Entity::Bookmark { meta, .. } => Some(self.entities.aux(meta.id)?),
            Entity::Folder(_) | Entity::Tag(_) => None,
        };
        CacheWriter::new(conn).upsert(entity, aux.as_ref())
    }

    fn delete_entity(&self, conn: &Connection, tombstone: &Tombstone) -> StorageResult<()> {
        let (kind, id) = (tombstone.entity_type, tombstone.entity_id);
        // An equal or newer marker stays; documents still go.
        let covered = self
            .entities
            .tombstone(kind, id)?
            .is_some_and(|t| t.timestamp >= tombstone.timestamp);
        if !covered || self.entities.has_document(kind, id) {
            self.entities.write_tombstone(tombstone)?;
        }
        CacheWriter::new(conn).delete(kind, id)?;
        Ok(())
    }

    /// Reads a document, treating an unparseable one as absent so a
    /// replicated write can replace it.
    fn read_lenient(&self, kind: EntityKind, id: EntityId) -> StorageResult<Option<Entity>> {
        match self.entities.read(kind, id) {
            Ok(doc) => Ok(doc),
            Err(StorageError::Parse { path, source }) => {
                warn!(path = %path.display(), error = %source, "ignoring unparseable document");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
