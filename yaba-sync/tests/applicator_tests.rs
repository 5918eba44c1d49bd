use pretty_assertions::assert_eq;
use std::fs;
use tempfile::TempDir;
use yaba_storage::{
    EntityClock, OpLog, ReplicaRegistry, SortKey, SortOrder, Storage, StorageError, StoreConfig,
};
use yaba_sync::{ApplyOutcome, MergedSnapshot, OpApplicator, SyncError};
use yaba_types::{
    ActionType, Entity, EntityId, EntityKind, FieldChange, Folder, OpDraft, OpLogEntry, ReplicaId,
    Timestamp, Tombstone, Version,
};

fn ts(ms: i64) -> Timestamp {
    Timestamp::from_millis(ms)
}

fn make_storage(dir: &TempDir) -> (Storage, OpApplicator) {
    let storage = Storage::open(&StoreConfig::in_dir(dir.path())).unwrap();
    let applicator = OpApplicator::new(&storage);
    (storage, applicator)
}

fn folder(id: EntityId, label: &str, edited: i64) -> Entity {
    let mut f = Folder::new(label, ts(1));
    f.id = id;
    f.edited_at = ts(edited);
    Entity::Folder(f)
}

fn created(origin: ReplicaId, seq: u64, entity: Entity) -> OpLogEntry {
    OpDraft::created(entity).stamp(origin, seq)
}

fn renamed(origin: ReplicaId, seq: u64, id: EntityId, label: &str, at: i64) -> OpLogEntry {
    OpDraft::updated(
        EntityKind::Folder,
        id,
        vec![FieldChange::Label(label.to_string())],
        ts(at),
    )
    .stamp(origin, seq)
}

fn deleted(origin: ReplicaId, seq: u64, id: EntityId, at: i64) -> OpLogEntry {
    OpDraft::deleted(EntityKind::Folder, id, ts(at)).stamp(origin, seq)
}

fn recolored(origin: ReplicaId, seq: u64, id: EntityId, color: i32, at: i64) -> OpLogEntry {
    OpDraft::updated(EntityKind::Folder, id, vec![FieldChange::Color(color)], ts(at))
        .stamp(origin, seq)
}

fn ordered_pair() -> (ReplicaId, ReplicaId) {
    let (x, y) = (ReplicaId::new(), ReplicaId::new());
    if x < y { (x, y) } else { (y, x) }
}

fn label_of(storage: &Storage, id: EntityId) -> Option<String> {
    storage
        .entities
        .read(EntityKind::Folder, id)
        .unwrap()
        .map(|e| e.label().to_string())
}

fn doc(storage: &Storage, id: EntityId) -> Option<Entity> {
    storage.entities.read(EntityKind::Folder, id).unwrap()
}

fn cached_labels(storage: &Storage) -> Vec<String> {
    storage
        .query()
        .folders(SortKey::Label, SortOrder::Ascending)
        .unwrap()
        .into_iter()
        .map(|row| row.label)
        .collect()
}

// ── Local ops ────────────────────────────────────────────────────

#[test]
fn local_ops_get_consecutive_sequence_numbers() {
    let dir = TempDir::new().unwrap();
    let (storage, applicator) = make_storage(&dir);
    let id = EntityId::new();

    let (first, outcome) = applicator
        .apply_local(OpDraft::created(folder(id, "Inbox", 100)))
        .unwrap();
    assert_eq!(outcome, ApplyOutcome::Applied);
    let (second, _) = applicator
        .apply_local(OpDraft::updated(
            EntityKind::Folder,
            id,
            vec![FieldChange::Label("Reading".into())],
            ts(200),
        ))
        .unwrap();

    assert_eq!((first.origin_seq, second.origin_seq), (1, 2));
    assert_eq!(first.origin_device_id, second.origin_device_id);
    assert_eq!(label_of(&storage, id).as_deref(), Some("Reading"));
    assert_eq!(cached_labels(&storage), vec!["Reading"]);

    storage
        .db
        .with_conn(|c| {
            assert_eq!(OpLog::new(c).len()?, 2);
            assert_eq!(ReplicaRegistry::new(c).last_seq()?, 2);
            Ok(())
        })
        .unwrap();
}

#[test]
fn local_update_of_missing_entity_rolls_back() {
    let dir = TempDir::new().unwrap();
    let (storage, applicator) = make_storage(&dir);

    let err = applicator
        .apply_local(OpDraft::updated(
            EntityKind::Folder,
            EntityId::new(),
            vec![FieldChange::Label("ghost".into())],
            ts(100),
        ))
        .unwrap_err();
    assert!(matches!(err, SyncError::Storage(StorageError::NotFound(_))));

    // No sequence number was consumed and nothing was logged.
    let (entry, _) = applicator
        .apply_local(OpDraft::created(folder(EntityId::new(), "real", 100)))
        .unwrap();
    assert_eq!(entry.origin_seq, 1);
    storage
        .db
        .with_conn(|c| {
            assert_eq!(OpLog::new(c).len()?, 1);
            Ok(())
        })
        .unwrap();
}

// ── Remote ops ───────────────────────────────────────────────────

#[test]
fn remote_batch_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let (storage, applicator) = make_storage(&dir);
    let origin = ReplicaId::new();
    let id = EntityId::new();
    let ops = vec![
        created(origin, 1, folder(id, "Inbox", 100)),
        renamed(origin, 2, id, "Renamed", 150),
    ];

    let first = applicator.apply_remote(&ops).unwrap();
    assert_eq!(first.applied, 2);
    let second = applicator.apply_remote(&ops).unwrap();
    assert_eq!(second.applied, 0);
    assert_eq!(second.duplicates, 2);

    assert_eq!(label_of(&storage, id).as_deref(), Some("Renamed"));
    storage
        .db
        .with_conn(|c| {
            assert_eq!(OpLog::new(c).len()?, 2);
            let cursor = ReplicaRegistry::new(c).cursor(origin)?.unwrap();
            assert_eq!(cursor.last_seq, 2);
            // Only a direct session refreshes last-seen.
            assert_eq!(cursor.last_seen_at, Timestamp::ZERO);
            Ok(())
        })
        .unwrap();
}

#[test]
fn remote_batch_is_applied_in_sequence_order() {
    let dir = TempDir::new().unwrap();
    let (storage, applicator) = make_storage(&dir);
    let origin = ReplicaId::new();
    let id = EntityId::new();
    let ops = vec![
        renamed(origin, 2, id, "Renamed", 150),
        created(origin, 1, folder(id, "Inbox", 100)),
    ];

    let report = applicator.apply_remote(&ops).unwrap();
    assert_eq!(report.applied, 2);
    assert_eq!(label_of(&storage, id).as_deref(), Some("Renamed"));
}

#[test]
fn stale_remote_update_is_discarded_but_logged() {
    let dir = TempDir::new().unwrap();
    let (storage, applicator) = make_storage(&dir);
    let origin = ReplicaId::new();
    let id = EntityId::new();

    applicator
        .apply_remote(&[
            created(origin, 1, folder(id, "Inbox", 100)),
            renamed(origin, 2, id, "Newest", 300),
        ])
        .unwrap();
    let late = renamed(ReplicaId::new(), 1, id, "Older", 200);
    let report = applicator.apply_remote(std::slice::from_ref(&late)).unwrap();

    assert_eq!(report.stale, 1);
    assert_eq!(label_of(&storage, id).as_deref(), Some("Newest"));
    storage
        .db
        .with_conn(|c| {
            assert!(OpLog::new(c).contains(late.origin_device_id, 1)?);
            Ok(())
        })
        .unwrap();
}

#[test]
fn concurrent_edits_converge_regardless_of_arrival_order() {
    let (low, high) = ordered_pair();
    let id = EntityId::new();
    let base = created(low, 1, folder(id, "Inbox", 100));
    let from_low = renamed(low, 2, id, "low", 200);
    let from_high = renamed(high, 1, id, "high", 200);

    let mut finals = Vec::new();
    for order in [[&from_low, &from_high], [&from_high, &from_low]] {
        let dir = TempDir::new().unwrap();
        let (storage, applicator) = make_storage(&dir);
        applicator.apply_remote(std::slice::from_ref(&base)).unwrap();
        for op in order {
            applicator.apply_remote(std::slice::from_ref(op)).unwrap();
        }
        finals.push(label_of(&storage, id));
    }
    assert_eq!(finals, vec![Some("high".to_string()), Some("high".to_string())]);
}

#[test]
fn concurrent_edits_to_different_fields_both_land() {
    let (low, high) = ordered_pair();
    let id = EntityId::new();
    let base = created(low, 1, folder(id, "Inbox", 100));
    let label = renamed(low, 2, id, "low label", 200);
    let color = recolored(high, 1, id, 7, 190);

    let mut finals = Vec::new();
    for order in [[&label, &color], [&color, &label]] {
        let dir = TempDir::new().unwrap();
        let (storage, applicator) = make_storage(&dir);
        applicator.apply_remote(std::slice::from_ref(&base)).unwrap();
        for op in order {
            let report = applicator.apply_remote(std::slice::from_ref(op)).unwrap();
            assert_eq!(report.applied, 1);
        }
        finals.push(doc(&storage, id).unwrap());
    }

    assert_eq!(finals[0], finals[1]);
    let Entity::Folder(merged) = &finals[0] else {
        panic!("expected folder");
    };
    assert_eq!((merged.label.as_str(), merged.color), ("low label", 7));
    assert_eq!(merged.edited_at, ts(200));
}

#[test]
fn older_field_edit_loses_only_its_own_field() {
    let dir = TempDir::new().unwrap();
    let (storage, applicator) = make_storage(&dir);
    let (low, high) = ordered_pair();
    let id = EntityId::new();
    applicator
        .apply_remote(&[
            created(low, 1, folder(id, "Inbox", 100)),
            renamed(low, 2, id, "Newest", 300),
        ])
        .unwrap();

    let mixed = OpDraft::updated(
        EntityKind::Folder,
        id,
        vec![FieldChange::Label("Older".into()), FieldChange::Color(4)],
        ts(200),
    )
    .stamp(high, 1);
    let report = applicator.apply_remote(&[mixed]).unwrap();

    assert_eq!(report.applied, 1);
    let Some(Entity::Folder(f)) = doc(&storage, id) else {
        panic!("expected folder");
    };
    assert_eq!((f.label.as_str(), f.color, f.edited_at), ("Newest", 4, ts(300)));
}

#[test]
fn delete_and_concurrent_edit_converge_in_either_order() {
    let (low, high) = ordered_pair();
    let id = EntityId::new();
    let base = created(low, 1, folder(id, "Inbox", 100));
    let delete = deleted(low, 2, id, 200);
    let edit = renamed(high, 1, id, "Edited", 250);

    for order in [[&delete, &edit], [&edit, &delete]] {
        let dir = TempDir::new().unwrap();
        let (storage, applicator) = make_storage(&dir);
        applicator.apply_remote(std::slice::from_ref(&base)).unwrap();
        for op in order {
            let report = applicator.apply_remote(std::slice::from_ref(op)).unwrap();
            assert_eq!(report.missing, 0);
        }
        assert_eq!(label_of(&storage, id), None);
        assert!(storage.entities.is_deleted(EntityKind::Folder, id));
        assert!(cached_labels(&storage).is_empty());

        // A recreate between the two is judged against the marker alone.
        let report = applicator
            .apply_remote(&[created(low, 3, folder(id, "Back", 230))])
            .unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(label_of(&storage, id).as_deref(), Some("Back"));
    }
}

#[test]
fn update_for_unknown_entity_is_missing() {
    let dir = TempDir::new().unwrap();
    let (storage, applicator) = make_storage(&dir);
    let op = renamed(ReplicaId::new(), 1, EntityId::new(), "ghost", 100);

    let report = applicator.apply_remote(std::slice::from_ref(&op)).unwrap();
    assert_eq!(report.missing, 1);
    assert_eq!(report.held_back.get(&op.origin_device_id), Some(&1));
    assert!(storage.entities.live_ids(EntityKind::Folder).unwrap().is_empty());
    storage
        .db
        .with_conn(|c| {
            assert!(!OpLog::new(c).contains(op.origin_device_id, 1)?);
            assert_eq!(ReplicaRegistry::new(c).cursor(op.origin_device_id)?, None);
            Ok(())
        })
        .unwrap();
}

#[test]
fn mixed_origin_batch_applies_create_before_dependent_update() {
    // The updating origin sorts first by id, but its op happened later.
    let (low, high) = ordered_pair();
    let id = EntityId::new();
    let create = created(high, 1, folder(id, "Created", 100));
    let update = renamed(low, 1, id, "Updated", 200);

    let dir = TempDir::new().unwrap();
    let (together, applicator) = make_storage(&dir);
    let report = applicator
        .apply_remote(&[update.clone(), create.clone()])
        .unwrap();
    assert_eq!((report.applied, report.missing), (2, 0));

    let dir = TempDir::new().unwrap();
    let (apart, applicator) = make_storage(&dir);
    applicator.apply_remote(std::slice::from_ref(&create)).unwrap();
    applicator.apply_remote(std::slice::from_ref(&update)).unwrap();

    assert_eq!(label_of(&together, id).as_deref(), Some("Updated"));
    assert_eq!(doc(&together, id), doc(&apart, id));
}

#[test]
fn held_back_update_lands_once_its_entity_arrives() {
    let dir = TempDir::new().unwrap();
    let (storage, applicator) = make_storage(&dir);
    let (low, high) = ordered_pair();
    let id = EntityId::new();
    let update = renamed(low, 1, id, "Updated", 200);
    let later = renamed(low, 2, id, "Later", 300);

    let first = applicator.apply_remote(&[update.clone(), later.clone()]).unwrap();
    assert_eq!(first.missing, 2);
    assert_eq!(first.held_back.get(&low), Some(&1));

    // Sent again together with the create they depend on.
    let second = applicator
        .apply_remote(&[created(high, 1, folder(id, "Created", 100)), update, later])
        .unwrap();
    assert_eq!((second.applied, second.missing), (3, 0));
    assert_eq!(label_of(&storage, id).as_deref(), Some("Later"));
    storage
        .db
        .with_conn(|c| {
            assert_eq!(ReplicaRegistry::new(c).cursor(low)?.unwrap().last_seq, 2);
            Ok(())
        })
        .unwrap();
}

#[test]
fn held_back_op_keeps_its_origin_cursor_below_it() {
    let dir = TempDir::new().unwrap();
    let (storage, applicator) = make_storage(&dir);
    let origin = ReplicaId::new();
    let (known, unknown) = (EntityId::new(), EntityId::new());

    let report = applicator
        .apply_remote(&[
            created(origin, 1, folder(known, "Known", 100)),
            renamed(origin, 2, unknown, "ghost", 150),
            renamed(origin, 3, known, "Renamed", 200),
        ])
        .unwrap();

    assert_eq!((report.applied, report.missing), (2, 1));
    assert_eq!(report.integrated_up_to(origin, 3), 1);
    assert_eq!(label_of(&storage, known).as_deref(), Some("Renamed"));
    storage
        .db
        .with_conn(|c| {
            assert_eq!(ReplicaRegistry::new(c).cursor(origin)?.unwrap().last_seq, 1);
            assert!(OpLog::new(c).contains(origin, 3)?);
            Ok(())
        })
        .unwrap();
}

#[test]
fn remote_delete_writes_marker_and_drops_cache_row() {
    let dir = TempDir::new().unwrap();
    let (storage, applicator) = make_storage(&dir);
    let origin = ReplicaId::new();
    let id = EntityId::new();

    applicator
        .apply_remote(&[
            created(origin, 1, folder(id, "Inbox", 100)),
            deleted(origin, 2, id, 200),
        ])
        .unwrap();

    assert!(storage.entities.is_deleted(EntityKind::Folder, id));
    assert_eq!(label_of(&storage, id), None);
    assert!(cached_labels(&storage).is_empty());
    let marker = storage.entities.tombstone(EntityKind::Folder, id).unwrap().unwrap();
    assert_eq!(marker.timestamp, ts(200));
}

// ── Tombstone precedence ─────────────────────────────────────────

#[test]
fn create_at_tombstone_time_is_suppressed() {
    let dir = TempDir::new().unwrap();
    let (storage, applicator) = make_storage(&dir);
    let (low, high) = ordered_pair();
    let id = EntityId::new();

    applicator
        .apply_tombstones(&[Tombstone::new(EntityKind::Folder, id, ts(200))], low)
        .unwrap();
    let report = applicator
        .apply_remote(&[created(high, 1, folder(id, "Back", 200))])
        .unwrap();

    assert_eq!(report.suppressed, 1);
    assert!(storage.entities.is_deleted(EntityKind::Folder, id));
}

#[test]
fn later_create_recreates_a_deleted_entity() {
    let dir = TempDir::new().unwrap();
    let (storage, applicator) = make_storage(&dir);
    let origin = ReplicaId::new();
    let id = EntityId::new();

    applicator
        .apply_remote(&[
            created(origin, 1, folder(id, "Inbox", 100)),
            deleted(origin, 2, id, 200),
            created(origin, 3, folder(id, "Back", 300)),
        ])
        .unwrap();

    assert!(!storage.entities.is_deleted(EntityKind::Folder, id));
    assert_eq!(label_of(&storage, id).as_deref(), Some("Back"));
    assert_eq!(cached_labels(&storage), vec!["Back"]);
}

#[test]
fn delete_all_spares_entities_edited_afterwards() {
    let dir = TempDir::new().unwrap();
    let (storage, applicator) = make_storage(&dir);
    let (old, fresh) = (EntityId::new(), EntityId::new());
    applicator
        .apply_local(OpDraft::created(folder(old, "old", 100)))
        .unwrap();
    applicator
        .apply_local(OpDraft::created(folder(fresh, "fresh", 300)))
        .unwrap();

    let wipe = OpDraft::deleted_all(EntityKind::Folder, ts(200)).stamp(ReplicaId::new(), 1);
    let report = applicator.apply_remote(&[wipe]).unwrap();

    assert_eq!(report.applied, 1);
    assert_eq!(storage.entities.live_ids(EntityKind::Folder).unwrap(), vec![fresh]);
    assert!(storage.entities.is_deleted(EntityKind::Folder, old));
    assert_eq!(cached_labels(&storage), vec!["fresh"]);
}

#[test]
fn peer_tombstones_remove_older_records_only() {
    let dir = TempDir::new().unwrap();
    let (storage, applicator) = make_storage(&dir);
    let peer = ReplicaId::new();
    let (gone, kept) = (EntityId::new(), EntityId::new());
    applicator
        .apply_local(OpDraft::created(folder(gone, "gone", 100)))
        .unwrap();
    applicator
        .apply_local(OpDraft::created(folder(kept, "kept", 500)))
        .unwrap();

    let stats = applicator
        .apply_tombstones(
            &[
                Tombstone::new(EntityKind::Folder, gone, ts(200)),
                Tombstone::new(EntityKind::Folder, kept, ts(300)),
            ],
            peer,
        )
        .unwrap();

    assert_eq!(stats.deleted, 1);
    assert_eq!(cached_labels(&storage), vec!["kept"]);
    let clock = storage
        .db
        .with_conn(|c| EntityClock::new(c).get(EntityKind::Folder, gone))
        .unwrap();
    assert_eq!(clock, Some(Version::new(ts(200), peer)));
}

#[test]
fn newer_local_marker_is_not_replaced() {
    let dir = TempDir::new().unwrap();
    let (storage, applicator) = make_storage(&dir);
    let peer = ReplicaId::new();
    let id = EntityId::new();
    applicator
        .apply_tombstones(&[Tombstone::new(EntityKind::Folder, id, ts(500))], peer)
        .unwrap();
    applicator
        .apply_tombstones(&[Tombstone::new(EntityKind::Folder, id, ts(100))], peer)
        .unwrap();

    let marker = storage.entities.tombstone(EntityKind::Folder, id).unwrap().unwrap();
    assert_eq!(marker.timestamp, ts(500));
}

// ── Merged snapshots ─────────────────────────────────────────────

#[test]
fn merged_snapshot_overwrites_and_deletes() {
    let dir = TempDir::new().unwrap();
    let (storage, applicator) = make_storage(&dir);
    let peer = ReplicaId::new();
    let (renamed_id, deleted_id) = (EntityId::new(), EntityId::new());
    applicator
        .apply_local(OpDraft::created(folder(renamed_id, "Inbox", 100)))
        .unwrap();
    applicator
        .apply_local(OpDraft::created(folder(deleted_id, "Old", 100)))
        .unwrap();

    let merged = MergedSnapshot {
        entities: vec![folder(renamed_id, "Renamed", 150)],
        tombstones: vec![Tombstone::new(EntityKind::Folder, deleted_id, ts(200))],
    };
    let stats = applicator.apply_merged(&merged, peer).unwrap();

    assert_eq!((stats.written, stats.deleted), (1, 1));
    assert_eq!(cached_labels(&storage), vec!["Renamed"]);
    assert!(storage.entities.is_deleted(EntityKind::Folder, deleted_id));

    // Applying the same snapshot again changes nothing.
    let again = applicator.apply_merged(&merged, peer).unwrap();
    assert_eq!((again.written, again.deleted), (0, 0));
}

#[test]
fn merged_snapshot_keeps_newer_local_edit() {
    let dir = TempDir::new().unwrap();
    let (storage, applicator) = make_storage(&dir);
    let id = EntityId::new();
    applicator
        .apply_local(OpDraft::created(folder(id, "Mine", 400)))
        .unwrap();

    let merged = MergedSnapshot {
        entities: vec![folder(id, "Theirs", 300)],
        tombstones: Vec::new(),
    };
    let stats = applicator.apply_merged(&merged, ReplicaId::new()).unwrap();

    assert_eq!(stats.written, 0);
    assert_eq!(label_of(&storage, id).as_deref(), Some("Mine"));
}

// ── Failed writes ────────────────────────────────────────────────

#[test]
fn failed_merge_leaves_files_and_cache_untouched() {
    let dir = TempDir::new().unwrap();
    let (storage, applicator) = make_storage(&dir);
    let (kept, blocked) = (EntityId::new(), EntityId::new());
    applicator
        .apply_local(OpDraft::created(folder(kept, "old", 100)))
        .unwrap();
    // A plain file where the second entity's directory would go.
    fs::write(storage.entities.entity_dir(EntityKind::Folder, blocked), b"in the way").unwrap();

    let merged = MergedSnapshot {
        entities: vec![folder(kept, "new", 200), folder(blocked, "blocked", 200)],
        tombstones: Vec::new(),
    };
    assert!(applicator.apply_merged(&merged, ReplicaId::new()).is_err());

    assert_eq!(label_of(&storage, kept).as_deref(), Some("old"));
    assert_eq!(cached_labels(&storage), vec!["old"]);
    assert!(!storage.rebuilder.detect_drift().unwrap().has_drift());
    let clock = storage
        .db
        .with_conn(|c| EntityClock::new(c).get(EntityKind::Folder, kept))
        .unwrap()
        .unwrap();
    assert_eq!(clock.timestamp, ts(100));
}

#[test]
fn failed_remote_batch_removes_entities_it_created() {
    let dir = TempDir::new().unwrap();
    let (storage, applicator) = make_storage(&dir);
    let origin = ReplicaId::new();
    let (fresh, other) = (EntityId::new(), EntityId::new());
    let mut malformed = created(origin, 2, folder(other, "Other", 200));
    malformed.action_type = ActionType::Updated;

    let err = applicator
        .apply_remote(&[created(origin, 1, folder(fresh, "Fresh", 100)), malformed])
        .unwrap_err();

    assert!(matches!(err, SyncError::Storage(StorageError::InvalidData(_))));
    assert!(!storage.entities.entity_dir(EntityKind::Folder, fresh).exists());
    assert!(cached_labels(&storage).is_empty());
    storage
        .db
        .with_conn(|c| {
            assert!(OpLog::new(c).is_empty()?);
            assert_eq!(ReplicaRegistry::new(c).cursor(origin)?, None);
            Ok(())
        })
        .unwrap();
}

#[test]
fn failed_delete_restores_the_document() {
    let dir = TempDir::new().unwrap();
    let (storage, applicator) = make_storage(&dir);
    let origin = ReplicaId::new();
    let (doomed, other) = (EntityId::new(), EntityId::new());
    applicator
        .apply_remote(&[created(origin, 1, folder(doomed, "Doomed", 100))])
        .unwrap();
    let mut malformed = created(origin, 3, folder(other, "Other", 300));
    malformed.action_type = ActionType::Updated;

    assert!(
        applicator
            .apply_remote(&[deleted(origin, 2, doomed, 200), malformed])
            .is_err()
    );

    assert!(!storage.entities.is_deleted(EntityKind::Folder, doomed));
    assert_eq!(label_of(&storage, doomed).as_deref(), Some("Doomed"));
    assert_eq!(cached_labels(&storage), vec!["Doomed"]);
}
