use pretty_assertions::assert_eq;
use tempfile::TempDir;
use yaba_storage::{BookmarkQuery, CacheState, CacheWriter, StorageError, StoreConfig};
use yaba_sync::{ApplyOutcome, CompactionStats, LocalReplica, SyncConfig, SyncError};
use yaba_types::{
    Bookmark, Entity, EntityId, EntityKind, FieldChange, Folder, Highlight, HighlightAnchor,
    LinkDetail, Timestamp,
};

fn ts(ms: i64) -> Timestamp {
    Timestamp::from_millis(ms)
}

fn make_replica(dir: &TempDir) -> LocalReplica {
    LocalReplica::open(&StoreConfig::in_dir(dir.path()), SyncConfig::default()).unwrap()
}

fn make_bookmark(folder_id: EntityId, label: &str, url: &str) -> Entity {
    Entity::Bookmark {
        meta: Bookmark::new(folder_id, label, ts(1)),
        link: Some(LinkDetail::new(url)),
    }
}

fn make_highlight(bookmark_id: EntityId) -> Highlight {
    let anchor = |offset| HighlightAnchor {
        block_id: "p1".into(),
        inline_path: vec![0],
        offset,
    };
    Highlight {
        id: EntityId::new(),
        bookmark_id,
        content_version: 1,
        start_anchor: anchor(0),
        end_anchor: anchor(12),
        color_role: 2,
        note: Some("key point".into()),
        created_at: ts(10),
        edited_at: ts(10),
    }
}

fn all_bookmarks() -> BookmarkQuery {
    BookmarkQuery {
        include_hidden: true,
        ..Default::default()
    }
}

fn cache_rows(replica: &LocalReplica, table: &str) -> usize {
    replica.storage().cache_snapshot().unwrap().tables[table].len()
}

// ── Mutations ────────────────────────────────────────────────────

#[tokio::test]
async fn mutations_are_visible_through_the_cache() {
    let dir = TempDir::new().unwrap();
    let replica = make_replica(&dir);
    let folder = replica
        .create(Entity::Folder(Folder::new("Reading", ts(1))))
        .await
        .unwrap();
    let bookmark = replica
        .create(make_bookmark(folder.id(), "Tokio", "https://tokio.rs/tokio/tutorial"))
        .await
        .unwrap();

    let rows = replica.query().bookmarks(&all_bookmarks()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].label, "Tokio");
    assert_eq!(rows[0].folder_id, folder.id());
    assert_eq!(rows[0].url.as_deref(), Some("https://tokio.rs/tokio/tutorial"));

    let outcome = replica
        .update(
            EntityKind::Bookmark,
            bookmark.id(),
            vec![FieldChange::Label("Tokio tutorial".into()), FieldChange::Pinned(true)],
        )
        .await
        .unwrap();
    assert_eq!(outcome, ApplyOutcome::Applied);
    let rows = replica.query().bookmarks(&all_bookmarks()).unwrap();
    assert_eq!(rows[0].label, "Tokio tutorial");
    assert!(rows[0].is_pinned);

    replica
        .delete(EntityKind::Bookmark, bookmark.id())
        .await
        .unwrap();
    assert!(replica.query().bookmarks(&all_bookmarks()).unwrap().is_empty());
    assert_eq!(replica.get(EntityKind::Bookmark, bookmark.id()).await.unwrap(), None);
    let tombstones = replica.tombstones().await.unwrap();
    assert_eq!(tombstones.len(), 1);
    assert_eq!(tombstones[0].entity_id, bookmark.id());
}

#[tokio::test]
async fn every_edit_gets_a_later_timestamp() {
    let dir = TempDir::new().unwrap();
    let replica = make_replica(&dir);
    let created = replica
        .create(Entity::Folder(Folder::new("Inbox", ts(1))))
        .await
        .unwrap();
    assert!(created.edited_at() > ts(1));

    let mut previous = created.edited_at();
    for label in ["a", "b", "c"] {
        replica
            .update(EntityKind::Folder, created.id(), vec![FieldChange::Label(label.into())])
            .await
            .unwrap();
        let current = replica
            .get(EntityKind::Folder, created.id())
            .await
            .unwrap()
            .unwrap();
        assert!(current.edited_at() > previous);
        previous = current.edited_at();
    }

    replica.delete(EntityKind::Folder, created.id()).await.unwrap();
    let marker = replica.tombstones().await.unwrap().remove(0);
    assert!(marker.timestamp > previous);
}

#[tokio::test]
async fn recreate_after_delete_is_stamped_past_the_marker() {
    let dir = TempDir::new().unwrap();
    let replica = make_replica(&dir);
    let folder = replica
        .create(Entity::Folder(Folder::new("Inbox", ts(1))))
        .await
        .unwrap();
    replica.delete(EntityKind::Folder, folder.id()).await.unwrap();

    let again = replica.create(folder.clone()).await.unwrap();
    assert_eq!(
        replica.get(EntityKind::Folder, folder.id()).await.unwrap(),
        Some(again)
    );
    assert!(replica.tombstones().await.unwrap().is_empty());
}

#[tokio::test]
async fn update_of_unknown_entity_fails() {
    let dir = TempDir::new().unwrap();
    let replica = make_replica(&dir);
    let err = replica
        .update(EntityKind::Tag, EntityId::new(), vec![FieldChange::Color(3)])
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Storage(StorageError::NotFound(_))));
    assert_eq!(replica.heads().await.unwrap()[&replica.device_id()], 0);
}

#[tokio::test]
async fn delete_all_clears_one_kind() {
    let dir = TempDir::new().unwrap();
    let replica = make_replica(&dir);
    let folder = replica
        .create(Entity::Folder(Folder::new("Keep", ts(1))))
        .await
        .unwrap();
    for label in ["one", "two"] {
        replica
            .create(make_bookmark(folder.id(), label, "https://example.com"))
            .await
            .unwrap();
    }

    replica.delete_all(EntityKind::Bookmark).await.unwrap();

    assert!(replica.query().bookmarks(&all_bookmarks()).unwrap().is_empty());
    let snapshot = replica.snapshot().await.unwrap();
    assert_eq!(snapshot, vec![folder]);
    assert_eq!(replica.tombstones().await.unwrap().len(), 2);
}

#[tokio::test]
async fn heads_count_local_ops() {
    let dir = TempDir::new().unwrap();
    let replica = make_replica(&dir);
    for label in ["a", "b"] {
        replica
            .create(Entity::Folder(Folder::new(label, ts(1))))
            .await
            .unwrap();
    }
    let heads = replica.heads().await.unwrap();
    assert_eq!(heads.len(), 1);
    assert_eq!(heads[&replica.device_id()], 2);
}

#[tokio::test]
async fn identity_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let first = make_replica(&dir).device_id();
    let second = make_replica(&dir).device_id();
    assert_eq!(first, second);
}

// ── Bookmark content ─────────────────────────────────────────────

#[tokio::test]
async fn bookmark_content_is_indexed() {
    let dir = TempDir::new().unwrap();
    let replica = make_replica(&dir);
    let bookmark = replica
        .create(make_bookmark(EntityId::new(), "Article", "https://example.com/a"))
        .await
        .unwrap();

    replica
        .add_readable_version(bookmark.id(), 1, "# Article".into())
        .await
        .unwrap();
    replica
        .add_asset(bookmark.id(), "cover".into(), "png".into(), vec![0x89, 0x50])
        .await
        .unwrap();
    replica
        .add_highlight(make_highlight(bookmark.id()))
        .await
        .unwrap();

    assert_eq!(cache_rows(&replica, "readable_versions"), 1);
    assert_eq!(cache_rows(&replica, "assets"), 1);
    assert_eq!(cache_rows(&replica, "highlights"), 1);
    let aux = replica.storage().entities.aux(bookmark.id()).unwrap();
    assert_eq!(aux.highlights[0].note.as_deref(), Some("key point"));
}

#[tokio::test]
async fn content_for_unknown_bookmark_is_rejected() {
    let dir = TempDir::new().unwrap();
    let replica = make_replica(&dir);
    let missing = EntityId::new();

    let err = replica.add_highlight(make_highlight(missing)).await.unwrap_err();
    assert!(matches!(err, SyncError::Storage(StorageError::NotFound(_))));
    let err = replica
        .add_readable_version(missing, 1, "text".into())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Storage(StorageError::NotFound(_))));
    assert!(
        !replica
            .storage()
            .entities
            .entity_dir(EntityKind::Bookmark, missing)
            .exists()
    );
}

// ── Cache maintenance ────────────────────────────────────────────

#[tokio::test]
async fn drift_is_detected_and_repaired() {
    let dir = TempDir::new().unwrap();
    let replica = make_replica(&dir);
    let folder = replica
        .create(Entity::Folder(Folder::new("Inbox", ts(1))))
        .await
        .unwrap();
    replica
        .storage()
        .db
        .with_conn(|c| CacheWriter::new(c).delete(EntityKind::Folder, folder.id()))
        .unwrap();

    let report = replica.detect_drift().await.unwrap();
    assert!(
        report
            .missing_in_cache
            .contains(&(EntityKind::Folder, folder.id()))
    );
    assert_eq!(replica.cache_status().current(), CacheState::SyncNeeded);

    let stats = replica.fix_drift().await.unwrap();
    assert_eq!(stats.inserted, 1);
    assert_eq!(replica.cache_status().current(), CacheState::InSync);
    assert!(!replica.detect_drift().await.unwrap().has_drift());
}

#[tokio::test]
async fn rebuild_reproduces_the_write_through_cache() {
    let dir = TempDir::new().unwrap();
    let replica = make_replica(&dir);
    let folder = replica
        .create(Entity::Folder(Folder::new("Reading", ts(1))))
        .await
        .unwrap();
    let bookmark = replica
        .create(make_bookmark(folder.id(), "Post", "https://example.org/post"))
        .await
        .unwrap();
    replica
        .add_highlight(make_highlight(bookmark.id()))
        .await
        .unwrap();
    let before = replica.storage().cache_snapshot().unwrap();

    replica.rebuild_from_filesystem().await.unwrap();

    assert_eq!(replica.storage().cache_snapshot().unwrap(), before);
    assert_eq!(replica.cache_status().current(), CacheState::InSync);
}

// ── Compaction ───────────────────────────────────────────────────

#[tokio::test]
async fn compaction_without_peers_keeps_everything() {
    let dir = TempDir::new().unwrap();
    let replica = make_replica(&dir);
    let folder = replica
        .create(Entity::Folder(Folder::new("Inbox", ts(1))))
        .await
        .unwrap();
    replica.delete(EntityKind::Folder, folder.id()).await.unwrap();

    let stats = replica.compact().await.unwrap();
    assert_eq!(stats, CompactionStats::default());
    assert_eq!(replica.tombstones().await.unwrap().len(), 1);
}
