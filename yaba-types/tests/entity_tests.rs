use pretty_assertions::assert_eq;
use yaba_types::{
    ActionType, Bookmark, Entity, EntityId, EntityKind, Error, FieldChange, Folder, LinkDetail,
    OpDraft, OpPayload, ReplicaId, Tag, Timestamp,
};

fn ts(ms: i64) -> Timestamp {
    Timestamp::from_millis(ms)
}

fn make_bookmark() -> Entity {
    let folder = EntityId::new();
    Entity::Bookmark {
        meta: Bookmark::new(folder, "Rust book", ts(10)),
        link: Some(LinkDetail::new("https://www.Rust-Lang.org:443/learn?x=1")),
    }
}

// ── EntityKind ────────────────────────────────────────────────────

#[test]
fn kind_names_roundtrip() {
    for kind in EntityKind::ALL {
        assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
    }
    assert_eq!(EntityKind::Bookmark.dir_name(), "bookmarks");
    assert!(matches!(
        "widget".parse::<EntityKind>(),
        Err(Error::UnknownEntityKind(_))
    ));
}

// ── Documents ─────────────────────────────────────────────────────

#[test]
fn folder_document_is_camel_case_and_tolerates_missing_fields() {
    let id = EntityId::new();
    let json = format!(
        r#"{{"id":"{id}","label":"Work","createdAt":1,"editedAt":2,"unknownKey":true}}"#
    );
    let folder: Folder = serde_json::from_str(&json).unwrap();
    assert_eq!(folder.id, id);
    assert_eq!(folder.parent_id, None);
    assert!(!folder.is_hidden);

    let out = serde_json::to_value(&folder).unwrap();
    assert!(out.get("parentId").is_some());
    assert!(out.get("editedAt").is_some());
}

#[test]
fn link_detail_derives_domain() {
    let link = LinkDetail::new("https://www.Rust-Lang.org:443/learn?x=1");
    assert_eq!(link.domain, "rust-lang.org");
    assert_eq!(LinkDetail::new("example.com/a").domain, "example.com");
}

#[test]
fn entity_serde_is_tagged() {
    let entity = make_bookmark();
    let json = serde_json::to_value(&entity).unwrap();
    assert_eq!(json["type"], "bookmark");
    let back: Entity = serde_json::from_value(json).unwrap();
    assert_eq!(back, entity);
}

// ── Field changes ─────────────────────────────────────────────────

#[test]
fn apply_changes_updates_bookmark_fields() {
    let mut entity = make_bookmark();
    let tag = EntityId::new();
    entity
        .apply_changes(&[
            FieldChange::Label("Renamed".into()),
            FieldChange::AddTag(tag),
            FieldChange::AddTag(tag),
            FieldChange::Url("https://docs.rs/serde".into()),
        ])
        .unwrap();

    let Entity::Bookmark { meta, link } = entity else {
        panic!("expected bookmark");
    };
    assert_eq!(meta.label, "Renamed");
    assert_eq!(meta.tag_ids, vec![tag]);
    let link = link.unwrap();
    assert_eq!(link.url, "https://docs.rs/serde");
    assert_eq!(link.domain, "docs.rs");
}

#[test]
fn remove_tag_and_tag_ids_dedup() {
    let mut entity = make_bookmark();
    let a = EntityId::new();
    let b = EntityId::new();
    entity
        .apply_changes(&[FieldChange::TagIds(vec![a, b, a]), FieldChange::RemoveTag(b)])
        .unwrap();
    let Entity::Bookmark { meta, .. } = entity else {
        panic!("expected bookmark");
    };
    assert_eq!(meta.tag_ids, vec![a]);
}

#[test]
fn tag_edits_share_one_document_field() {
    let tag = EntityId::new();
    assert_eq!(FieldChange::AddTag(tag).field(), "tagIds");
    assert_eq!(FieldChange::RemoveTag(tag).field(), "tagIds");
    assert_eq!(FieldChange::TagIds(vec![tag]).field(), "tagIds");
    assert_eq!(FieldChange::Color(3).field(), "color");
    assert_eq!(FieldChange::Hidden(true).field(), "isHidden");
}

#[test]
fn mismatched_change_fails_without_partial_effect() {
    let mut entity = Entity::Tag(Tag::new("rust", ts(1)));
    let before = entity.clone();
    let err = entity
        .apply_changes(&[
            FieldChange::Label("changed".into()),
            FieldChange::FolderId(EntityId::new()),
        ])
        .unwrap_err();
    assert!(matches!(err, Error::FieldMismatch { change: "folderId", kind: EntityKind::Tag }));
    assert_eq!(entity, before);
}

#[test]
fn set_edited_at_applies_to_all_kinds() {
    let mut folder = Entity::Folder(Folder::new("f", ts(1)));
    folder.set_edited_at(ts(99));
    assert_eq!(folder.edited_at(), ts(99));
}

// ── Ops ───────────────────────────────────────────────────────────

#[test]
fn created_draft_carries_document_and_time() {
    let entity = make_bookmark();
    let draft = OpDraft::created(entity.clone());
    assert_eq!(draft.action_type, ActionType::Created);
    assert_eq!(draft.entity_id, entity.id());
    assert_eq!(draft.happened_at, ts(10));

    let origin = ReplicaId::new();
    let op = draft.stamp(origin, 7);
    assert_eq!(op.key(), (origin, 7));
    assert_eq!(op.payload, OpPayload::Document(entity));
}

#[test]
fn deleted_all_addresses_every_entity() {
    let op = OpDraft::deleted_all(EntityKind::Tag, ts(5)).stamp(ReplicaId::new(), 1);
    assert_eq!(op.entity_id, EntityId::ALL);
    assert_eq!(op.payload, OpPayload::Empty);
}

#[test]
fn op_entry_json_shape() {
    let id = EntityId::new();
    let op = OpDraft::updated(
        EntityKind::Folder,
        id,
        vec![FieldChange::Hidden(true)],
        ts(3),
    )
    .stamp(ReplicaId::new(), 2);
    let json = serde_json::to_value(&op).unwrap();
    assert_eq!(json["actionType"], "Updated");
    assert_eq!(json["payload"]["op"], "fields");
    assert_eq!(json["payload"]["data"][0]["field"], "hidden");
    assert_eq!(json["payload"]["data"][0]["value"], true);
}
