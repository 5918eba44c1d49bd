//! Op-log entries for device-to-device replication.
//!
//! An op is an immutable record of one mutation. `(origin_device_id,
//! origin_seq)` is globally unique and is the idempotency key: applying the
//! same op twice has the same effect as applying it once.

use crate::{Entity, EntityId, EntityKind, ReplicaId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What an op did to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    Created,
    Updated,
    Deleted,
    DeletedAll,
}

impl ActionType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Updated => "Updated",
            Self::Deleted => "Deleted",
            Self::DeletedAll => "DeletedAll",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed field delta carried by an `Updated` op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "camelCase")]
pub enum FieldChange {
    Label(String),
    Description(Option<String>),
    Icon(String),
    Color(i32),
    Order(i32),
    Hidden(bool),
    ParentId(Option<EntityId>),
    FolderId(EntityId),
    BookmarkKind(i32),
    ViewCount(i64),
    Private(bool),
    Pinned(bool),
    LocalImagePath(Option<String>),
    LocalIconPath(Option<String>),
    TagIds(Vec<EntityId>),
    AddTag(EntityId),
    RemoveTag(EntityId),
    Url(String),
    LinkType(i32),
    VideoUrl(Option<String>),
}

impl FieldChange {
    /// Field name, for logging and error messages.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Label(_) => "label",
            Self::Description(_) => "description",
            Self::Icon(_) => "icon",
            Self::Color(_) => "color",
            Self::Order(_) => "order",
            Self::Hidden(_) => "isHidden",
            Self::ParentId(_) => "parentId",
            Self::FolderId(_) => "folderId",
            Self::BookmarkKind(_) => "kind",
            Self::ViewCount(_) => "viewCount",
            Self::Private(_) => "isPrivate",
            Self::Pinned(_) => "isPinned",
            Self::LocalImagePath(_) => "localImagePath",
            Self::LocalIconPath(_) => "localIconPath",
            Self::TagIds(_) => "tagIds",
            Self::AddTag(_) => "addTag",
            Self::RemoveTag(_) => "removeTag",
            Self::Url(_) => "url",
            Self::LinkType(_) => "linkType",
            Self::VideoUrl(_) => "videoUrl",
        }
    }

    /// The document field this change writes. Tag edits all land on
    /// `tagIds`, so they compete as one field.
    #[must_use]
    pub const fn field(&self) -> &'static str {
        match self {
            Self::TagIds(_) | Self::AddTag(_) | Self::RemoveTag(_) => "tagIds",
            other => other.name(),
        }
    }
}

/// Body of an op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "data", rename_all = "camelCase")]
pub enum OpPayload {
    /// Full document, carried by `Created`.
    Document(Entity),
    /// Field deltas, carried by `Updated`.
    Fields(Vec<FieldChange>),
    /// `Deleted` and `DeletedAll` need nothing beyond the address.
    Empty,
}

/// An immutable, stamped op-log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpLogEntry {
    pub origin_device_id: ReplicaId,
    pub origin_seq: u64,
    pub entity_type: EntityKind,
    /// `EntityId::ALL` for `DeletedAll`.
    pub entity_id: EntityId,
    pub action_type: ActionType,
    pub payload: OpPayload,
    /// Logical timestamp of the mutation; compared against the entity clock.
    pub happened_at: Timestamp,
}

impl OpLogEntry {
    /// The idempotency key.
    #[must_use]
    pub const fn key(&self) -> (ReplicaId, u64) {
        (self.origin_device_id, self.origin_seq)
    }
}

/// A local mutation that has not yet been stamped with origin and sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpDraft {
    pub entity_type: EntityKind,
    pub entity_id: EntityId,
    pub action_type: ActionType,
    pub payload: OpPayload,
    pub happened_at: Timestamp,
}

impl OpDraft {
    /// Draft for a newly created entity.
    #[must_use]
    pub fn created(entity: Entity) -> Self {
        Self {
            entity_type: entity.kind(),
            entity_id: entity.id(),
            action_type: ActionType::Created,
            happened_at: entity.edited_at(),
            payload: OpPayload::Document(entity),
        }
    }

    /// Draft for a field-level update.
    #[must_use]
    pub fn updated(
        kind: EntityKind,
        id: EntityId,
        changes: Vec<FieldChange>,
        at: Timestamp,
    ) -> Self {
        Self {
            entity_type: kind,
            entity_id: id,
            action_type: ActionType::Updated,
            payload: OpPayload::Fields(changes),
            happened_at: at,
        }
    }

    #[must_use]
    pub fn deleted(kind: EntityKind, id: EntityId, at: Timestamp) -> Self {
        Self {
            entity_type: kind,
            entity_id: id,
            action_type: ActionType::Deleted,
            payload: OpPayload::Empty,
            happened_at: at,
        }
    }

    #[must_use]
    pub fn deleted_all(kind: EntityKind, at: Timestamp) -> Self {
        Self {
            entity_type: kind,
            entity_id: EntityId::ALL,
            action_type: ActionType::DeletedAll,
            payload: OpPayload::Empty,
            happened_at: at,
        }
    }

    /// Stamps the draft with its origin and sequence number.
    #[must_use]
    pub fn stamp(self, origin: ReplicaId, seq: u64) -> OpLogEntry {
        OpLogEntry {
            origin_device_id: origin,
            origin_seq: seq,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            action_type: self.action_type,
            payload: self.payload,
            happened_at: self.happened_at,
        }
    }
}
