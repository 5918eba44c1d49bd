//! Entity documents stored in the filesystem.
//!
//! Each entity is a JSON document addressed by its kind and id. The relational
//! cache is a projection of these documents and never the other way round.

use crate::{EntityId, Error, FieldChange, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The three kinds of top-level entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Folder,
    Tag,
    Bookmark,
}

impl EntityKind {
    /// All kinds, in dependency order (folders before the bookmarks that
    /// reference them).
    pub const ALL: [Self; 3] = [Self::Folder, Self::Tag, Self::Bookmark];

    /// Directory name under the store root.
    #[must_use]
    pub const fn dir_name(&self) -> &'static str {
        match self {
            Self::Folder => "folders",
            Self::Tag => "tags",
            Self::Bookmark => "bookmarks",
        }
    }

    /// Stable string used in database rows and op-log entries.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Folder => "folder",
            Self::Tag => "tag",
            Self::Bookmark => "bookmark",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "folder" => Ok(Self::Folder),
            "tag" => Ok(Self::Tag),
            "bookmark" => Ok(Self::Bookmark),
            other => Err(Error::UnknownEntityKind(other.to_string())),
        }
    }
}

/// `folders/<id>/meta.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: EntityId,
    #[serde(default)]
    pub parent_id: Option<EntityId>,
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub color: i32,
    #[serde(default)]
    pub order: i32,
    pub created_at: Timestamp,
    pub edited_at: Timestamp,
    #[serde(default)]
    pub is_hidden: bool,
}

impl Folder {
    /// Creates a top-level folder stamped with `now`.
    #[must_use]
    pub fn new(label: impl Into<String>, now: Timestamp) -> Self {
        Self {
            id: EntityId::new(),
            parent_id: None,
            label: label.into(),
            description: None,
            icon: String::new(),
            color: 0,
            order: 0,
            created_at: now,
            edited_at: now,
            is_hidden: false,
        }
    }
}

/// `tags/<id>/meta.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: EntityId,
    pub label: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub color: i32,
    #[serde(default)]
    pub order: i32,
    pub created_at: Timestamp,
    pub edited_at: Timestamp,
    #[serde(default)]
    pub is_hidden: bool,
}

impl Tag {
    #[must_use]
    pub fn new(label: impl Into<String>, now: Timestamp) -> Self {
        Self {
            id: EntityId::new(),
            label: label.into(),
            icon: String::new(),
            color: 0,
            order: 0,
            created_at: now,
            edited_at: now,
            is_hidden: false,
        }
    }
}

/// `bookmarks/<id>/meta.json`
///
/// Tag membership lives here as `tag_ids`; the cache's tag/bookmark cross
/// reference table is derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    pub id: EntityId,
    pub folder_id: EntityId,
    /// Bookmark kind code. `0` is a link.
    #[serde(default)]
    pub kind: i32,
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: Timestamp,
    pub edited_at: Timestamp,
    #[serde(default)]
    pub view_count: i64,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default)]
    pub is_hidden: bool,
    #[serde(default)]
    pub local_image_path: Option<String>,
    #[serde(default)]
    pub local_icon_path: Option<String>,
    #[serde(default)]
    pub tag_ids: Vec<EntityId>,
}

impl Bookmark {
    #[must_use]
    pub fn new(folder_id: EntityId, label: impl Into<String>, now: Timestamp) -> Self {
        Self {
            id: EntityId::new(),
            folder_id,
            kind: 0,
            label: label.into(),
            description: None,
            created_at: now,
            edited_at: now,
            view_count: 0,
            is_private: false,
            is_pinned: false,
            is_hidden: false,
            local_image_path: None,
            local_icon_path: None,
            tag_ids: Vec::new(),
        }
    }
}

/// `bookmarks/<id>/link.json`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkDetail {
    pub url: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub link_type: i32,
    #[serde(default)]
    pub video_url: Option<String>,
}

impl LinkDetail {
    /// Creates a link detail, deriving the domain from the URL's authority.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let domain = domain_of(&url);
        Self {
            url,
            domain,
            link_type: 0,
            video_url: None,
        }
    }
}

fn domain_of(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = host.rsplit_once('@').map_or(host, |(_, h)| h);
    let host = host.split(':').next().unwrap_or_default();
    host.trim_start_matches("www.").to_ascii_lowercase()
}

/// Position inside a readable document: block id, child path, char offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HighlightAnchor {
    pub block_id: String,
    #[serde(default)]
    pub inline_path: Vec<u32>,
    pub offset: u32,
}

/// `bookmarks/<id>/highlights/<highlightId>.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Highlight {
    pub id: EntityId,
    pub bookmark_id: EntityId,
    pub content_version: u32,
    pub start_anchor: HighlightAnchor,
    pub end_anchor: HighlightAnchor,
    #[serde(default)]
    pub color_role: i32,
    #[serde(default)]
    pub note: Option<String>,
    pub created_at: Timestamp,
    pub edited_at: Timestamp,
}

/// A `readable/v<N>.md` file found under a bookmark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadableVersion {
    pub bookmark_id: EntityId,
    pub version: u32,
    /// Path relative to the bookmark directory.
    pub relative_path: String,
}

/// An `assets/<assetId>.<ext>` file found under a bookmark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: String,
    pub bookmark_id: EntityId,
    pub extension: String,
    pub relative_path: String,
}

/// Any top-level entity, as exchanged in snapshots and `Created` ops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Entity {
    Folder(Folder),
    Tag(Tag),
    Bookmark {
        meta: Bookmark,
        #[serde(default)]
        link: Option<LinkDetail>,
    },
}

impl Entity {
    #[must_use]
    pub const fn id(&self) -> EntityId {
        match self {
            Self::Folder(f) => f.id,
            Self::Tag(t) => t.id,
            Self::Bookmark { meta, .. } => meta.id,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Folder(_) => EntityKind::Folder,
            Self::Tag(_) => EntityKind::Tag,
            Self::Bookmark { .. } => EntityKind::Bookmark,
        }
    }

    #[must_use]
    pub const fn edited_at(&self) -> Timestamp {
        match self {
            Self::Folder(f) => f.edited_at,
            Self::Tag(t) => t.edited_at,
            Self::Bookmark { meta, .. } => meta.edited_at,
        }
    }

    pub fn set_edited_at(&mut self, at: Timestamp) {
        match self {
            Self::Folder(f) => f.edited_at = at,
            Self::Tag(t) => t.edited_at = at,
            Self::Bookmark { meta, .. } => meta.edited_at = at,
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Folder(f) => &f.label,
            Self::Tag(t) => &t.label,
            Self::Bookmark { meta, .. } => &meta.label,
        }
    }

    /// Applies a list of typed field deltas in order.
    ///
    /// Fails without partial effect if any change does not apply to this kind.
    pub fn apply_changes(&mut self, changes: &[FieldChange]) -> Result<()> {
        let mut next = self.clone();
        for change in changes {
            next.apply_change(change)?;
        }
        *self = next;
        Ok(())
    }

    fn apply_change(&mut self, change: &FieldChange) -> Result<()> {
        let kind = self.kind();
        let mismatch = || Error::FieldMismatch {
            change: change.name(),
            kind,
        };

        match (self, change) {
            (Self::Folder(f), FieldChange::Label(v)) => f.label.clone_from(v),
            (Self::Tag(t), FieldChange::Label(v)) => t.label.clone_from(v),
            (Self::Bookmark { meta, .. }, FieldChange::Label(v)) => meta.label.clone_from(v),

            (Self::Folder(f), FieldChange::Description(v)) => f.description.clone_from(v),
            (Self::Bookmark { meta, .. }, FieldChange::Description(v)) => {
                meta.description.clone_from(v);
            }

            (Self::Folder(f), FieldChange::Icon(v)) => f.icon.clone_from(v),
            (Self::Tag(t), FieldChange::Icon(v)) => t.icon.clone_from(v),
            (Self::Folder(f), FieldChange::Color(v)) => f.color = *v,
            (Self::Tag(t), FieldChange::Color(v)) => t.color = *v,
            (Self::Folder(f), FieldChange::Order(v)) => f.order = *v,
            (Self::Tag(t), FieldChange::Order(v)) => t.order = *v,

            (Self::Folder(f), FieldChange::Hidden(v)) => f.is_hidden = *v,
            (Self::Tag(t), FieldChange::Hidden(v)) => t.is_hidden = *v,
            (Self::Bookmark { meta, .. }, FieldChange::Hidden(v)) => meta.is_hidden = *v,

            (Self::Folder(f), FieldChange::ParentId(v)) => f.parent_id = *v,

            (Self::Bookmark { meta, .. }, FieldChange::FolderId(v)) => meta.folder_id = *v,
            (Self::Bookmark { meta, .. }, FieldChange::BookmarkKind(v)) => meta.kind = *v,
            (Self::Bookmark { meta, .. }, FieldChange::ViewCount(v)) => meta.view_count = *v,
            (Self::Bookmark { meta, .. }, FieldChange::Private(v)) => meta.is_private = *v,
            (Self::Bookmark { meta, .. }, FieldChange::Pinned(v)) => meta.is_pinned = *v,
            (Self::Bookmark { meta, .. }, FieldChange::LocalImagePath(v)) => {
                meta.local_image_path.clone_from(v);
            }
            (Self::Bookmark { meta, .. }, FieldChange::LocalIconPath(v)) => {
                meta.local_icon_path.clone_from(v);
            }
            (Self::Bookmark { meta, .. }, FieldChange::TagIds(v)) => {
                meta.tag_ids = dedup_ids(v);
            }
            (Self::Bookmark { meta, .. }, FieldChange::AddTag(v)) => {
                if !meta.tag_ids.contains(v) {
                    meta.tag_ids.push(*v);
                }
            }
            (Self::Bookmark { meta, .. }, FieldChange::RemoveTag(v)) => {
                meta.tag_ids.retain(|id| id != v);
            }

            (Self::Bookmark { link, .. }, FieldChange::Url(v)) => {
                let fresh = LinkDetail::new(v.clone());
                if let Some(l) = link.as_mut() {
                    l.url = fresh.url;
                    l.domain = fresh.domain;
                } else {
                    *link = Some(fresh);
                }
            }
            (Self::Bookmark { link, .. }, FieldChange::LinkType(v)) => {
                link.get_or_insert_with(LinkDetail::default).link_type = *v;
            }
            (Self::Bookmark { link, .. }, FieldChange::VideoUrl(v)) => {
                link.get_or_insert_with(LinkDetail::default)
                    .video_url
                    .clone_from(v);
            }

            _ => return Err(mismatch()),
        }
        Ok(())
    }
}

fn dedup_ids(ids: &[EntityId]) -> Vec<EntityId> {
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(id) {
            out.push(*id);
        }
    }
    out
}
