//! Relational cache rows: write-through, repair and the read-only query surface.
//!
//! Every row here is a projection of an entity store document. The same
//! [`CacheWriter::upsert`] is used by local write-through, drift repair and
//! full rebuilds, so all three paths produce identical rows.

use crate::database::{CACHE_TABLES, Database};
use crate::entity_store::BookmarkAux;
use crate::error::{StorageError, StorageResult};
use crate::state::CacheStatus;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::{BTreeMap, HashSet};
use yaba_types::{Bookmark, Entity, EntityId, EntityKind, Folder, LinkDetail, Tag, Timestamp};

const REBUILD_PENDING_KEY: &str = "rebuild_pending";

/// Writes cache rows through a borrowed connection or transaction.
pub struct CacheWriter<'c> {
    conn: &'c Connection,
}

impl<'c> CacheWriter<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Inserts or updates the rows for one entity.
    ///
    /// For bookmarks this also replaces the link row, the tag cross refs
    /// (derived from `tag_ids`) and the auxiliary indexes from `aux`.
    /// Upserts never delete the parent row, so cascades do not fire.
    pub fn upsert(&self, entity: &Entity, aux: Option<&BookmarkAux>) -> StorageResult<()> {
        match entity {
            Entity::Folder(folder) => self.upsert_folder(folder),
            Entity::Tag(tag) => self.upsert_tag(tag),
            Entity::Bookmark { meta, link } => {
                self.upsert_bookmark(meta)?;
                self.replace_link(meta.id, link.as_ref())?;
                self.replace_tag_refs(meta)?;
                self.replace_aux(meta.id, aux)
            }
        }
    }

    /// Removes an entity's rows. Bookmark children go with it by cascade.
    pub fn delete(&self, kind: EntityKind, id: EntityId) -> StorageResult<bool> {
        let sql = match kind {
            EntityKind::Folder => "DELETE FROM folders WHERE id = ?1",
            EntityKind::Tag => "DELETE FROM tags WHERE id = ?1",
            EntityKind::Bookmark => "DELETE FROM bookmarks WHERE id = ?1",
        };
        let n = self.conn.execute(sql, params![id.to_string()])?;
        Ok(n > 0)
    }

    /// Ids of every cached entity of `kind`.
    pub fn ids(&self, kind: EntityKind) -> StorageResult<HashSet<EntityId>> {
        let sql = match kind {
            EntityKind::Folder => "SELECT id FROM folders",
            EntityKind::Tag => "SELECT id FROM tags",
            EntityKind::Bookmark => "SELECT id FROM bookmarks",
        };
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = HashSet::new();
        for raw in rows {
            let raw = raw?;
            let id = EntityId::parse(&raw)
                .map_err(|e| StorageError::InvalidData(format!("cached id {raw}: {e}")))?;
            ids.insert(id);
        }
        Ok(ids)
    }

    /// Empties every cache table. Replication tables are untouched.
    pub fn clear(&self) -> StorageResult<()> {
        for table in CACHE_TABLES {
            self.conn.execute(&format!("DELETE FROM {table}"), [])?;
        }
        Ok(())
    }

    // ── Rebuild marker ───────────────────────────────────────────

    /// Marks a full rebuild as started. Cleared by
    /// [`clear_rebuild_pending`](Self::clear_rebuild_pending) in the same
    /// transaction that finishes the rebuild.
    pub fn set_rebuild_pending(&self) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO cache_meta (key, value) VALUES (?1, '1')
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![REBUILD_PENDING_KEY],
        )?;
        Ok(())
    }

    pub fn clear_rebuild_pending(&self) -> StorageResult<()> {
        self.conn.execute(
            "DELETE FROM cache_meta WHERE key = ?1",
            params![REBUILD_PENDING_KEY],
        )?;
        Ok(())
    }

    pub fn is_rebuild_pending(&self) -> StorageResult<bool> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM cache_meta WHERE key = ?1",
                params![REBUILD_PENDING_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.is_some())
    }

    // ── Rows ─────────────────────────────────────────────────────

    fn upsert_folder(&self, f: &Folder) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO folders (id, parent_id, label, description, icon, color, sort_order,
                                  created_at, edited_at, is_hidden)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                parent_id = excluded.parent_id, label = excluded.label,
                description = excluded.description, icon = excluded.icon,
                color = excluded.color, sort_order = excluded.sort_order,
                created_at = excluded.created_at, edited_at = excluded.edited_at,
                is_hidden = excluded.is_hidden",
            params![
                f.id.to_string(),
                f.parent_id.map(|p| p.to_string()),
                f.label,
                f.description,
                f.icon,
                f.color,
                f.order,
                f.created_at.as_millis(),
                f.edited_at.as_millis(),
                f.is_hidden,
            ],
        )?;
        Ok(())
    }

    fn upsert_tag(&self, t: &Tag) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO tags (id, label, icon, color, sort_order, created_at, edited_at, is_hidden)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                label = excluded.label, icon = excluded.icon, color = excluded.color,
                sort_order = excluded.sort_order, created_at = excluded.created_at,
                edited_at = excluded.edited_at, is_hidden = excluded.is_hidden",
            params![
                t.id.to_string(),
                t.label,
                t.icon,
                t.color,
                t.order,
                t.created_at.as_millis(),
                t.edited_at.as_millis(),
                t.is_hidden,
            ],
        )?;
        Ok(())
    }

    fn upsert_bookmark(&self, b: &Bookmark) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO bookmarks (id, folder_id, kind, label, description, created_at, edited_at,
                                    view_count, is_private, is_pinned, is_hidden,
                                    local_image_path, local_icon_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO UPDATE SET
                folder_id = excluded.folder_id, kind = excluded.kind, label = excluded.label,
                description = excluded.description, created_at = excluded.created_at,
                edited_at = excluded.edited_at, view_count = excluded.view_count,
                is_private = excluded.is_private, is_pinned = excluded.is_pinned,
                is_hidden = excluded.is_hidden, local_image_path = excluded.local_image_path,
                local_icon_path = excluded.local_icon_path",
            params![
                b.id.to_string(),
                b.folder_id.to_string(),
                b.kind,
                b.label,
                b.description,
                b.created_at.as_millis(),
                b.edited_at.as_millis(),
                b.view_count,
                b.is_private,
                b.is_pinned,
                b.is_hidden,
                b.local_image_path,
                b.local_icon_path,
            ],
        )?;
        Ok(())
    }

    fn replace_link(&self, bookmark_id: EntityId, link: Option<&LinkDetail>) -> StorageResult<()> {
        let id = bookmark_id.to_string();
        self.conn
            .execute("DELETE FROM link_details WHERE bookmark_id = ?1", params![id])?;
        if let Some(link) = link {
            self.conn.execute(
                "INSERT INTO link_details (bookmark_id, url, domain, link_type, video_url)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, link.url, link.domain, link.link_type, link.video_url],
            )?;
        }
        Ok(())
    }

    fn replace_tag_refs(&self, b: &Bookmark) -> StorageResult<()> {
        let id = b.id.to_string();
        self.conn
            .execute("DELETE FROM tag_bookmarks WHERE bookmark_id = ?1", params![id])?;
        let mut stmt = self.conn.prepare(
            "INSERT OR IGNORE INTO tag_bookmarks (tag_id, bookmark_id) VALUES (?1, ?2)",
        )?;
        for tag_id in &b.tag_ids {
            stmt.execute(params![tag_id.to_string(), id])?;
        }
        Ok(())
    }

    fn replace_aux(&self, bookmark_id: EntityId, aux: Option<&BookmarkAux>) -> StorageResult<()> {
        let id = bookmark_id.to_string();
        for table in ["readable_versions", "assets", "highlights"] {
            self.conn.execute(
                &format!("DELETE FROM {table} WHERE bookmark_id = ?1"),
                params![id],
            )?;
        }
        let Some(aux) = aux else {
            return Ok(());
        };

        for r in &aux.readable_versions {
            self.conn.execute(
                "INSERT INTO readable_versions (bookmark_id, version, relative_path)
                 VALUES (?1, ?2, ?3)",
                params![id, r.version, r.relative_path],
            )?;
        }
        for a in &aux.assets {
            self.conn.execute(
                "INSERT INTO assets (bookmark_id, id, extension, relative_path)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, a.id, a.extension, a.relative_path],
            )?;
        }
        for h in &aux.highlights {
            // Keyed within the bookmark whose directory holds the file, so the
            // same highlight id under two bookmarks yields two rows.
            self.conn.execute(
                "INSERT INTO highlights (id, bookmark_id, content_version, start_anchor,
                                         end_anchor, color_role, note, created_at, edited_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    h.id.to_string(),
                    id,
                    h.content_version,
                    serde_json::to_string(&h.start_anchor)?,
                    serde_json::to_string(&h.end_anchor)?,
                    h.color_role,
                    h.note,
                    h.created_at.as_millis(),
                    h.edited_at.as_millis(),
                ],
            )?;
        }
        Ok(())
    }
}

// ── Snapshot ─────────────────────────────────────────────────────

/// Every cache row, per table, in a canonical order. Two caches built from
/// the same entity store compare equal regardless of insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSnapshot {
    pub tables: BTreeMap<&'static str, Vec<Vec<Value>>>,
}

impl CacheSnapshot {
    pub fn capture(conn: &Connection) -> StorageResult<Self> {
        let mut tables = BTreeMap::new();
        for table in CACHE_TABLES {
            let mut stmt = conn.prepare(&format!("SELECT * FROM {table}"))?;
            let width = stmt.column_count();
            let mut rows: Vec<Vec<Value>> = stmt
                .query_map([], |row| {
                    (0..width).map(|i| row.get::<_, Value>(i)).collect()
                })?
                .collect::<Result<_, _>>()?;
            rows.sort_by_cached_key(|row| format!("{row:?}"));
            tables.insert(table, rows);
        }
        Ok(Self { tables })
    }

    /// Total number of rows across all tables.
    pub fn row_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }
}

// ── Queries ──────────────────────────────────────────────────────

/// Sort key for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    /// User-defined order (folders and tags); bookmarks fall back to label.
    Custom,
    Label,
    CreatedAt,
    #[default]
    EditedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

/// Filter and ordering for a bookmark listing.
#[derive(Debug, Clone, Default)]
pub struct BookmarkQuery {
    pub folder_id: Option<EntityId>,
    pub tag_id: Option<EntityId>,
    /// Substring matched against label and description.
    pub text: Option<String>,
    pub include_hidden: bool,
    pub sort: SortKey,
    pub order: SortOrder,
}

/// A bookmark row as served to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookmarkRow {
    pub id: EntityId,
    pub folder_id: EntityId,
    pub label: String,
    pub description: Option<String>,
    pub url: Option<String>,
    pub domain: Option<String>,
    pub created_at: Timestamp,
    pub edited_at: Timestamp,
    pub is_pinned: bool,
    pub is_hidden: bool,
}

/// A folder or tag row as served to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionRow {
    pub id: EntityId,
    pub parent_id: Option<EntityId>,
    pub label: String,
    pub order: i32,
    pub edited_at: Timestamp,
    pub is_hidden: bool,
}

/// Read-only query surface over the cache.
///
/// Every query first checks the cache state and refuses to serve results
/// while a rebuild is running, has failed, or is required.
#[derive(Clone)]
pub struct CacheQuery {
    db: Database,
    status: CacheStatus,
}

impl CacheQuery {
    pub fn new(db: Database, status: CacheStatus) -> Self {
        Self { db, status }
    }

    fn ensure_usable(&self) -> StorageResult<()> {
        let state = self.status.current();
        if state.is_usable() {
            Ok(())
        } else {
            Err(StorageError::CacheUnusable {
                state: state.to_string(),
            })
        }
    }

    pub fn bookmarks(&self, query: &BookmarkQuery) -> StorageResult<Vec<BookmarkRow>> {
        self.ensure_usable()?;
        let mut sql = String::from(
            "SELECT b.id, b.folder_id, b.label, b.description, l.url, l.domain,
                    b.created_at, b.edited_at, b.is_pinned, b.is_hidden
             FROM bookmarks b
             LEFT JOIN link_details l ON l.bookmark_id = b.id",
        );
        let mut clauses = Vec::new();
        let mut args: Vec<Value> = Vec::new();

        if let Some(tag_id) = query.tag_id {
            sql.push_str(
                " JOIN tag_bookmarks r ON r.bookmark_id = b.id
                  JOIN tags t ON t.id = r.tag_id",
            );
            args.push(Value::Text(tag_id.to_string()));
            clauses.push(format!("r.tag_id = ?{}", args.len()));
        }
        if let Some(folder_id) = query.folder_id {
            args.push(Value::Text(folder_id.to_string()));
            clauses.push(format!("b.folder_id = ?{}", args.len()));
        }
        if let Some(text) = query.text.as_deref().filter(|t| !t.is_empty()) {
            args.push(Value::Text(format!("%{}%", escape_like(text))));
            let n = args.len();
            clauses.push(format!(
                "(b.label LIKE ?{n} ESCAPE '\\' OR b.description LIKE ?{n} ESCAPE '\\')"
            ));
        }
        if !query.include_hidden {
            clauses.push("b.is_hidden = 0".to_string());
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        let column = match query.sort {
            SortKey::Custom | SortKey::Label => "b.label COLLATE NOCASE",
            SortKey::CreatedAt => "b.created_at",
            SortKey::EditedAt => "b.edited_at",
        };
        sql.push_str(&format!(
            " ORDER BY b.is_pinned DESC, {column} {}, b.id",
            direction(query.order)
        ));

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(args.iter()), bookmark_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn folders(&self, sort: SortKey, order: SortOrder) -> StorageResult<Vec<CollectionRow>> {
        self.collections(
            "SELECT id, parent_id, label, sort_order, edited_at, is_hidden FROM folders",
            sort,
            order,
        )
    }

    pub fn tags(&self, sort: SortKey, order: SortOrder) -> StorageResult<Vec<CollectionRow>> {
        self.collections(
            "SELECT id, NULL, label, sort_order, edited_at, is_hidden FROM tags",
            sort,
            order,
        )
    }

    /// Child folders of `parent`, or top-level folders for `None`.
    pub fn child_folders(&self, parent: Option<EntityId>) -> StorageResult<Vec<CollectionRow>> {
        let rows = self.folders(SortKey::Custom, SortOrder::Ascending)?;
        Ok(rows.into_iter().filter(|f| f.parent_id == parent).collect())
    }

    fn collections(
        &self,
        select: &str,
        sort: SortKey,
        order: SortOrder,
    ) -> StorageResult<Vec<CollectionRow>> {
        self.ensure_usable()?;
        let column = match sort {
            SortKey::Custom => "sort_order",
            SortKey::Label => "label COLLATE NOCASE",
            SortKey::CreatedAt => "created_at",
            SortKey::EditedAt => "edited_at",
        };
        let sql = format!("{select} ORDER BY {column} {}, id", direction(order));
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], collection_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Number of live bookmarks in a folder.
    pub fn bookmark_count(&self, folder_id: EntityId) -> StorageResult<usize> {
        self.ensure_usable()?;
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM bookmarks WHERE folder_id = ?1",
                params![folder_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(n).unwrap_or(0))
        })
    }
}

fn direction(order: SortOrder) -> &'static str {
    match order {
        SortOrder::Ascending => "ASC",
        SortOrder::Descending => "DESC",
    }
}

fn escape_like(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn parse_id(raw: &str, col: usize) -> rusqlite::Result<EntityId> {
    EntityId::parse(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn bookmark_row(row: &Row<'_>) -> rusqlite::Result<BookmarkRow> {
    Ok(BookmarkRow {
        id: parse_id(&row.get::<_, String>(0)?, 0)?,
        folder_id: parse_id(&row.get::<_, String>(1)?, 1)?,
        label: row.get(2)?,
        description: row.get(3)?,
        url: row.get(4)?,
        domain: row.get(5)?,
        created_at: Timestamp::from_millis(row.get(6)?),
        edited_at: Timestamp::from_millis(row.get(7)?),
        is_pinned: row.get(8)?,
        is_hidden: row.get(9)?,
    })
}

fn collection_row(row: &Row<'_>) -> rusqlite::Result<CollectionRow> {
    let parent: Option<String> = row.get(1)?;
    Ok(CollectionRow {
        id: parse_id(&row.get::<_, String>(0)?, 0)?,
        parent_id: parent.as_deref().map(|p| parse_id(p, 1)).transpose()?,
        label: row.get(2)?,
        order: row.get(3)?,
        edited_at: Timestamp::from_millis(row.get(4)?),
        is_hidden: row.get(5)?,
    })
}
