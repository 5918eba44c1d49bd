//! Per-entity and per-field logical clocks.

use crate::error::StorageResult;
use crate::oplog::parse_replica;
use rusqlite::{Connection, OptionalExtension, params};
use yaba_types::{EntityId, EntityKind, Timestamp, Version};

/// One row per `(kind, id)`: the version of the last write that won.
///
/// Rows outlive deletions; the clock of a deleted entity holds the deletion's
/// version so stale ops stay discarded.
pub struct EntityClock<'c> {
    conn: &'c Connection,
}

impl<'c> EntityClock<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, kind: EntityKind, id: EntityId) -> StorageResult<Option<Version>> {
        let row: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT version, origin FROM entity_clocks WHERE entity_type = ?1 AND entity_id = ?2",
                params![kind.as_str(), id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(ts, origin)| {
            Ok(Version::new(Timestamp::from_millis(ts), parse_replica(&origin)?))
        })
        .transpose()
    }

    pub fn upsert(&self, kind: EntityKind, id: EntityId, version: Version) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO entity_clocks (entity_type, entity_id, version, origin)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                version = excluded.version, origin = excluded.origin",
            params![
                kind.as_str(),
                id.to_string(),
                version.timestamp.as_millis(),
                version.origin.to_string(),
            ],
        )?;
        Ok(())
    }
}

/// Field key of the row that holds the document version.
const DOCUMENT: &str = "";

/// Per-field versions, so concurrent deltas to different fields both land.
///
/// A whole-document write records a document version and forgets the
/// entity's field versions; a field delta records the version of each field
/// it won. The effective version of a field is the later of the two.
pub struct FieldClock<'c> {
    conn: &'c Connection,
}

impl<'c> FieldClock<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Version of the last whole-document write.
    pub fn document(&self, kind: EntityKind, id: EntityId) -> StorageResult<Option<Version>> {
        self.row(kind, id, DOCUMENT)
    }

    /// Effective version of one field.
    pub fn field(
        &self,
        kind: EntityKind,
        id: EntityId,
        field: &str,
    ) -> StorageResult<Option<Version>> {
        let document = self.document(kind, id)?;
        let own = self.row(kind, id, field)?;
        Ok(match (document, own) {
            (Some(doc), Some(own)) if own.wins(&doc) => Some(own),
            (Some(doc), _) => Some(doc),
            (None, own) => own,
        })
    }

    /// Records a whole-document write, dropping every field version.
    pub fn set_document(
        &self,
        kind: EntityKind,
        id: EntityId,
        version: Version,
    ) -> StorageResult<()> {
        self.conn.execute(
            "DELETE FROM field_clocks WHERE entity_type = ?1 AND entity_id = ?2",
            params![kind.as_str(), id.to_string()],
        )?;
        self.set_row(kind, id, DOCUMENT, version)
    }

    pub fn set_field(
        &self,
        kind: EntityKind,
        id: EntityId,
        field: &str,
        version: Version,
    ) -> StorageResult<()> {
        debug_assert!(!field.is_empty());
        self.set_row(kind, id, field, version)
    }

    fn row(&self, kind: EntityKind, id: EntityId, field: &str) -> StorageResult<Option<Version>> {
        let row: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT version, origin FROM field_clocks
                 WHERE entity_type = ?1 AND entity_id = ?2 AND field = ?3",
                params![kind.as_str(), id.to_string(), field],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(ts, origin)| {
            Ok(Version::new(Timestamp::from_millis(ts), parse_replica(&origin)?))
        })
        .transpose()
    }

    fn set_row(
        &self,
        kind: EntityKind,
        id: EntityId,
        field: &str,
        version: Version,
    ) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO field_clocks (entity_type, entity_id, field, version, origin)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(entity_type, entity_id, field) DO UPDATE SET
                version = excluded.version, origin = excluded.origin",
            params![
                kind.as_str(),
                id.to_string(),
                field,
                version.timestamp.as_millis(),
                version.origin.to_string(),
            ],
        )?;
        Ok(())
    }
}
