//! SQLite handle shared by the cache and the replication bookkeeping.
//!
//! One file holds two groups of tables. The cache tables are a disposable
//! projection of the entity store; the replication tables (op log, entity
//! and field clocks, replica info, cursors, peer acks) are not, and a cache rebuild
//! never touches them.

use crate::error::StorageResult;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Current schema version.
const SCHEMA_VERSION: i64 = 2;

/// Cache tables, children before parents so they can be cleared in order.
pub(crate) const CACHE_TABLES: [&str; 8] = [
    "highlights",
    "assets",
    "readable_versions",
    "tag_bookmarks",
    "link_details",
    "bookmarks",
    "tags",
    "folders",
];

/// An explicitly constructed, cloneable handle to the database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (or creates) the database at `path` and brings the schema up to date.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Opens an in-memory database (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }

    /// Runs `f` inside a transaction. The transaction commits if `f` returns
    /// `Ok` and rolls back otherwise.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

fn migrate(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);",
    )?;
    let current: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
        .optional()?
        .flatten();
    let current = current.unwrap_or(0);
    if current >= SCHEMA_VERSION {
        return Ok(());
    }

    if current < 1 {
        conn.execute_batch(SCHEMA_V1)?;
    }
    if current < 2 {
        conn.execute_batch(SCHEMA_V2)?;
    }
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        params![SCHEMA_VERSION],
    )?;
    info!(from = current, to = SCHEMA_VERSION, "migrated database schema");
    Ok(())
}

const SCHEMA_V1: &str = "
    -- Cache ------------------------------------------------------------

    CREATE TABLE IF NOT EXISTS folders (
        id TEXT PRIMARY KEY,
        parent_id TEXT,
        label TEXT NOT NULL,
        description TEXT,
        icon TEXT NOT NULL,
        color INTEGER NOT NULL,
        sort_order INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        edited_at INTEGER NOT NULL,
        is_hidden INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS tags (
        id TEXT PRIMARY KEY,
        label TEXT NOT NULL,
        icon TEXT NOT NULL,
        color INTEGER NOT NULL,
        sort_order INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        edited_at INTEGER NOT NULL,
        is_hidden INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS bookmarks (
        id TEXT PRIMARY KEY,
        folder_id TEXT NOT NULL,
        kind INTEGER NOT NULL,
        label TEXT NOT NULL,
        description TEXT,
        created_at INTEGER NOT NULL,
        edited_at INTEGER NOT NULL,
        view_count INTEGER NOT NULL,
        is_private INTEGER NOT NULL,
        is_pinned INTEGER NOT NULL,
        is_hidden INTEGER NOT NULL,
        local_image_path TEXT,
        local_icon_path TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_bookmarks_folder ON bookmarks(folder_id);

    CREATE TABLE IF NOT EXISTS link_details (
        bookmark_id TEXT PRIMARY KEY REFERENCES bookmarks(id) ON DELETE CASCADE,
        url TEXT NOT NULL,
        domain TEXT NOT NULL,
        link_type INTEGER NOT NULL,
        video_url TEXT
    );

    CREATE TABLE IF NOT EXISTS tag_bookmarks (
        tag_id TEXT NOT NULL,
        bookmark_id TEXT NOT NULL REFERENCES bookmarks(id) ON DELETE CASCADE,
        PRIMARY KEY (tag_id, bookmark_id)
    );
    CREATE INDEX IF NOT EXISTS idx_tag_bookmarks_bookmark ON tag_bookmarks(bookmark_id);

    CREATE TABLE IF NOT EXISTS readable_versions (
        bookmark_id TEXT NOT NULL REFERENCES bookmarks(id) ON DELETE CASCADE,
        version INTEGER NOT NULL,
        relative_path TEXT NOT NULL,
        PRIMARY KEY (bookmark_id, version)
    );

    CREATE TABLE IF NOT EXISTS assets (
        bookmark_id TEXT NOT NULL REFERENCES bookmarks(id) ON DELETE CASCADE,
        id TEXT NOT NULL,
        extension TEXT NOT NULL,
        relative_path TEXT NOT NULL,
        PRIMARY KEY (bookmark_id, id)
    );

    CREATE TABLE IF NOT EXISTS highlights (
        id TEXT PRIMARY KEY,
        bookmark_id TEXT NOT NULL REFERENCES bookmarks(id) ON DELETE CASCADE,
        content_version INTEGER NOT NULL,
        start_anchor TEXT NOT NULL,
        end_anchor TEXT NOT NULL,
        color_role INTEGER NOT NULL,
        note TEXT,
        created_at INTEGER NOT NULL,
        edited_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS cache_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    -- Replication -------------------------------------------------------

    CREATE TABLE IF NOT EXISTS op_log (
        origin_device_id TEXT NOT NULL,
        origin_seq INTEGER NOT NULL,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        action_type TEXT NOT NULL,
        payload TEXT NOT NULL,
        happened_at INTEGER NOT NULL,
        PRIMARY KEY (origin_device_id, origin_seq)
    );
    CREATE INDEX IF NOT EXISTS idx_op_log_entity ON op_log(entity_type, entity_id);

    CREATE TABLE IF NOT EXISTS entity_clocks (
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        origin TEXT NOT NULL,
        PRIMARY KEY (entity_type, entity_id)
    );

    CREATE TABLE IF NOT EXISTS replica_info (
        singleton INTEGER PRIMARY KEY CHECK (singleton = 1),
        device_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        next_origin_seq INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS replica_cursors (
        replica_id TEXT PRIMARY KEY,
        last_seq INTEGER NOT NULL,
        last_seen_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS peer_acks (
        peer_id TEXT NOT NULL,
        origin_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        PRIMARY KEY (peer_id, origin_id)
    );
";

/// Per-field clocks, and highlights keyed within their bookmark.
const SCHEMA_V2: &str = "
    CREATE TABLE IF NOT EXISTS field_clocks (
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        field TEXT NOT NULL,
        version INTEGER NOT NULL,
        origin TEXT NOT NULL,
        PRIMARY KEY (entity_type, entity_id, field)
    );

    CREATE TABLE highlights_v2 (
        id TEXT NOT NULL,
        bookmark_id TEXT NOT NULL REFERENCES bookmarks(id) ON DELETE CASCADE,
        content_version INTEGER NOT NULL,
        start_anchor TEXT NOT NULL,
        end_anchor TEXT NOT NULL,
        color_role INTEGER NOT NULL,
        note TEXT,
        created_at INTEGER NOT NULL,
        edited_at INTEGER NOT NULL,
        PRIMARY KEY (bookmark_id, id)
    );
    INSERT INTO highlights_v2 SELECT
        id, bookmark_id, content_version, start_anchor, end_anchor,
        color_role, note, created_at, edited_at
    FROM highlights;
    DROP TABLE highlights;
    ALTER TABLE highlights_v2 RENAME TO highlights;
";

/// Converts a sequence number for storage. SQLite integers are signed.
pub(crate) fn seq_to_sql(seq: u64) -> i64 {
    i64::try_from(seq).unwrap_or(i64::MAX)
}

pub(crate) fn seq_from_sql(raw: i64) -> u64 {
    u64::try_from(raw).unwrap_or(0)
}
