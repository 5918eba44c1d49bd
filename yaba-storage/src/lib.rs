//! Storage layer for YABA.
//!
//! The filesystem tree of JSON documents is the single source of truth. A
//! SQLite cache projects it into relational rows for queries and can be
//! dropped and rebuilt at any time.
//!
//! # Architecture
//!
//! - [`EntityStore`]: per-entity documents and deletion markers on disk
//! - [`Database`]: the SQLite handle, shared by cache and replication tables
//! - [`CacheWriter`] / [`CacheQuery`]: write-through rows and read-only queries
//! - [`DriftDetector`]: id-set diff between the entity store and the cache
//! - [`CacheRebuilder`]: full rebuild and incremental drift repair
//! - [`OpLog`], [`EntityClock`], [`FieldClock`], [`ReplicaRegistry`]: replication bookkeeping

mod cache;
mod clock;
mod config;
mod database;
mod drift;
mod entity_store;
mod error;
mod oplog;
mod rebuilder;
mod replica;
mod state;

pub use cache::{
    BookmarkQuery, BookmarkRow, CacheQuery, CacheSnapshot, CacheWriter, CollectionRow, SortKey,
    SortOrder,
};
pub use clock::{EntityClock, FieldClock};
pub use config::StoreConfig;
pub use database::Database;
pub use drift::{DriftDetector, DriftReport, EntityKey};
pub use entity_store::{BookmarkAux, EntityStore, WriteJournal};
pub use error::{StorageError, StorageResult};
pub use oplog::OpLog;
pub use rebuilder::{CacheRebuilder, RepairStats};
pub use replica::{ReplicaCursor, ReplicaInfo, ReplicaRegistry};
pub use state::{CacheState, CacheStatus};

use std::sync::Arc;

/// Everything one replica keeps locally, opened together.
#[derive(Clone)]
pub struct Storage {
    pub entities: EntityStore,
    pub db: Database,
    pub status: CacheStatus,
    pub rebuilder: Arc<CacheRebuilder>,
}

impl Storage {
    /// Opens the entity tree and the database named by `config`.
    pub fn open(config: &StoreConfig) -> StorageResult<Self> {
        let db = Database::open(&config.database_path)?;
        Self::with_database(config, db)
    }

    /// Opens the entity tree with an in-memory database (for testing).
    pub fn open_in_memory(config: &StoreConfig) -> StorageResult<Self> {
        Self::with_database(config, Database::open_in_memory()?)
    }

    fn with_database(config: &StoreConfig, db: Database) -> StorageResult<Self> {
        let entities = EntityStore::open(&config.root)?;
        let status = CacheStatus::default();
        let rebuilder = CacheRebuilder::new(
            db.clone(),
            entities.clone(),
            status.clone(),
            config.max_parse_retries,
        )?;
        Ok(Self {
            entities,
            db,
            status,
            rebuilder: Arc::new(rebuilder),
        })
    }

    /// Read-only query surface over the cache.
    pub fn query(&self) -> CacheQuery {
        CacheQuery::new(self.db.clone(), self.status.clone())
    }

    /// Captures every cache row.
    pub fn cache_snapshot(&self) -> StorageResult<CacheSnapshot> {
        self.db.with_conn(CacheSnapshot::capture)
    }
}
