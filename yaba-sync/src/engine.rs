//! The local replica: mutations, cache maintenance and log compaction.
//!
//! Every mutation becomes an op that goes through [`OpApplicator`], so local
//! and replicated writes obey the same merge rules. Storage work runs on the
//! blocking pool.

use crate::applicator::{ApplyOutcome, ApplyReport, OpApplicator};
use crate::error::{SyncError, SyncResult};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};
use yaba_storage::{
    CacheQuery, CacheStatus, CacheWriter, DriftReport, EntityClock, OpLog, RepairStats,
    ReplicaRegistry, Storage, StorageError, StoreConfig,
};
use yaba_types::{
    Entity, EntityId, EntityKind, FieldChange, Highlight, OpDraft, OpLogEntry, ReplicaId,
    Timestamp, Tombstone,
};

/// Configuration for sync sessions.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Device name sent in the handshake.
    pub device_name: String,
    /// How long to wait for each peer reply (ms).
    pub timeout_ms: u64,
    /// Page size when reading the op log for a peer.
    pub op_batch_size: usize,
}

impl SyncConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            device_name: "YABA Device".to_string(),
            timeout_ms: 30_000,
            op_batch_size: 100,
        }
    }
}

/// What a compaction pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub pruned_ops: usize,
    pub purged_tombstones: usize,
}

/// One device's replica.
#[derive(Clone)]
pub struct LocalReplica {
    storage: Storage,
    applicator: OpApplicator,
    config: SyncConfig,
    device_id: ReplicaId,
    last_stamp: Arc<Mutex<Timestamp>>,
}

impl LocalReplica {
    /// Opens the storage named by `store` and the replica identity in it.
    pub fn open(store: &StoreConfig, config: SyncConfig) -> SyncResult<Self> {
        Self::new(Storage::open(store)?, config)
    }

    pub fn new(storage: Storage, config: SyncConfig) -> SyncResult<Self> {
        let info = storage
            .db
            .with_conn(|conn| ReplicaRegistry::new(conn).ensure_info())?;
        info!(device_id = %info.device_id, name = %config.device_name, "opened replica");
        Ok(Self {
            applicator: OpApplicator::new(&storage),
            storage,
            config,
            device_id: info.device_id,
            last_stamp: Arc::new(Mutex::new(Timestamp::ZERO)),
        })
    }

    pub fn device_id(&self) -> ReplicaId {
        self.device_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn applicator(&self) -> &OpApplicator {
        &self.applicator
    }

    pub fn query(&self) -> CacheQuery {
        self.storage.query()
    }

    pub fn cache_status(&self) -> &CacheStatus {
        &self.storage.status
    }

    // ── Mutations ────────────────────────────────────────────────

    /// Creates an entity. Its `editedAt` is restamped to the op's timestamp.
    pub async fn create(&self, mut entity: Entity) -> SyncResult<Entity> {
        let floor = self.current_version(entity.kind(), entity.id()).await?;
        entity.set_edited_at(self.stamp(floor));
        let draft = OpDraft::created(entity.clone());
        self.apply_local(draft).await?;
        Ok(entity)
    }

    /// Applies field changes to an existing entity.
    pub async fn update(
        &self,
        kind: EntityKind,
        id: EntityId,
        changes: Vec<FieldChange>,
    ) -> SyncResult<ApplyOutcome> {
        let at = self.stamp(self.current_version(kind, id).await?);
        self.apply_local(OpDraft::updated(kind, id, changes, at))
            .await
    }

    pub async fn delete(&self, kind: EntityKind, id: EntityId) -> SyncResult<ApplyOutcome> {
        let at = self.stamp(self.current_version(kind, id).await?);
        self.apply_local(OpDraft::deleted(kind, id, at)).await
    }

    /// Deletes every live entity of `kind`.
    pub async fn delete_all(&self, kind: EntityKind) -> SyncResult<ApplyOutcome> {
        let at = self.stamp(None);
        self.apply_local(OpDraft::deleted_all(kind, at)).await
    }

    pub async fn get(&self, kind: EntityKind, id: EntityId) -> SyncResult<Option<Entity>> {
        self.blocking(move |storage| Ok(storage.entities.read(kind, id)?))
            .await
    }

    // ── Bookmark content ─────────────────────────────────────────

    /// Stores a readable version of a bookmark and reindexes it.
    pub async fn add_readable_version(
        &self,
        bookmark_id: EntityId,
        version: u32,
        markdown: String,
    ) -> SyncResult<()> {
        self.blocking(move |storage| {
            require_bookmark(storage, bookmark_id)?;
            storage
                .entities
                .write_readable(bookmark_id, version, &markdown)?;
            reindex_bookmark(storage, bookmark_id)
        })
        .await
    }

    pub async fn add_asset(
        &self,
        bookmark_id: EntityId,
        asset_id: String,
        extension: String,
        bytes: Vec<u8>,
    ) -> SyncResult<()> {
        self.blocking(move |storage| {
            require_bookmark(storage, bookmark_id)?;
            storage
                .entities
                .write_asset(bookmark_id, &asset_id, &extension, &bytes)?;
            reindex_bookmark(storage, bookmark_id)
        })
        .await
    }

    pub async fn add_highlight(&self, highlight: Highlight) -> SyncResult<()> {
        self.blocking(move |storage| {
            require_bookmark(storage, highlight.bookmark_id)?;
            storage.entities.write_highlight(&highlight)?;
            reindex_bookmark(storage, highlight.bookmark_id)
        })
        .await
    }

    // ── Cache maintenance ────────────────────────────────────────

    pub async fn detect_drift(&self) -> SyncResult<DriftReport> {
        self.blocking(|storage| Ok(storage.rebuilder.detect_drift()?))
            .await
    }

    pub async fn fix_drift(&self) -> SyncResult<RepairStats> {
        self.blocking(|storage| Ok(storage.rebuilder.fix_drift()?))
            .await
    }

    pub async fn rebuild_from_filesystem(&self) -> SyncResult<RepairStats> {
        self.blocking(|storage| Ok(storage.rebuilder.rebuild_from_filesystem()?))
            .await
    }

    // ── Replication state ────────────────────────────────────────

    /// Highest sequence number integrated per origin, this replica included.
    pub async fn heads(&self) -> SyncResult<BTreeMap<ReplicaId, u64>> {
        self.blocking(|storage| {
            Ok(storage
                .db
                .with_conn(|conn| ReplicaRegistry::new(conn).heads())?)
        })
        .await
    }

    /// Every live entity.
    pub async fn snapshot(&self) -> SyncResult<Vec<Entity>> {
        self.blocking(|storage| {
            let mut entities = Vec::new();
            for kind in EntityKind::ALL {
                for id in storage.entities.live_ids(kind)? {
                    if let Some(entity) = storage.entities.read(kind, id)? {
                        entities.push(entity);
                    }
                }
            }
            Ok(entities)
        })
        .await
    }

    /// The delete-log, oldest first.
    pub async fn tombstones(&self) -> SyncResult<Vec<Tombstone>> {
        self.blocking(|storage| Ok(storage.entities.tombstones()?))
            .await
    }

    /// Drops op-log entries every known peer has acknowledged and deletion
    /// markers older than the oldest last-sync time over known peers.
    pub async fn compact(&self) -> SyncResult<CompactionStats> {
        let stats = self
            .blocking(|storage| {
                let (pruned_ops, horizon) = storage.db.transaction(|tx| {
                    let pruned = OpLog::new(tx).prune_acknowledged()?;
                    let horizon = ReplicaRegistry::new(tx).convergence_horizon()?;
                    Ok((pruned, horizon))
                })?;
                let purged_tombstones = match horizon {
                    Some(horizon) => storage.entities.purge_tombstones_before(horizon)?,
                    None => 0,
                };
                Ok(CompactionStats {
                    pruned_ops,
                    purged_tombstones,
                })
            })
            .await?;
        info!(
            pruned_ops = stats.pruned_ops,
            purged_tombstones = stats.purged_tombstones,
            "compacted replication state"
        );
        Ok(stats)
    }

    /// Op-log entries the holder of `peer_heads` has not integrated, ascending
    /// per origin. `None` when the log cannot serve them: entries were pruned
    /// or the state arrived through a snapshot.
    pub(crate) async fn ops_for(
        &self,
        peer_heads: BTreeMap<ReplicaId, u64>,
    ) -> SyncResult<Option<Vec<OpLogEntry>>> {
        let page = self.config.op_batch_size.max(1);
        self.blocking(move |storage| {
            Ok(storage.db.with_conn(|conn| {
                let log = OpLog::new(conn);
                let mut out = Vec::new();
                for (origin, mine) in ReplicaRegistry::new(conn).heads()? {
                    let theirs = peer_heads.get(&origin).copied().unwrap_or(0);
                    if mine <= theirs {
                        continue;
                    }
                    let mut after = theirs;
                    loop {
                        let batch = log.get_ops_after(origin, after, page)?;
                        let first = batch.first().map(|op| op.origin_seq);
                        if after == theirs && first != Some(theirs + 1) {
                            debug!(%origin, from = theirs + 1, "op log gap");
                            return Ok(None);
                        }
                        let Some(last) = batch.last() else { break };
                        after = last.origin_seq;
                        let more = batch.len() == page;
                        out.extend(batch);
                        if !more {
                            break;
                        }
                    }
                }
                Ok(Some(out))
            })?)
        })
        .await
    }

    /// Records a finished session with `peer`: cursors move to what the peer
    /// reported, short of any op `applied` held back, and the peer is
    /// credited with everything both sides held.
    pub(crate) async fn record_session(
        &self,
        peer: ReplicaId,
        peer_heads: BTreeMap<ReplicaId, u64>,
        local_heads: BTreeMap<ReplicaId, u64>,
        applied: ApplyReport,
    ) -> SyncResult<()> {
        let me = self.device_id;
        self.blocking(move |storage| {
            storage.db.transaction(|tx| {
                let registry = ReplicaRegistry::new(tx);
                let now = Timestamp::now();
                registry.advance_cursor(peer, 0, now)?;
                for (&origin, &seq) in &peer_heads {
                    if origin == me {
                        continue;
                    }
                    let seen = if origin == peer { now } else { Timestamp::ZERO };
                    registry.advance_cursor(origin, applied.integrated_up_to(origin, seq), seen)?;
                }
                let mut acks = peer_heads;
                for (origin, seq) in local_heads {
                    let acked = acks.entry(origin).or_insert(0);
                    *acked = (*acked).max(seq);
                }
                registry.record_peer_acks(peer, &acks)
            })?;
            Ok(())
        })
        .await
    }

    // ── Internals ────────────────────────────────────────────────

    /// Runs storage work on the blocking pool.
    pub(crate) async fn blocking<T, F>(&self, f: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Storage) -> SyncResult<T> + Send + 'static,
    {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || f(&storage)).await?
    }

    async fn apply_local(&self, draft: OpDraft) -> SyncResult<ApplyOutcome> {
        let applicator = self.applicator.clone();
        let (_, outcome) =
            tokio::task::spawn_blocking(move || applicator.apply_local(draft)).await??;
        Ok(outcome)
    }

    /// The newest timestamp this replica holds for an entity, from its clock
    /// or its deletion marker.
    async fn current_version(
        &self,
        kind: EntityKind,
        id: EntityId,
    ) -> SyncResult<Option<Timestamp>> {
        self.blocking(move |storage| {
            let clock = storage
                .db
                .with_conn(|conn| EntityClock::new(conn).get(kind, id))?
                .map(|v| v.timestamp);
            let marker = storage.entities.tombstone(kind, id)?.map(|t| t.timestamp);
            Ok(clock.max(marker))
        })
        .await
    }

    /// A timestamp later than every one this replica handed out and later
    /// than `floor`, so a local edit always beats what is visible locally.
    fn stamp(&self, floor: Option<Timestamp>) -> Timestamp {
        let mut last = self.last_stamp.lock().unwrap();
        let previous = floor.map_or(*last, |floor| floor.max(*last));
        let at = Timestamp::next_after(previous);
        *last = at;
        at
    }
}

fn require_bookmark(storage: &Storage, bookmark_id: EntityId) -> SyncResult<Entity> {
    storage
        .entities
        .read(EntityKind::Bookmark, bookmark_id)?
        .ok_or_else(|| {
            SyncError::Storage(StorageError::NotFound(format!("bookmark {bookmark_id}")))
        })
}

/// Rewrites a bookmark's cache rows after its auxiliary files changed.
fn reindex_bookmark(storage: &Storage, bookmark_id: EntityId) -> SyncResult<()> {
    let doc = require_bookmark(storage, bookmark_id)?;
    let aux = storage.entities.aux(bookmark_id)?;
    storage
        .db
        .with_conn(|conn| CacheWriter::new(conn).upsert(&doc, Some(&aux)))?;
    Ok(())
}
