//! Whole-record merge of two replicas' snapshots and delete-logs.
//!
//! The merge is a pure function of both sides' inputs and is symmetric:
//! swapping the arguments gives the same result, so initiator and responder
//! compute identical snapshots independently.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use yaba_storage::EntityKey;
use yaba_types::{Entity, ReplicaId, Tombstone, TombstoneId, Version};

/// One replica's contribution to a merge.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotSide<'a> {
    pub replica: ReplicaId,
    pub entities: &'a [Entity],
    pub tombstones: &'a [Tombstone],
}

/// The converged state both replicas persist.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedSnapshot {
    /// Live entities ordered by kind, then id.
    pub entities: Vec<Entity>,
    /// The combined delete-log ordered by timestamp ascending, then id.
    pub tombstones: Vec<Tombstone>,
}

impl MergedSnapshot {
    /// The newest tombstone per entity.
    pub fn latest_tombstones(&self) -> BTreeMap<EntityKey, &Tombstone> {
        latest_by_entity(&self.tombstones)
    }
}

/// Unions two delete-logs, de-duplicated by tombstone id.
///
/// Replaying the result in order never lets an earlier deletion mask a later
/// one.
pub fn merge_tombstones(a: &[Tombstone], b: &[Tombstone]) -> Vec<Tombstone> {
    let mut by_id: BTreeMap<TombstoneId, &Tombstone> = BTreeMap::new();
    for tombstone in a.iter().chain(b) {
        match by_id.entry(tombstone.tombstone_id) {
            Entry::Vacant(slot) => {
                slot.insert(tombstone);
            }
            Entry::Occupied(mut slot) => {
                let held = slot.get();
                if (tombstone.timestamp, tombstone.entity_type, tombstone.entity_id)
                    > (held.timestamp, held.entity_type, held.entity_id)
                {
                    slot.insert(tombstone);
                }
            }
        }
    }
    let mut out: Vec<Tombstone> = by_id.into_values().cloned().collect();
    out.sort_by_key(|t| (t.timestamp, t.tombstone_id));
    out
}

/// The newest tombstone for each entity in `tombstones`.
pub fn latest_by_entity(tombstones: &[Tombstone]) -> BTreeMap<EntityKey, &Tombstone> {
    let mut latest: BTreeMap<EntityKey, &Tombstone> = BTreeMap::new();
    for tombstone in tombstones {
        let key = (tombstone.entity_type, tombstone.entity_id);
        match latest.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(tombstone);
            }
            Entry::Occupied(mut slot) => {
                if (tombstone.timestamp, tombstone.tombstone_id)
                    > (slot.get().timestamp, slot.get().tombstone_id)
                {
                    slot.insert(tombstone);
                }
            }
        }
    }
    latest
}

/// Merges two snapshots.
///
/// Per entity, the record with the winning `(editedAt, sender)` version is
/// kept. A record is dropped when the newest tombstone for it from either
/// side is at least as recent as its `editedAt`.
pub fn merge(a: SnapshotSide<'_>, b: SnapshotSide<'_>) -> SyncResult<MergedSnapshot> {
    if a.replica == b.replica {
        return Err(SyncError::MergeImpossible(format!(
            "both snapshots come from replica {}",
            a.replica
        )));
    }

    let tombstones = merge_tombstones(a.tombstones, b.tombstones);

    let mut winners: BTreeMap<EntityKey, (Version, &Entity)> = BTreeMap::new();
    for side in [a, b] {
        for entity in side.entities {
            let version = Version::new(entity.edited_at(), side.replica);
            match winners.entry((entity.kind(), entity.id())) {
                Entry::Vacant(slot) => {
                    slot.insert((version, entity));
                }
                Entry::Occupied(mut slot) => {
                    if version.wins(&slot.get().0) {
                        slot.insert((version, entity));
                    }
                }
            }
        }
    }

    let latest = latest_by_entity(&tombstones);
    let entities = winners
        .into_iter()
        .filter(|(key, (_, entity))| {
            !latest
                .get(key)
                .is_some_and(|t| t.suppresses(entity.edited_at()))
        })
        .map(|(_, (_, entity))| entity.clone())
        .collect();

    Ok(MergedSnapshot {
        entities,
        tombstones,
    })
}
