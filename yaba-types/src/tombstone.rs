use crate::{EntityId, EntityKind, Timestamp, TombstoneId};
use serde::{Deserialize, Serialize};

/// A deletion marker that outlives the entity it deletes.
///
/// Persisted as `<kind>/<id>/deleted.json` and exchanged in delete-logs so a
/// peer that never saw the deletion does not resurrect the entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub tombstone_id: TombstoneId,
    pub entity_type: EntityKind,
    pub entity_id: EntityId,
    pub timestamp: Timestamp,
}

impl Tombstone {
    #[must_use]
    pub fn new(entity_type: EntityKind, entity_id: EntityId, timestamp: Timestamp) -> Self {
        Self {
            tombstone_id: TombstoneId::new(),
            entity_type,
            entity_id,
            timestamp,
        }
    }

    /// Whether this deletion dominates a record last edited at `edited_at`.
    ///
    /// Ties go to the deletion; only a strictly later edit is a recreate.
    #[must_use]
    pub fn suppresses(&self, edited_at: Timestamp) -> bool {
        self.timestamp >= edited_at
    }
}
