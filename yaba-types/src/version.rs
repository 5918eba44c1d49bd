use crate::{ReplicaId, Timestamp};
use serde::{Deserialize, Serialize};

/// The version of an entity held in its clock: the logical timestamp of the
/// winning write and the replica that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    pub timestamp: Timestamp,
    pub origin: ReplicaId,
}

impl Version {
    #[must_use]
    pub const fn new(timestamp: Timestamp, origin: ReplicaId) -> Self {
        Self { timestamp, origin }
    }

    /// Last-writer-wins: a newer timestamp wins; on a tie the higher origin
    /// wins. Equal versions do not win, so re-applying is a no-op.
    #[must_use]
    pub fn wins(&self, current: &Self) -> bool {
        match self.timestamp.cmp(&current.timestamp) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.origin > current.origin,
        }
    }
}
