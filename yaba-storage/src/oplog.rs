//! Append-only op log.

use crate::database::{seq_from_sql, seq_to_sql};
use crate::error::{StorageError, StorageResult};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;
use yaba_types::{ActionType, EntityId, EntityKind, OpLogEntry, ReplicaId, Timestamp};

/// Op log over a borrowed connection or transaction.
pub struct OpLog<'c> {
    conn: &'c Connection,
}

impl<'c> OpLog<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Appends an entry. An entry whose `(origin, seq)` is already present is
    /// ignored; returns whether the entry was new.
    pub fn append(&self, entry: &OpLogEntry) -> StorageResult<bool> {
        let n = self.conn.execute(
            "INSERT OR IGNORE INTO op_log
                (origin_device_id, origin_seq, entity_type, entity_id, action_type, payload, happened_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.origin_device_id.to_string(),
                seq_to_sql(entry.origin_seq),
                entry.entity_type.as_str(),
                entry.entity_id.to_string(),
                entry.action_type.as_str(),
                serde_json::to_string(&entry.payload)?,
                entry.happened_at.as_millis(),
            ],
        )?;
        Ok(n > 0)
    }

    pub fn contains(&self, origin: ReplicaId, seq: u64) -> StorageResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM op_log WHERE origin_device_id = ?1 AND origin_seq = ?2",
                params![origin.to_string(), seq_to_sql(seq)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Entries from `origin` with `origin_seq > after_seq`, ascending, at most
    /// `limit` of them.
    pub fn get_ops_after(
        &self,
        origin: ReplicaId,
        after_seq: u64,
        limit: usize,
    ) -> StorageResult<Vec<OpLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT origin_device_id, origin_seq, entity_type, entity_id, action_type, payload, happened_at
             FROM op_log
             WHERE origin_device_id = ?1 AND origin_seq > ?2
             ORDER BY origin_seq ASC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![
                origin.to_string(),
                seq_to_sql(after_seq),
                i64::try_from(limit).unwrap_or(i64::MAX)
            ],
            raw_entry,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.decode()?);
        }
        Ok(out)
    }

    /// Highest sequence number held for each origin.
    pub fn heads(&self) -> StorageResult<BTreeMap<ReplicaId, u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT origin_device_id, MAX(origin_seq) FROM op_log GROUP BY origin_device_id")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut heads = BTreeMap::new();
        for row in rows {
            let (origin, seq) = row?;
            heads.insert(parse_replica(&origin)?, seq_from_sql(seq));
        }
        Ok(heads)
    }

    pub fn len(&self) -> StorageResult<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM op_log", [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Removes entries every known peer has acknowledged.
    ///
    /// Known peers are the replicas with a cursor. For each origin, entries at
    /// or below the lowest acknowledged sequence across those peers go; a peer
    /// counts as having acknowledged all of its own entries. With no known
    /// peers nothing is pruned.
    pub fn prune_acknowledged(&self) -> StorageResult<usize> {
        let peers: Vec<String> = {
            let mut stmt = self.conn.prepare("SELECT replica_id FROM replica_cursors")?;
            let rows = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<_, _>>()?;
            rows
        };
        if peers.is_empty() {
            return Ok(0);
        }

        let mut acks: HashMap<(String, String), i64> = HashMap::new();
        {
            let mut stmt = self
                .conn
                .prepare("SELECT peer_id, origin_id, seq FROM peer_acks")?;
            let rows = stmt.query_map([], |row| {
                Ok(((row.get(0)?, row.get(1)?), row.get::<_, i64>(2)?))
            })?;
            for row in rows {
                let (key, seq) = row?;
                acks.insert(key, seq);
            }
        }

        let mut pruned = 0;
        for origin in self.heads()?.into_keys() {
            let origin = origin.to_string();
            let floor = peers
                .iter()
                .map(|peer| {
                    if *peer == origin {
                        i64::MAX
                    } else {
                        acks.get(&(peer.clone(), origin.clone())).copied().unwrap_or(0)
                    }
                })
                .min()
                .unwrap_or(0);
            if floor <= 0 {
                continue;
            }
            pruned += self.conn.execute(
                "DELETE FROM op_log WHERE origin_device_id = ?1 AND origin_seq <= ?2",
                params![origin, floor],
            )?;
        }
        if pruned > 0 {
            debug!(pruned, "pruned acknowledged ops");
        }
        Ok(pruned)
    }
}

struct RawEntry {
    origin: String,
    seq: i64,
    entity_type: String,
    entity_id: String,
    action_type: String,
    payload: String,
    happened_at: i64,
}

fn raw_entry(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        origin: row.get(0)?,
        seq: row.get(1)?,
        entity_type: row.get(2)?,
        entity_id: row.get(3)?,
        action_type: row.get(4)?,
        payload: row.get(5)?,
        happened_at: row.get(6)?,
    })
}

impl RawEntry {
    fn decode(self) -> StorageResult<OpLogEntry> {
        Ok(OpLogEntry {
            origin_device_id: parse_replica(&self.origin)?,
            origin_seq: seq_from_sql(self.seq),
            entity_type: self.entity_type.parse::<EntityKind>()?,
            entity_id: EntityId::parse(&self.entity_id)
                .map_err(|e| StorageError::InvalidData(format!("op entity id: {e}")))?,
            action_type: parse_action(&self.action_type)?,
            payload: serde_json::from_str(&self.payload)?,
            happened_at: Timestamp::from_millis(self.happened_at),
        })
    }
}

fn parse_action(raw: &str) -> StorageResult<ActionType> {
    match raw {
        "Created" => Ok(ActionType::Created),
        "Updated" => Ok(ActionType::Updated),
        "Deleted" => Ok(ActionType::Deleted),
        "DeletedAll" => Ok(ActionType::DeletedAll),
        other => Err(StorageError::InvalidData(format!("unknown action type {other}"))),
    }
}

pub(crate) fn parse_replica(raw: &str) -> StorageResult<ReplicaId> {
    ReplicaId::parse(raw).map_err(|e| StorageError::InvalidData(format!("replica id {raw}: {e}")))
}
