//! This replica's identity and what it knows about other replicas.

use crate::database::{seq_from_sql, seq_to_sql};
use crate::error::StorageResult;
use crate::oplog::parse_replica;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeMap;
use tracing::info;
use yaba_types::{ReplicaId, Timestamp};

/// This device's identity. Created once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaInfo {
    pub device_id: ReplicaId,
    pub created_at: Timestamp,
}

/// The highest sequence number from `replica_id`'s log applied locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaCursor {
    pub replica_id: ReplicaId,
    pub last_seq: u64,
    pub last_seen_at: Timestamp,
}

/// Replica info, cursors and peer acknowledgements.
pub struct ReplicaRegistry<'c> {
    conn: &'c Connection,
}

impl<'c> ReplicaRegistry<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    // ── Own identity ─────────────────────────────────────────────

    pub fn info(&self) -> StorageResult<Option<ReplicaInfo>> {
        let row: Option<(String, i64)> = self
            .conn
            .query_row(
                "SELECT device_id, created_at FROM replica_info WHERE singleton = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(id, created_at)| {
            Ok(ReplicaInfo {
                device_id: parse_replica(&id)?,
                created_at: Timestamp::from_millis(created_at),
            })
        })
        .transpose()
    }

    /// Returns this replica's info, creating a fresh identity on first use.
    pub fn ensure_info(&self) -> StorageResult<ReplicaInfo> {
        if let Some(info) = self.info()? {
            return Ok(info);
        }
        let info = ReplicaInfo {
            device_id: ReplicaId::new(),
            created_at: Timestamp::now(),
        };
        self.conn.execute(
            "INSERT INTO replica_info (singleton, device_id, created_at, next_origin_seq)
             VALUES (1, ?1, ?2, 1)",
            params![info.device_id.to_string(), info.created_at.as_millis()],
        )?;
        info!(device_id = %info.device_id, "created replica identity");
        Ok(info)
    }

    /// Allocates the next origin sequence number for a local op.
    pub fn next_seq(&self) -> StorageResult<u64> {
        self.ensure_info()?;
        let seq: i64 = self.conn.query_row(
            "SELECT next_origin_seq FROM replica_info WHERE singleton = 1",
            [],
            |row| row.get(0),
        )?;
        self.conn.execute(
            "UPDATE replica_info SET next_origin_seq = ?1 WHERE singleton = 1",
            params![seq + 1],
        )?;
        Ok(seq_from_sql(seq))
    }

    /// The last sequence number handed out, `0` if none.
    pub fn last_seq(&self) -> StorageResult<u64> {
        let seq: Option<i64> = self
            .conn
            .query_row(
                "SELECT next_origin_seq FROM replica_info WHERE singleton = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seq.map_or(0, |next| seq_from_sql(next - 1)))
    }

    // ── Cursors ──────────────────────────────────────────────────

    pub fn cursor(&self, replica: ReplicaId) -> StorageResult<Option<ReplicaCursor>> {
        let row: Option<(i64, i64)> = self
            .conn
            .query_row(
                "SELECT last_seq, last_seen_at FROM replica_cursors WHERE replica_id = ?1",
                params![replica.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row.map(|(seq, seen)| ReplicaCursor {
            replica_id: replica,
            last_seq: seq_from_sql(seq),
            last_seen_at: Timestamp::from_millis(seen),
        }))
    }

    pub fn cursors(&self) -> StorageResult<Vec<ReplicaCursor>> {
        let mut stmt = self
            .conn
            .prepare("SELECT replica_id, last_seq, last_seen_at FROM replica_cursors ORDER BY replica_id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, seq, seen) = row?;
            out.push(ReplicaCursor {
                replica_id: parse_replica(&id)?,
                last_seq: seq_from_sql(seq),
                last_seen_at: Timestamp::from_millis(seen),
            });
        }
        Ok(out)
    }

    /// Moves a cursor forward. Never moves it back; returns the resulting value.
    pub fn advance_cursor(
        &self,
        replica: ReplicaId,
        seq: u64,
        seen_at: Timestamp,
    ) -> StorageResult<u64> {
        self.conn.execute(
            "INSERT INTO replica_cursors (replica_id, last_seq, last_seen_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(replica_id) DO UPDATE SET
                last_seq = MAX(last_seq, excluded.last_seq),
                last_seen_at = MAX(last_seen_at, excluded.last_seen_at)",
            params![replica.to_string(), seq_to_sql(seq), seen_at.as_millis()],
        )?;
        let seq: i64 = self.conn.query_row(
            "SELECT last_seq FROM replica_cursors WHERE replica_id = ?1",
            params![replica.to_string()],
            |row| row.get(0),
        )?;
        Ok(seq_from_sql(seq))
    }

    /// What this replica has integrated, per origin: its own last sequence
    /// number plus every cursor.
    pub fn heads(&self) -> StorageResult<BTreeMap<ReplicaId, u64>> {
        let info = self.ensure_info()?;
        let mut heads: BTreeMap<ReplicaId, u64> = self
            .cursors()?
            .into_iter()
            .map(|c| (c.replica_id, c.last_seq))
            .collect();
        heads.insert(info.device_id, self.last_seq()?);
        Ok(heads)
    }

    // ── Peer acknowledgements ────────────────────────────────────

    /// Records what `peer` reported as integrated. Monotonic per origin.
    pub fn record_peer_acks(
        &self,
        peer: ReplicaId,
        acks: &BTreeMap<ReplicaId, u64>,
    ) -> StorageResult<()> {
        let mut stmt = self.conn.prepare(
            "INSERT INTO peer_acks (peer_id, origin_id, seq) VALUES (?1, ?2, ?3)
             ON CONFLICT(peer_id, origin_id) DO UPDATE SET seq = MAX(seq, excluded.seq)",
        )?;
        for (origin, seq) in acks {
            stmt.execute(params![peer.to_string(), origin.to_string(), seq_to_sql(*seq)])?;
        }
        Ok(())
    }

    pub fn peer_acks(&self, peer: ReplicaId) -> StorageResult<BTreeMap<ReplicaId, u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT origin_id, seq FROM peer_acks WHERE peer_id = ?1")?;
        let rows = stmt.query_map(params![peer.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (origin, seq) = row?;
            out.insert(parse_replica(&origin)?, seq_from_sql(seq));
        }
        Ok(out)
    }

    /// The oldest last-seen time over all known replicas. Every known replica
    /// has converged past anything older. `None` without known replicas.
    pub fn convergence_horizon(&self) -> StorageResult<Option<Timestamp>> {
        let min: Option<i64> = self.conn.query_row(
            "SELECT MIN(last_seen_at) FROM replica_cursors",
            [],
            |row| row.get(0),
        )?;
        Ok(min.map(Timestamp::from_millis))
    }
}
