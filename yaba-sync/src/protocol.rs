//! Sync protocol messages and types.
//!
//! A session is a strict request/response exchange driven by the initiator:
//! 1. Handshake: identities, protocol version and per-origin heads
//! 2. Delete-log exchange: both full tombstone sets, before any data
//! 3. Data exchange: full snapshots, or op-log entries past the peer's heads
//! 4. Completion: the initiator sends the merged result, the responder
//!    verifies and persists it, then acknowledges
//!
//! Every request carries a fresh id; the matching reply names it in
//! `in_reply_to`.

use crate::merge::MergedSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;
use yaba_types::{Entity, OpLogEntry, ReplicaId, Timestamp, Tombstone};

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u32 = 1;

/// Error codes carried by [`ErrorMessage`].
pub mod codes {
    /// Malformed or out-of-sequence message.
    pub const PROTOCOL: u32 = 400;
    /// Protocol versions differ.
    pub const VERSION_MISMATCH: u32 = 409;
    /// The responder cannot serve the op-log path and asks for snapshots.
    pub const FULL_SYNC_REQUIRED: u32 = 412;
    /// The merged snapshot differs from the one the responder computed.
    pub const MERGE_MISMATCH: u32 = 422;
    /// The responder failed locally.
    pub const INTERNAL: u32 = 500;
}

/// A message plus its correlation ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEnvelope {
    pub id: Uuid,
    #[serde(default)]
    pub in_reply_to: Option<Uuid>,
    pub message: SyncMessage,
}

impl SyncEnvelope {
    /// Wraps a message that expects a reply.
    pub fn request(message: SyncMessage) -> Self {
        Self {
            id: Uuid::now_v7(),
            in_reply_to: None,
            message,
        }
    }

    /// Wraps the reply to `request_id`.
    pub fn reply(request_id: Uuid, message: SyncMessage) -> Self {
        Self {
            id: Uuid::now_v7(),
            in_reply_to: Some(request_id),
            message,
        }
    }
}

/// A sync protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Sent first by both sides.
    Handshake(HandshakeMessage),

    /// The sender's whole delete-log.
    DeleteLogExchange(DeleteLogMessage),

    /// Every live entity the sender holds.
    FullDataExchange(FullDataMessage),

    /// Op-log entries the receiver has not integrated.
    OpsExchange(OpsMessage),

    /// Ends the data phase. Carries the merged snapshot in full mode.
    SyncComplete(SyncCompleteMessage),

    /// Acknowledges a message by id.
    Acknowledge(AcknowledgeMessage),

    /// Error message.
    Error(ErrorMessage),
}

impl SyncMessage {
    /// Variant name, for logging and protocol errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "Handshake",
            Self::DeleteLogExchange(_) => "DeleteLogExchange",
            Self::FullDataExchange(_) => "FullDataExchange",
            Self::OpsExchange(_) => "OpsExchange",
            Self::SyncComplete(_) => "SyncComplete",
            Self::Acknowledge(_) => "Acknowledge",
            Self::Error(_) => "Error",
        }
    }
}

/// Identity and replication position of the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeMessage {
    pub version: u32,
    pub device_id: ReplicaId,
    pub device_name: String,
    pub timestamp: Timestamp,
    /// Highest sequence number integrated per origin. Contains the sender's
    /// own id and one entry per replica it holds a cursor for.
    #[serde(default)]
    pub heads: BTreeMap<ReplicaId, u64>,
}

impl HandshakeMessage {
    pub fn new(device_id: ReplicaId, device_name: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            device_id,
            device_name: device_name.into(),
            timestamp: Timestamp::now(),
            heads: BTreeMap::new(),
        }
    }

    pub fn with_heads(mut self, heads: BTreeMap<ReplicaId, u64>) -> Self {
        self.heads = heads;
        self
    }

    /// Whether the sender holds a cursor for `replica`.
    pub fn knows(&self, replica: ReplicaId) -> bool {
        self.heads.contains_key(&replica)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteLogMessage {
    pub tombstones: Vec<Tombstone>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullDataMessage {
    pub snapshot: Vec<Entity>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsMessage {
    /// Ascending by `(origin, seq)`.
    pub ops: Vec<OpLogEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCompleteMessage {
    #[serde(default)]
    pub merged: Option<MergedSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcknowledgeMessage {
    pub event_id: Uuid,
    pub timestamp: Timestamp,
}

impl AcknowledgeMessage {
    pub fn new(event_id: Uuid) -> Self {
        Self {
            event_id,
            timestamp: Timestamp::now(),
        }
    }
}

/// Error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub code: u32,
    pub message: String,
}

impl ErrorMessage {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
