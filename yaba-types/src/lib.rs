//! Core type definitions for YABA.
//!
//! This crate defines the plain data types shared by the storage and sync
//! layers:
//! - Entity, replica and tombstone identifiers (UUID v7)
//! - Logical timestamps used for `editedAt` and tombstones
//! - The entity documents that live in the filesystem store
//! - Op-log entries, their payloads and typed field deltas
//! - The per-entity version and its deterministic tie-break
//!
//! Nothing in here performs I/O.

mod entity;
mod ids;
mod op;
mod timestamp;
mod tombstone;
mod version;

pub use entity::{
    Asset, Bookmark, Entity, EntityKind, Folder, Highlight, HighlightAnchor, LinkDetail,
    ReadableVersion, Tag,
};
pub use ids::{EntityId, ReplicaId, TombstoneId};
pub use op::{ActionType, FieldChange, OpDraft, OpLogEntry, OpPayload};
pub use timestamp::Timestamp;
pub use tombstone::Tombstone;
pub use version::Version;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("unknown entity kind: {0}")]
    UnknownEntityKind(String),

    #[error("field change {change} does not apply to a {kind}")]
    FieldMismatch { change: &'static str, kind: EntityKind },
}
