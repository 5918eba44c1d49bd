//! Device-to-device replication for YABA.
//!
//! # Architecture
//!
//! Every mutation is an op: `(origin replica, origin sequence)` identifies it
//! and its `(timestamp, origin)` version decides whether it wins against an
//! entity's clock. Replicas converge without coordination because that rule
//! is commutative and idempotent.
//!
//! ## Components
//!
//! - **Applicator**: applies local and remote ops, delete-logs and merged
//!   snapshots under the last-writer-wins and tombstone rules
//! - **Merge**: pure whole-record merge of two snapshots plus delete-logs
//! - **Protocol**: the session messages, with correlation ids
//! - **Transport**: the ordered channel a session runs over
//! - **Engine**: the local replica and its mutation API
//! - **Orchestrator**: runs one session, as initiator or responder
//!
//! ## Sync Process
//!
//! 1. **Handshake**: exchange ids, protocol version and per-origin heads
//! 2. **Delete logs**: exchange tombstone sets before any data
//! 3. **Data**: full snapshots on first contact, op-log entries afterwards
//! 4. **Commit**: verify the merged result, persist, acknowledge
//!
//! # Example
//!
//! ```no_run
//! use yaba_storage::{Storage, StoreConfig};
//! use yaba_sync::{LocalReplica, MemoryChannel, SyncConfig, SyncSession};
//!
//! # async fn demo() -> yaba_sync::SyncResult<()> {
//! let laptop = LocalReplica::open(&StoreConfig::in_dir("/tmp/laptop"), SyncConfig::default())?;
//! let phone = LocalReplica::open(&StoreConfig::in_dir("/tmp/phone"), SyncConfig::default())?;
//!
//! let (a, b) = MemoryChannel::pair();
//! let (left, right) = tokio::join!(
//!     SyncSession::new(laptop, a).initiate(),
//!     SyncSession::new(phone, b).respond(),
//! );
//! left?;
//! right?;
//! # Ok(())
//! # }
//! ```

pub mod applicator;
pub mod codec;
mod engine;
mod error;
pub mod merge;
mod orchestrator;
pub mod protocol;
pub mod state;
pub mod transport;

pub use applicator::{ApplyOutcome, ApplyReport, OpApplicator, PersistStats};
pub use engine::{CompactionStats, LocalReplica, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use merge::{MergedSnapshot, SnapshotSide, merge, merge_tombstones};
pub use orchestrator::{CancelHandle, SyncMode, SyncSession, SyncSummary};
pub use protocol::{
    AcknowledgeMessage, DeleteLogMessage, ErrorMessage, FullDataMessage, HandshakeMessage,
    OpsMessage, PROTOCOL_VERSION, SyncCompleteMessage, SyncEnvelope, SyncMessage,
};
pub use state::{ProgressTracker, SyncProgress};
pub use transport::{FramedChannel, MemoryChannel, SyncChannel};
