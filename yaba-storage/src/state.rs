//! Cache state machine.
//!
//! ```text
//! Idle ──► Syncing ──► InSync
//!             │
//!             └──────► SyncFailed
//! ```
//!
//! `SyncNeeded` is entered when drift is detected. `RebuildRequired` is the
//! state found on open when a full rebuild was interrupted; the cache stays
//! unusable until a rebuild completes.

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CacheState {
    /// No rebuild or repair has run yet.
    #[default]
    Idle,
    Syncing,
    InSync,
    SyncNeeded,
    SyncFailed { reason: String },
    RebuildRequired,
}

impl CacheState {
    /// Whether queries may be served in this state.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Idle | Self::InSync | Self::SyncNeeded)
    }
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Syncing => f.write_str("syncing"),
            Self::InSync => f.write_str("in sync"),
            Self::SyncNeeded => f.write_str("sync needed"),
            Self::SyncFailed { reason } => write!(f, "sync failed: {reason}"),
            Self::RebuildRequired => f.write_str("rebuild required"),
        }
    }
}

/// Shared, observable cache state.
#[derive(Clone)]
pub struct CacheStatus {
    tx: Arc<watch::Sender<CacheState>>,
}

impl CacheStatus {
    pub fn new(initial: CacheState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> CacheState {
        self.tx.borrow().clone()
    }

    pub fn set(&self, state: CacheState) {
        self.tx.send_replace(state);
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<CacheState> {
        self.tx.subscribe()
    }
}

impl Default for CacheStatus {
    fn default() -> Self {
        Self::new(CacheState::Idle)
    }
}
