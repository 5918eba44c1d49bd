//! Sync session progress.
//!
//! A session moves forward through the phases in declaration order and may
//! skip phases it has no work for. `Error` is reachable from any
//! non-terminal phase. `Completed` and `Error` are terminal.

use crate::error::{SyncError, SyncResult};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Where a sync session is.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyncProgress {
    #[default]
    Initializing,
    ExchangingDeleteLogs,
    SendingData,
    ReceivingData,
    MergingData,
    Completed,
    /// The session failed; carries the reason.
    Error(String),
}

impl SyncProgress {
    fn rank(&self) -> u8 {
        match self {
            Self::Initializing => 0,
            Self::ExchangingDeleteLogs => 1,
            Self::SendingData => 2,
            Self::ReceivingData => 3,
            Self::MergingData => 4,
            Self::Completed => 5,
            Self::Error(_) => 6,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error(_))
    }

    /// Whether a session in `self` may move to `next`.
    pub fn can_advance_to(&self, next: &Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Error(_) => true,
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for SyncProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => f.write_str("initializing"),
            Self::ExchangingDeleteLogs => f.write_str("exchanging delete logs"),
            Self::SendingData => f.write_str("sending data"),
            Self::ReceivingData => f.write_str("receiving data"),
            Self::MergingData => f.write_str("merging data"),
            Self::Completed => f.write_str("completed"),
            Self::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Observable progress of one session.
#[derive(Clone)]
pub struct ProgressTracker {
    tx: Arc<watch::Sender<SyncProgress>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SyncProgress::Initializing);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> SyncProgress {
        self.tx.borrow().clone()
    }

    /// Moves to `next`, rejecting backward moves and moves out of a terminal
    /// phase.
    pub fn advance(&self, next: SyncProgress) -> SyncResult<()> {
        let current = self.current();
        if !current.can_advance_to(&next) {
            return Err(SyncError::Protocol(format!(
                "invalid session transition from {current} to {next}"
            )));
        }
        self.tx.send_replace(next);
        Ok(())
    }

    /// Records a failure. A session that already finished keeps its phase.
    pub fn fail(&self, reason: impl Into<String>) {
        let next = SyncProgress::Error(reason.into());
        if self.current().can_advance_to(&next) {
            self.tx.send_replace(next);
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncProgress> {
        self.tx.subscribe()
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}
