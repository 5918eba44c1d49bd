//! Sync sessions between two replicas.
//!
//! The initiator drives the session: it sends one request per phase and
//! awaits the reply that names it, under the configured timeout. The
//! responder answers each request in turn. Nothing is written locally until
//! both sides hold the full merged result; the responder persists before it
//! acknowledges `SyncComplete`, the initiator after it receives that
//! acknowledgement.

use crate::applicator::{ApplyReport, PersistStats};
use crate::engine::LocalReplica;
use crate::error::{SyncError, SyncResult};
use crate::merge::{MergedSnapshot, SnapshotSide, merge};
use crate::protocol::{
    AcknowledgeMessage, DeleteLogMessage, ErrorMessage, FullDataMessage, HandshakeMessage,
    OpsMessage, PROTOCOL_VERSION, SyncCompleteMessage, SyncEnvelope, SyncMessage, codes,
};
use crate::state::{ProgressTracker, SyncProgress};
use crate::transport::SyncChannel;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;
use yaba_types::{Entity, OpLogEntry, ReplicaId, Tombstone};

/// How the data phase ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Whole snapshots, merged record by record.
    Full,
    /// Op-log entries past each side's cursors.
    Incremental,
}

/// What a finished session did locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    pub peer: ReplicaId,
    pub peer_name: String,
    pub mode: SyncMode,
    pub written: usize,
    pub deleted: usize,
    pub ops: ApplyReport,
}

/// Cancels a running session at its next suspension point.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Data held between the data phase and the commit.
enum Exchanged {
    Full {
        local: Vec<Entity>,
        remote: Vec<Entity>,
    },
    Incremental {
        received: Vec<OpLogEntry>,
    },
}

impl Exchanged {
    fn mode(&self) -> SyncMode {
        match self {
            Self::Full { .. } => SyncMode::Full,
            Self::Incremental { .. } => SyncMode::Incremental,
        }
    }
}

/// One sync session over one channel.
pub struct SyncSession<C> {
    replica: LocalReplica,
    channel: C,
    progress: ProgressTracker,
    cancel: CancelHandle,
    cancel_rx: watch::Receiver<bool>,
    reported: bool,
}

impl<C: SyncChannel> SyncSession<C> {
    pub fn new(replica: LocalReplica, channel: C) -> Self {
        let (tx, cancel_rx) = watch::channel(false);
        Self {
            replica,
            channel,
            progress: ProgressTracker::new(),
            cancel: CancelHandle { tx: Arc::new(tx) },
            cancel_rx,
            reported: false,
        }
    }

    pub fn progress(&self) -> watch::Receiver<SyncProgress> {
        self.progress.subscribe()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Runs the session as the side that starts it.
    pub async fn initiate(mut self) -> SyncResult<SyncSummary> {
        let result = self.run_initiator().await;
        if let Err(e) = &result {
            self.abort(e, None).await;
        }
        result
    }

    /// Runs the session as the side that answers.
    pub async fn respond(mut self) -> SyncResult<SyncSummary> {
        let mut last_request = None;
        let result = self.run_responder(&mut last_request).await;
        if let Err(e) = &result {
            self.abort(e, last_request).await;
        }
        result
    }

    // ── Initiator ────────────────────────────────────────────────

    async fn run_initiator(&mut self) -> SyncResult<SyncSummary> {
        let me = self.replica.device_id();
        let local_heads = self.replica.heads().await?;

        let hello = HandshakeMessage::new(me, self.replica.config().device_name.clone())
            .with_heads(local_heads.clone());
        let (_, reply) = self.request(SyncMessage::Handshake(hello)).await?;
        let peer = match reply {
            SyncMessage::Handshake(peer) => peer,
            other => return Err(unexpected("Handshake", other)),
        };
        self.verify_handshake(&peer, None).await?;
        info!(peer = %peer.device_id, name = %peer.device_name, "handshake complete");

        self.advance(SyncProgress::ExchangingDeleteLogs)?;
        let local_tombstones = self.replica.tombstones().await?;
        let (_, reply) = self
            .request(SyncMessage::DeleteLogExchange(DeleteLogMessage {
                tombstones: local_tombstones.clone(),
            }))
            .await?;
        let remote = match reply {
            SyncMessage::DeleteLogExchange(remote) => remote,
            other => return Err(unexpected("DeleteLogExchange", other)),
        };
        let remote_tombstones = remote.tombstones;
        debug!(
            local = local_tombstones.len(),
            remote = remote_tombstones.len(),
            "exchanged delete logs"
        );

        self.advance(SyncProgress::SendingData)?;
        let mut exchanged = None;
        if peer.knows(me) && local_heads.contains_key(&peer.device_id) {
            match self.replica.ops_for(peer.heads.clone()).await? {
                Some(ops) => {
                    let sent = ops.len();
                    let (_, reply) = self
                        .request(SyncMessage::OpsExchange(OpsMessage { ops }))
                        .await?;
                    match reply {
                        SyncMessage::OpsExchange(remote) => {
                            debug!(sent, received = remote.ops.len(), "exchanged ops");
                            exchanged = Some(Exchanged::Incremental {
                                received: remote.ops,
                            });
                        }
                        SyncMessage::Error(e) if e.code == codes::FULL_SYNC_REQUIRED => {
                            info!(reason = %e.message, "peer asked for a full exchange");
                        }
                        other => return Err(unexpected("OpsExchange", other)),
                    }
                }
                None => info!("op log cannot serve the peer, falling back to a full exchange"),
            }
        }
        let exchanged = match exchanged {
            Some(exchanged) => exchanged,
            None => {
                let local = self.replica.snapshot().await?;
                let (_, reply) = self
                    .request(SyncMessage::FullDataExchange(FullDataMessage {
                        snapshot: local.clone(),
                    }))
                    .await?;
                let remote = match reply {
                    SyncMessage::FullDataExchange(remote) => remote,
                    other => return Err(unexpected("FullDataExchange", other)),
                };
                debug!(sent = local.len(), received = remote.snapshot.len(), "exchanged snapshots");
                Exchanged::Full {
                    local,
                    remote: remote.snapshot,
                }
            }
        };
        self.advance(SyncProgress::ReceivingData)?;

        self.advance(SyncProgress::MergingData)?;
        let merged = match &exchanged {
            Exchanged::Full { local, remote } => Some(merge(
                SnapshotSide {
                    replica: me,
                    entities: local,
                    tombstones: &local_tombstones,
                },
                SnapshotSide {
                    replica: peer.device_id,
                    entities: remote,
                    tombstones: &remote_tombstones,
                },
            )?),
            Exchanged::Incremental { .. } => None,
        };

        let (complete_id, reply) = self
            .request(SyncMessage::SyncComplete(SyncCompleteMessage {
                merged: merged.clone(),
            }))
            .await?;
        match reply {
            SyncMessage::Acknowledge(ack) if ack.event_id == complete_id => {}
            SyncMessage::Acknowledge(ack) => {
                return Err(SyncError::Protocol(format!(
                    "acknowledgement names {}, expected {complete_id}",
                    ack.event_id
                )));
            }
            other => return Err(unexpected("Acknowledge", other)),
        }
        self.check_cancelled()?;

        let summary = self
            .commit(&peer, exchanged, merged, &remote_tombstones, local_heads)
            .await?;
        self.advance(SyncProgress::Completed)?;
        info!(
            peer = %summary.peer,
            mode = ?summary.mode,
            written = summary.written,
            deleted = summary.deleted,
            ops_applied = summary.ops.applied,
            "sync complete"
        );
        Ok(summary)
    }

    // ── Responder ────────────────────────────────────────────────

    async fn run_responder(&mut self, last_request: &mut Option<Uuid>) -> SyncResult<SyncSummary> {
        let me = self.replica.device_id();

        let request = self.recv_request(last_request).await?;
        let peer = match request.message {
            SyncMessage::Handshake(peer) => peer,
            other => return Err(unexpected("Handshake", other)),
        };
        self.verify_handshake(&peer, Some(request.id)).await?;
        let local_heads = self.replica.heads().await?;
        let hello = HandshakeMessage::new(me, self.replica.config().device_name.clone())
            .with_heads(local_heads.clone());
        self.reply(request.id, SyncMessage::Handshake(hello)).await?;
        info!(peer = %peer.device_id, name = %peer.device_name, "handshake complete");

        let request = self.recv_request(last_request).await?;
        let remote = match request.message {
            SyncMessage::DeleteLogExchange(remote) => remote,
            other => return Err(unexpected("DeleteLogExchange", other)),
        };
        self.advance(SyncProgress::ExchangingDeleteLogs)?;
        let remote_tombstones = remote.tombstones;
        let local_tombstones = self.replica.tombstones().await?;
        self.reply(
            request.id,
            SyncMessage::DeleteLogExchange(DeleteLogMessage {
                tombstones: local_tombstones.clone(),
            }),
        )
        .await?;

        let exchanged = loop {
            let request = self.recv_request(last_request).await?;
            match request.message {
                SyncMessage::FullDataExchange(remote) => {
                    self.advance(SyncProgress::SendingData)?;
                    let local = self.replica.snapshot().await?;
                    self.reply(
                        request.id,
                        SyncMessage::FullDataExchange(FullDataMessage {
                            snapshot: local.clone(),
                        }),
                    )
                    .await?;
                    break Exchanged::Full {
                        local,
                        remote: remote.snapshot,
                    };
                }
                SyncMessage::OpsExchange(remote) => {
                    let ops = if peer.knows(me) && local_heads.contains_key(&peer.device_id) {
                        self.replica.ops_for(peer.heads.clone()).await?
                    } else {
                        None
                    };
                    let Some(ops) = ops else {
                        info!("cannot serve ops to the peer, asking for a full exchange");
                        self.reply(
                            request.id,
                            SyncMessage::Error(ErrorMessage::new(
                                codes::FULL_SYNC_REQUIRED,
                                "op log cannot serve this peer",
                            )),
                        )
                        .await?;
                        continue;
                    };
                    self.advance(SyncProgress::SendingData)?;
                    self.reply(request.id, SyncMessage::OpsExchange(OpsMessage { ops }))
                        .await?;
                    break Exchanged::Incremental {
                        received: remote.ops,
                    };
                }
                other => return Err(unexpected("data exchange", other)),
            }
        };
        self.advance(SyncProgress::ReceivingData)?;

        let request = self.recv_request(last_request).await?;
        let complete = match request.message {
            SyncMessage::SyncComplete(complete) => complete,
            other => return Err(unexpected("SyncComplete", other)),
        };
        self.advance(SyncProgress::MergingData)?;
        let merged = match (&exchanged, complete.merged) {
            (Exchanged::Full { local, remote }, Some(received)) => {
                let computed = merge(
                    SnapshotSide {
                        replica: me,
                        entities: local,
                        tombstones: &local_tombstones,
                    },
                    SnapshotSide {
                        replica: peer.device_id,
                        entities: remote,
                        tombstones: &remote_tombstones,
                    },
                )?;
                if computed != received {
                    let reason = "merged snapshot differs from the local merge";
                    self.report(codes::MERGE_MISMATCH, reason, Some(request.id))
                        .await;
                    return Err(SyncError::Protocol(reason.into()));
                }
                Some(computed)
            }
            (Exchanged::Full { .. }, None) => {
                return Err(SyncError::MergeImpossible(
                    "full exchange completed without a merged snapshot".into(),
                ));
            }
            (Exchanged::Incremental { .. }, None) => None,
            (Exchanged::Incremental { .. }, Some(_)) => {
                return Err(SyncError::Protocol(
                    "merged snapshot sent for an incremental exchange".into(),
                ));
            }
        };
        self.check_cancelled()?;

        let summary = self
            .commit(&peer, exchanged, merged, &remote_tombstones, local_heads)
            .await?;
        self.reply(
            request.id,
            SyncMessage::Acknowledge(AcknowledgeMessage::new(request.id)),
        )
        .await?;
        self.advance(SyncProgress::Completed)?;
        info!(
            peer = %summary.peer,
            mode = ?summary.mode,
            written = summary.written,
            deleted = summary.deleted,
            ops_applied = summary.ops.applied,
            "sync complete"
        );
        Ok(summary)
    }

    // ── Commit ───────────────────────────────────────────────────

    async fn commit(
        &self,
        peer: &HandshakeMessage,
        exchanged: Exchanged,
        merged: Option<MergedSnapshot>,
        remote_tombstones: &[Tombstone],
        local_heads: BTreeMap<ReplicaId, u64>,
    ) -> SyncResult<SyncSummary> {
        let peer_id = peer.device_id;
        let mode = exchanged.mode();
        let applicator = self.replica.applicator().clone();

        let (stats, ops) = match (exchanged, merged) {
            (Exchanged::Full { .. }, Some(merged)) => {
                let stats = tokio::task::spawn_blocking(move || {
                    applicator.apply_merged(&merged, peer_id)
                })
                .await??;
                (stats, ApplyReport::default())
            }
            (Exchanged::Incremental { received }, _) => {
                let tombstones = remote_tombstones.to_vec();
                tokio::task::spawn_blocking(move || {
                    let stats = applicator.apply_tombstones(&tombstones, peer_id)?;
                    let ops = applicator.apply_remote(&received)?;
                    Ok::<(PersistStats, ApplyReport), SyncError>((stats, ops))
                })
                .await??
            }
            (Exchanged::Full { .. }, None) => {
                return Err(SyncError::MergeImpossible("no merged snapshot to persist".into()));
            }
        };

        self.replica
            .record_session(peer_id, peer.heads.clone(), local_heads, ops.clone())
            .await?;

        Ok(SyncSummary {
            peer: peer_id,
            peer_name: peer.device_name.clone(),
            mode,
            written: stats.written,
            deleted: stats.deleted,
            ops,
        })
    }

    // ── Messaging ────────────────────────────────────────────────

    /// Sends a request and waits for the reply that names it.
    async fn request(&mut self, message: SyncMessage) -> SyncResult<(Uuid, SyncMessage)> {
        self.check_cancelled()?;
        let envelope = SyncEnvelope::request(message);
        debug!(message = envelope.message.name(), id = %envelope.id, "sending request");
        self.channel.send(&envelope).await?;

        let reply = self.recv().await?;
        if reply.in_reply_to != Some(envelope.id) {
            return Err(match reply.message {
                SyncMessage::Error(e) => SyncError::PeerError {
                    code: e.code,
                    message: e.message,
                },
                other => SyncError::Protocol(format!(
                    "{} does not answer request {}",
                    other.name(),
                    envelope.id
                )),
            });
        }
        debug!(message = reply.message.name(), "received reply");
        Ok((envelope.id, reply.message))
    }

    /// Waits for the next request. An error from the peer ends the session.
    async fn recv_request(&mut self, last_request: &mut Option<Uuid>) -> SyncResult<SyncEnvelope> {
        self.check_cancelled()?;
        let envelope = self.recv().await?;
        if envelope.in_reply_to.is_some() {
            return Err(SyncError::Protocol(format!(
                "expected a request, got a reply ({})",
                envelope.message.name()
            )));
        }
        if let SyncMessage::Error(e) = envelope.message {
            return Err(SyncError::PeerError {
                code: e.code,
                message: e.message,
            });
        }
        debug!(message = envelope.message.name(), id = %envelope.id, "received request");
        *last_request = Some(envelope.id);
        Ok(envelope)
    }

    async fn reply(&mut self, request_id: Uuid, message: SyncMessage) -> SyncResult<()> {
        let envelope = SyncEnvelope::reply(request_id, message);
        debug!(message = envelope.message.name(), "sending reply");
        self.channel.send(&envelope).await
    }

    async fn recv(&mut self) -> SyncResult<SyncEnvelope> {
        let timeout = self.replica.config().timeout();
        tokio::select! {
            biased;
            () = cancelled(&mut self.cancel_rx) => Err(SyncError::Cancelled),
            received = tokio::time::timeout(timeout, self.channel.recv()) => {
                received.map_err(|_| SyncError::Timeout)?
            }
        }
    }

    // ── Bookkeeping ──────────────────────────────────────────────

    /// Rejects an incompatible or self-addressed handshake, telling the peer
    /// why.
    async fn verify_handshake(
        &mut self,
        peer: &HandshakeMessage,
        reply_to: Option<Uuid>,
    ) -> SyncResult<()> {
        let (code, reason) = if peer.version != PROTOCOL_VERSION {
            (
                codes::VERSION_MISMATCH,
                format!(
                    "protocol version {} is not supported (expected {PROTOCOL_VERSION})",
                    peer.version
                ),
            )
        } else if peer.device_id == self.replica.device_id() {
            (codes::PROTOCOL, "peer has this replica's id".to_string())
        } else {
            return Ok(());
        };
        self.report(code, &reason, reply_to).await;
        Err(SyncError::Protocol(reason))
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if *self.cancel_rx.borrow() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    fn advance(&self, next: SyncProgress) -> SyncResult<()> {
        debug!(phase = %next, "sync phase");
        self.progress.advance(next)
    }

    /// Marks the session failed and tells the peer, unless the peer is gone
    /// or reported the failure itself.
    async fn abort(&mut self, error: &SyncError, reply_to: Option<Uuid>) {
        warn!(error = %error, "sync session failed");
        self.progress.fail(error.to_string());
        if self.reported {
            return;
        }
        let code = match error {
            SyncError::ChannelClosed
            | SyncError::Network(_)
            | SyncError::PeerError { .. }
            | SyncError::Timeout => return,
            SyncError::Protocol(_) => codes::PROTOCOL,
            _ => codes::INTERNAL,
        };
        self.report(code, &error.to_string(), reply_to).await;
    }

    /// Sends an error to the peer, once per session.
    async fn report(&mut self, code: u32, reason: &str, reply_to: Option<Uuid>) {
        if self.reported {
            return;
        }
        self.reported = true;
        let message = SyncMessage::Error(ErrorMessage::new(code, reason));
        let envelope = match reply_to {
            Some(id) => SyncEnvelope::reply(id, message),
            None => SyncEnvelope::request(message),
        };
        if let Err(e) = self.channel.send(&envelope).await {
            debug!(error = %e, "could not report failure to peer");
        }
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn unexpected(expected: &str, got: SyncMessage) -> SyncError {
    match got {
        SyncMessage::Error(e) => SyncError::PeerError {
            code: e.code,
            message: e.message,
        },
        other => SyncError::Protocol(format!("expected {expected}, got {}", other.name())),
    }
}
