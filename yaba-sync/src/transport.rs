//! Transport layer abstraction.
//!
//! A session only needs an ordered duplex channel that moves one envelope at
//! a time. Connection setup and peer discovery happen outside this crate; any
//! connected byte stream can be wrapped in a [`FramedChannel`].

use crate::codec::{read_message, write_message};
use crate::error::{SyncError, SyncResult};
use crate::protocol::SyncEnvelope;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// An ordered, connected message channel to one peer.
#[async_trait]
pub trait SyncChannel: Send {
    /// Sends one envelope.
    async fn send(&mut self, envelope: &SyncEnvelope) -> SyncResult<()>;

    /// Receives the next envelope. Fails with [`SyncError::ChannelClosed`]
    /// once the peer has gone away.
    async fn recv(&mut self) -> SyncResult<SyncEnvelope>;
}

/// A [`SyncChannel`] over a byte stream, using the length-prefixed codec.
pub struct FramedChannel<S> {
    stream: S,
}

impl<S> FramedChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[async_trait]
impl<S> SyncChannel for FramedChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, envelope: &SyncEnvelope) -> SyncResult<()> {
        write_message(&mut self.stream, envelope).await?;
        Ok(())
    }

    async fn recv(&mut self) -> SyncResult<SyncEnvelope> {
        Ok(read_message(&mut self.stream).await?)
    }
}

/// In-process channel pair, for tests and same-process peers.
pub struct MemoryChannel {
    tx: mpsc::UnboundedSender<SyncEnvelope>,
    rx: mpsc::UnboundedReceiver<SyncEnvelope>,
}

impl MemoryChannel {
    /// Two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Self { tx: a_tx, rx: a_rx },
            Self { tx: b_tx, rx: b_rx },
        )
    }
}

#[async_trait]
impl SyncChannel for MemoryChannel {
    async fn send(&mut self, envelope: &SyncEnvelope) -> SyncResult<()> {
        self.tx
            .send(envelope.clone())
            .map_err(|_| SyncError::ChannelClosed)
    }

    async fn recv(&mut self) -> SyncResult<SyncEnvelope> {
        self.rx.recv().await.ok_or(SyncError::ChannelClosed)
    }
}
