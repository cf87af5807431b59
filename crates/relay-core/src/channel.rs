//! Host messaging channel between the coordinator and its peers.
//!
//! Implementations:
//! - In-process: [`crate::hub::Hub`] (tokio channels)
//! - WebSocket: `WebSocketHost` in relay-daemon
//!
//! The coordinator side sends through [`HostChannel`] and consumes a stream of
//! [`ChannelEvent`]s; a peer sends through [`PeerOutbox`] and reads
//! envelopes from its own inbox.

use crate::protocol::{Direction, Envelope};
use crate::PeerId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Channel closed before a reply arrived")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Event observed by the coordinator side of the channel.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A peer opened its channel and was assigned `peer_id`.
    PeerConnected { peer_id: PeerId },
    /// A decoded envelope from a peer (replies to pending requests never show up here).
    Message { peer_id: PeerId, envelope: Envelope },
    /// A peer's channel closed or errored.
    PeerDisconnected { peer_id: PeerId },
}

/// Coordinator-side view of the channel.
#[async_trait]
pub trait HostChannel: Send + Sync {
    /// Whether the host can currently address this peer at all.
    fn is_addressable(&self, peer_id: PeerId) -> bool;

    /// Deliver an envelope to one peer. Per-peer order is preserved.
    async fn send(&self, peer_id: PeerId, envelope: Envelope) -> Result<()>;

    /// Send a request and wait for the peer's reply (matched by resid).
    ///
    /// Does not time out on its own; callers bound it.
    async fn request(&self, peer_id: PeerId, envelope: Envelope) -> Result<Envelope>;
}

/// Peer-side sender towards the coordinator.
#[async_trait]
pub trait PeerOutbox: Send + Sync {
    async fn send(&self, envelope: Envelope) -> Result<()>;
}

/// Table of requests awaiting a reply, keyed by resid.
///
/// Shared by channel implementations so that replies are matched below the
/// coordinator's event queue.
pub struct PendingReplies {
    next_resid: AtomicU64,
    waiting: Mutex<HashMap<u64, oneshot::Sender<Envelope>>>,
}

impl Default for PendingReplies {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingReplies {
    pub fn new() -> Self {
        Self {
            next_resid: AtomicU64::new(1),
            waiting: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve a resid and a receiver for its reply.
    ///
    /// The returned guard removes the entry when dropped, so an abandoned
    /// (timed-out) request does not linger.
    pub fn register(self: &Arc<Self>) -> (u64, ReplyGuard) {
        let resid = self.next_resid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(resid, tx);
        (
            resid,
            ReplyGuard {
                pending: Arc::clone(self),
                resid,
                rx: Some(rx),
            },
        )
    }

    /// Hand a reply to its waiting request.
    ///
    /// Only unaddressed `to-background` replies are candidates; replies one
    /// peer addresses to another pass through. Returns the envelope back
    /// when nothing was waiting for it.
    pub fn resolve(&self, envelope: Envelope) -> Option<Envelope> {
        let for_host = envelope.direction == Direction::ToBackground && envelope.to.is_none();
        if !envelope.is_reply() || !for_host {
            return Some(envelope);
        }
        let Some(resid) = envelope.resid else {
            return Some(envelope);
        };
        let waiter = self
            .waiting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&resid);
        match waiter {
            Some(tx) => {
                // Receiver may have given up already; nothing else to do.
                let _ = tx.send(envelope);
                None
            }
            None => Some(envelope),
        }
    }

    pub fn len(&self) -> usize {
        self.waiting.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cancel(&self, resid: u64) {
        self.waiting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&resid);
    }
}

/// Pending reply slot; see [`PendingReplies::register`].
pub struct ReplyGuard {
    pending: Arc<PendingReplies>,
    resid: u64,
    rx: Option<oneshot::Receiver<Envelope>>,
}

impl ReplyGuard {
    /// Wait for the reply.
    pub async fn recv(mut self) -> Result<Envelope> {
        let rx = self.rx.take().ok_or(ChannelError::Closed)?;
        rx.await.map_err(|_| ChannelError::Closed)
    }
}

impl Drop for ReplyGuard {
    fn drop(&mut self) {
        self.pending.cancel(self.resid);
    }
}
