//! In-process host channel.
//!
//! Connects a coordinator and any number of peers living in the same
//! process through unbounded tokio channels. One inbox per peer gives
//! per-peer FIFO delivery. Dropping a peer's [`LinkOutbox`] (or calling
//! [`Hub::disconnect`]) is the disconnect notification.

use crate::channel::{ChannelError, ChannelEvent, HostChannel, PeerOutbox, PendingReplies, Result};
use crate::protocol::Envelope;
use crate::PeerId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

struct HubInner {
    peers: RwLock<HashMap<PeerId, mpsc::UnboundedSender<Envelope>>>,
    replies: Arc<PendingReplies>,
    next_peer_id: AtomicU64,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl HubInner {
    /// Remove a peer and report it, once.
    fn drop_peer(&self, peer_id: PeerId) {
        let removed = self
            .peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&peer_id)
            .is_some();
        if removed {
            debug!("Hub: peer {} disconnected", peer_id);
            let _ = self.events.send(ChannelEvent::PeerDisconnected { peer_id });
        }
    }
}

/// In-process channel hub. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Create a hub and the event stream the coordinator consumes.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let hub = Self {
            inner: Arc::new(HubInner {
                peers: RwLock::new(HashMap::new()),
                replies: Arc::new(PendingReplies::new()),
                next_peer_id: AtomicU64::new(1),
                events,
            }),
        };
        (hub, events_rx)
    }

    /// Open a channel for a new peer and announce it.
    pub fn attach(&self) -> PeerLink {
        let peer_id = PeerId::new(self.inner.next_peer_id.fetch_add(1, Ordering::Relaxed));
        self.attach_as(peer_id)
    }

    /// Open a channel under a caller-chosen id.
    pub fn attach_as(&self, peer_id: PeerId) -> PeerLink {
        let link = self.open(peer_id);
        let _ = self.inner.events.send(ChannelEvent::PeerConnected { peer_id });
        debug!("Hub: peer {} attached", peer_id);
        link
    }

    /// Open a channel without announcing it to the coordinator.
    ///
    /// Simulates a peer that outlived a coordinator restart: it is
    /// addressable (it can answer probes) but the coordinator only learns
    /// about it through a restore.
    pub fn attach_silently(&self, peer_id: PeerId) -> PeerLink {
        self.open(peer_id)
    }

    fn open(&self, peer_id: PeerId) -> PeerLink {
        let (tx, inbox) = mpsc::unbounded_channel();
        self.inner
            .peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer_id, tx);
        PeerLink {
            peer_id,
            outbox: Arc::new(LinkOutbox {
                peer_id,
                hub: Arc::clone(&self.inner),
            }),
            inbox,
        }
    }

    /// Force-close a peer's channel, as if it errored.
    pub fn disconnect(&self, peer_id: PeerId) {
        self.inner.drop_peer(peer_id);
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl HostChannel for Hub {
    fn is_addressable(&self, peer_id: PeerId) -> bool {
        self.inner
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&peer_id)
    }

    async fn send(&self, peer_id: PeerId, envelope: Envelope) -> Result<()> {
        let peers = self.inner.peers.read().unwrap_or_else(|e| e.into_inner());
        let tx = peers.get(&peer_id).ok_or(ChannelError::PeerNotFound(peer_id))?;
        tx.send(envelope)
            .map_err(|_| ChannelError::SendFailed(format!("inbox of peer {peer_id} is gone")))
    }

    async fn request(&self, peer_id: PeerId, envelope: Envelope) -> Result<Envelope> {
        let (resid, guard) = self.inner.replies.register();
        self.send(peer_id, envelope.with_resid(resid)).await?;
        guard.recv().await
    }
}

/// One peer's end of the hub.
pub struct PeerLink {
    pub peer_id: PeerId,
    pub outbox: Arc<LinkOutbox>,
    pub inbox: mpsc::UnboundedReceiver<Envelope>,
}

/// Sender from a peer to the coordinator. Dropping it disconnects the peer.
pub struct LinkOutbox {
    peer_id: PeerId,
    hub: Arc<HubInner>,
}

#[async_trait]
impl PeerOutbox for LinkOutbox {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        let connected = self
            .hub
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&self.peer_id);
        if !connected {
            return Err(ChannelError::PeerNotFound(self.peer_id));
        }
        if let Some(envelope) = self.hub.replies.resolve(envelope) {
            self.hub
                .events
                .send(ChannelEvent::Message {
                    peer_id: self.peer_id,
                    envelope,
                })
                .map_err(|_| ChannelError::SendFailed("coordinator is gone".to_string()))?;
        }
        Ok(())
    }
}

impl Drop for LinkOutbox {
    fn drop(&mut self) {
        self.hub.drop_peer(self.peer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;

    #[tokio::test]
    async fn test_attach_assigns_fresh_ids_and_announces() {
        let (hub, mut events) = Hub::new();
        let a = hub.attach();
        let b = hub.attach();
        assert_ne!(a.peer_id, b.peer_id);

        for expected in [a.peer_id, b.peer_id] {
            match events.recv().await.unwrap() {
                ChannelEvent::PeerConnected { peer_id } => assert_eq!(peer_id, expected),
                other => panic!("Expected PeerConnected, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_send_preserves_per_peer_order() {
        let (hub, _events) = Hub::new();
        let mut link = hub.attach();

        hub.send(link.peer_id, Envelope::to_peer(Message::SetRoleFollower))
            .await
            .unwrap();
        hub.send(link.peer_id, Envelope::to_peer(Message::SetRoleLeader))
            .await
            .unwrap();

        assert_eq!(link.inbox.recv().await.unwrap().message, Message::SetRoleFollower);
        assert_eq!(link.inbox.recv().await.unwrap().message, Message::SetRoleLeader);
    }

    #[tokio::test]
    async fn test_request_is_answered_below_event_stream() {
        let (hub, mut events) = Hub::new();
        let mut link = hub.attach();
        let peer_id = link.peer_id;
        let _ = events.recv().await; // PeerConnected

        let responder = tokio::spawn(async move {
            let request = link.inbox.recv().await.unwrap();
            link.outbox.send(request.reply(Message::Alive)).await.unwrap();
            link
        });

        let reply = hub
            .request(peer_id, Envelope::to_peer(Message::ConfirmAlive))
            .await
            .unwrap();
        assert_eq!(reply.message, Message::Alive);

        let _link = responder.await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropping_outbox_reports_disconnect_once() {
        let (hub, mut events) = Hub::new();
        let link = hub.attach();
        let peer_id = link.peer_id;
        let _ = events.recv().await;

        hub.disconnect(peer_id);
        drop(link);

        match events.recv().await.unwrap() {
            ChannelEvent::PeerDisconnected { peer_id: id } => assert_eq!(id, peer_id),
            other => panic!("Expected PeerDisconnected, got {:?}", other),
        }
        assert!(events.try_recv().is_err());
        assert!(!hub.is_addressable(peer_id));
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let (hub, _events) = Hub::new();
        let result = hub
            .send(PeerId::new(77), Envelope::to_peer(Message::ConfirmAlive))
            .await;
        assert!(matches!(result, Err(ChannelError::PeerNotFound(_))));
    }
}
