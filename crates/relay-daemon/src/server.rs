//! WebSocket host channel.
//!
//! Peers (tabs) connect over WebSocket. Each accepted connection gets a
//! fresh id from a counter and a `welcome` frame carrying it; every frame
//! after that is a JSON envelope. Frames are decoded here, replies to
//! pending coordinator requests are matched here, and everything else is
//! surfaced as [`ChannelEvent`]s for the coordinator.

use crate::connection::{ConnectionEvent, PeerConnection};
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use relay_core::channel::{self, ChannelError, ChannelEvent, HostChannel, PendingReplies};
use relay_core::protocol::{Envelope, Welcome};
use relay_core::registry::MembershipRegistry;
use relay_core::store::KeyValueStore;
use relay_core::PeerId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};

struct HostInner {
    peers: RwLock<HashMap<PeerId, Arc<PeerConnection>>>,
    replies: Arc<PendingReplies>,
    next_peer_id: AtomicU64,
    events: mpsc::UnboundedSender<ChannelEvent>,
    conn_tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl HostInner {
    fn connection(&self, peer_id: PeerId) -> Option<Arc<PeerConnection>> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&peer_id)
            .cloned()
    }

    fn drop_peer(&self, peer_id: PeerId) {
        let removed = self
            .peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&peer_id);
        if removed.is_some() {
            info!("Peer {} disconnected", peer_id);
            let _ = self.events.send(ChannelEvent::PeerDisconnected { peer_id });
        }
    }

    fn on_frame(&self, peer_id: PeerId, data: &[u8]) {
        let envelope = match Envelope::decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Dropping frame from {}: {}", peer_id, e);
                return;
            }
        };
        if let Some(envelope) = self.replies.resolve(envelope) {
            let _ = self.events.send(ChannelEvent::Message { peer_id, envelope });
        }
    }
}

/// WebSocket server that peers connect to. Cheap to clone.
#[derive(Clone)]
pub struct WebSocketHost {
    inner: Arc<HostInner>,
}

impl WebSocketHost {
    /// Create a host and the event stream the coordinator consumes.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        Self::starting_after(&[])
    }

    /// Create a host for a coordinator that restores membership from `store`.
    ///
    /// Ids handed out start above every persisted id, so a new peer can never
    /// be mistaken for one remembered from the previous run.
    pub async fn resume_from(
        store: &dyn KeyValueStore,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let persisted = match MembershipRegistry::persisted(store).await {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!("Could not read persisted membership, numbering from 1: {}", e);
                Vec::new()
            }
        };
        Self::starting_after(&persisted)
    }

    /// Create a host whose first assigned id is above every id in `reserved`.
    pub fn starting_after(reserved: &[PeerId]) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let first = reserved
            .iter()
            .map(|id| u64::from(*id))
            .max()
            .map_or(1, |highest| highest.saturating_add(1));
        debug!("Assigning peer ids from {}", first);

        let (events, events_rx) = mpsc::unbounded_channel();
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(HostInner {
            peers: RwLock::new(HashMap::new()),
            replies: Arc::new(PendingReplies::new()),
            next_peer_id: AtomicU64::new(first),
            events,
            conn_tx,
        });
        tokio::spawn(Self::pump(Arc::downgrade(&inner), conn_rx));
        (Self { inner }, events_rx)
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Coordinator listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let host = self.clone();
                    tokio::spawn(async move { host.accept_connection(stream, addr).await });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Upgrade a TCP connection, assign an id, send the welcome and announce it.
    pub async fn accept_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                // Port probes connect and close without finishing the upgrade.
                let err_str = e.to_string();
                if err_str.contains("Handshake not finished")
                    || err_str.contains("Connection reset")
                    || err_str.contains("unexpected EOF")
                {
                    debug!("Connection closed before upgrade from {}", addr);
                } else {
                    error!("WebSocket upgrade failed for {}: {}", addr, e);
                }
                return;
            }
        };

        let peer_id = PeerId::new(self.inner.next_peer_id.fetch_add(1, Ordering::Relaxed));
        let (write, read) = ws_stream.split();
        let conn = Arc::new(PeerConnection::new(peer_id, write));

        if let Err(e) = conn.send_text(Welcome::new(peer_id).to_json()).await {
            error!("Failed to welcome {} from {}: {}", peer_id, addr, e);
            return;
        }

        self.inner
            .peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer_id, Arc::clone(&conn));
        info!("Peer {} connected from {}", peer_id, addr);
        let _ = self.inner.events.send(ChannelEvent::PeerConnected { peer_id });

        conn.start_reading(read, self.inner.conn_tx.clone());
    }

    /// Close a peer's connection from the host side.
    pub async fn disconnect(&self, peer_id: PeerId) {
        if let Some(conn) = self.inner.connection(peer_id) {
            conn.close().await;
        }
        self.inner.drop_peer(peer_id);
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Turn raw connection events into channel events.
    async fn pump(
        inner: std::sync::Weak<HostInner>,
        mut conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        while let Some(event) = conn_rx.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            match event {
                ConnectionEvent::Frame { peer_id, data } => inner.on_frame(peer_id, &data),
                ConnectionEvent::Closed { peer_id } => inner.drop_peer(peer_id),
            }
        }
    }
}

#[async_trait]
impl HostChannel for WebSocketHost {
    fn is_addressable(&self, peer_id: PeerId) -> bool {
        self.inner.connection(peer_id).is_some()
    }

    async fn send(&self, peer_id: PeerId, envelope: Envelope) -> channel::Result<()> {
        let conn = self
            .inner
            .connection(peer_id)
            .ok_or(ChannelError::PeerNotFound(peer_id))?;
        conn.send_text(envelope.encode())
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }

    async fn request(&self, peer_id: PeerId, envelope: Envelope) -> channel::Result<Envelope> {
        let (resid, guard) = self.inner.replies.register();
        self.send(peer_id, envelope.with_resid(resid)).await?;
        guard.recv().await
    }
}
