//! Individual peer connection management.
//!
//! Each peer connection wraps a WebSocket stream, handling the split
//! between read and write halves for async operation.

use anyhow::{anyhow, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use relay_core::protocol::MAX_MESSAGE_SIZE;
use relay_core::PeerId;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, error, warn};

/// Event emitted by a connection's read task.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Raw frame received from the peer
    Frame { peer_id: PeerId, data: Vec<u8> },
    /// Connection was closed
    Closed { peer_id: PeerId },
}

/// A single WebSocket connection to a peer.
pub struct PeerConnection {
    pub peer_id: PeerId,
    /// Write half of the WebSocket
    write: Mutex<SplitSink<WebSocketStream<TcpStream>, Message>>,
    /// Handle to the read task, once started
    read_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PeerConnection {
    /// Wrap the write half of an accepted WebSocket.
    ///
    /// Reading starts separately with [`PeerConnection::start_reading`], so
    /// the host can register the connection before any frame arrives.
    pub fn new(peer_id: PeerId, write: SplitSink<WebSocketStream<TcpStream>, Message>) -> Self {
        Self {
            peer_id,
            write: Mutex::new(write),
            read_task: std::sync::Mutex::new(None),
        }
    }

    /// Spawn the read task that forwards frames to the event channel.
    pub fn start_reading(
        &self,
        read: SplitStream<WebSocketStream<TcpStream>>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        let peer_id = self.peer_id;
        let task = tokio::spawn(async move {
            Self::read_loop(peer_id, read, event_tx).await;
        });
        *self.read_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    async fn read_loop(
        peer_id: PeerId,
        mut read: SplitStream<WebSocketStream<TcpStream>>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let data = match msg {
                        Message::Text(text) => text.as_bytes().to_vec(),
                        Message::Binary(data) => data.to_vec(),
                        Message::Close(_) => {
                            debug!("Received close frame from {}", peer_id);
                            break;
                        }
                        _ => continue,
                    };

                    if data.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            "Message from {} exceeds max size ({} > {}), dropping",
                            peer_id,
                            data.len(),
                            MAX_MESSAGE_SIZE
                        );
                        continue;
                    }

                    let _ = event_tx.send(ConnectionEvent::Frame { peer_id, data });
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection {} closed", peer_id);
                        }
                        _ => {
                            error!("WebSocket error on {}: {}", peer_id, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", peer_id);
                    break;
                }
            }
        }

        let _ = event_tx.send(ConnectionEvent::Closed { peer_id });
    }

    /// Send one JSON text frame to the peer.
    pub async fn send_text(&self, text: String) -> Result<()> {
        let mut write = self.write.lock().await;
        write
            .send(Message::text(text))
            .await
            .map_err(|e| anyhow!("Failed to send message: {}", e))
    }

    /// Close the connection gracefully.
    pub async fn close(&self) {
        {
            let mut write = self.write.lock().await;
            let _ = write.send(Message::Close(None)).await;
        }
        if let Some(task) = self
            .read_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        if let Some(task) = self
            .read_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}
