//! Peer-side connection to the coordinator.
//!
//! Connects, waits for the `welcome` frame that carries the assigned peer id,
//! then decodes every following frame into an [`Envelope`] for the peer's
//! inbox.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use relay_core::channel::{self, ChannelError, PeerOutbox};
use relay_core::protocol::{Envelope, Welcome, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
use relay_core::PeerId;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long to wait for the coordinator's welcome.
const WELCOME_TIMEOUT: Duration = Duration::from_secs(5);

/// A live session with the coordinator.
pub struct Session {
    pub peer_id: PeerId,
    pub client: Arc<CoordinatorClient>,
    pub inbox: mpsc::UnboundedReceiver<Envelope>,
}

pub struct CoordinatorClient {
    write: Mutex<SplitSink<WsStream, Message>>,
    read_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CoordinatorClient {
    /// Connect to the coordinator at `url` and complete the welcome.
    pub async fn connect(url: &str) -> Result<Session> {
        let (ws_stream, _) = connect_async(url)
            .await
            .with_context(|| format!("Failed to connect to coordinator at {}", url))?;
        let (write, mut read) = ws_stream.split();

        let welcome = tokio::time::timeout(WELCOME_TIMEOUT, Self::expect_welcome(&mut read))
            .await
            .map_err(|_| anyhow!("Coordinator did not send a welcome"))??;
        if welcome.should_warn_version() {
            warn!(
                "Coordinator speaks protocol v{}, we speak v{}",
                welcome.version, PROTOCOL_VERSION
            );
        }
        info!("Connected to coordinator as peer {}", welcome.peer_id);

        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let read_task = tokio::spawn(Self::read_loop(read, inbox_tx));

        Ok(Session {
            peer_id: welcome.peer_id,
            client: Arc::new(Self {
                write: Mutex::new(write),
                read_task: std::sync::Mutex::new(Some(read_task)),
            }),
            inbox,
        })
    }

    async fn expect_welcome(read: &mut SplitStream<WsStream>) -> Result<Welcome> {
        while let Some(frame) = read.next().await {
            let data = match frame? {
                Message::Text(text) => text.as_bytes().to_vec(),
                Message::Binary(data) => data.to_vec(),
                Message::Close(_) => break,
                _ => continue,
            };
            return Welcome::from_json(&data).ok_or_else(|| anyhow!("First frame was not a welcome"));
        }
        bail!("Connection closed before welcome")
    }

    async fn read_loop(mut read: SplitStream<WsStream>, inbox: mpsc::UnboundedSender<Envelope>) {
        while let Some(frame) = read.next().await {
            let data = match frame {
                Ok(Message::Text(text)) => text.as_bytes().to_vec(),
                Ok(Message::Binary(data)) => data.to_vec(),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!("Coordinator connection error: {}", e);
                    break;
                }
            };
            if data.len() > MAX_MESSAGE_SIZE {
                warn!("Dropping oversized frame from coordinator ({} bytes)", data.len());
                continue;
            }
            match Envelope::decode(&data) {
                Ok(envelope) => {
                    if inbox.send(envelope).is_err() {
                        break;
                    }
                }
                Err(e) => debug!("Dropping frame from coordinator: {}", e),
            }
        }
        info!("Coordinator connection closed");
    }

    /// Leave the coordinator. The inbox closes once the read task stops.
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

#[async_trait]
impl PeerOutbox for CoordinatorClient {
    async fn send(&self, envelope: Envelope) -> channel::Result<()> {
        let mut write = self.write.lock().await;
        write
            .send(Message::text(envelope.encode()))
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }
}

impl Drop for CoordinatorClient {
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
