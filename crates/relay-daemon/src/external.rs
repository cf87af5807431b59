//! Outgoing WebSocket connection to the external (editor) server.
//!
//! Manages the leader's single external connection, including:
//! - Connection establishment and status reporting
//! - Automatic reconnection with exponential backoff
//! - Parsing inbound frames into `ExternalResponse`s

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use relay_core::gateway::{ExternalEvent, ExternalLink, LinkError};
use relay_core::protocol::{ConnectionStatus, ExternalResponse, MAX_MESSAGE_SIZE};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before first reconnect attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum number of attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            max_attempts: None,
        }
    }
}

/// Calculates the next reconnection delay using exponential backoff.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Reconnection bookkeeping for one connection loop.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    /// Failed attempts since the last successful connection
    pub attempts: u32,
}

impl ReconnectState {
    /// Count a failed attempt and return how long to wait before the next.
    pub fn schedule(&mut self, config: &ReconnectConfig) -> Duration {
        self.attempts += 1;
        calculate_backoff(self.attempts, config)
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn exceeded_max_attempts(&self, config: &ReconnectConfig) -> bool {
        config
            .max_attempts
            .map(|max| self.attempts >= max)
            .unwrap_or(false)
    }
}

struct LinkInner {
    status: Mutex<ConnectionStatus>,
    writer: tokio::sync::Mutex<Option<SplitSink<WsStream, Message>>>,
    events: mpsc::UnboundedSender<ExternalEvent>,
    config: ReconnectConfig,
}

impl LinkInner {
    fn set_status(&self, status: ConnectionStatus) {
        let mut current = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if *current != status {
            *current = status;
            let _ = self.events.send(ExternalEvent::Status(status));
        }
    }
}

/// [`ExternalLink`] over a reconnecting WebSocket.
pub struct WebSocketLink {
    inner: Arc<LinkInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketLink {
    /// Create a closed link and the channel its events are reported on.
    pub fn new(config: ReconnectConfig) -> (Self, mpsc::UnboundedReceiver<ExternalEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let link = Self {
            inner: Arc::new(LinkInner {
                status: Mutex::new(ConnectionStatus::Uninstantiated),
                writer: tokio::sync::Mutex::new(None),
                events,
                config,
            }),
            task: Mutex::new(None),
        };
        (link, events_rx)
    }

    fn stop_task(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }

    async fn connection_loop(inner: Arc<LinkInner>, url: String) {
        let mut reconnect = ReconnectState::default();
        loop {
            inner.set_status(ConnectionStatus::Connecting);
            match connect_async(&url).await {
                Ok((ws_stream, _)) => {
                    info!("External connection to {} open", url);
                    reconnect.reset();
                    let (write, read) = ws_stream.split();
                    *inner.writer.lock().await = Some(write);
                    inner.set_status(ConnectionStatus::Open);

                    Self::read_loop(&inner, &url, read).await;

                    *inner.writer.lock().await = None;
                    inner.set_status(ConnectionStatus::Closed);
                }
                Err(e) => {
                    debug!("External connection to {} failed: {}", url, e);
                    inner.set_status(ConnectionStatus::Closed);
                }
            }

            let delay = reconnect.schedule(&inner.config);
            if reconnect.exceeded_max_attempts(&inner.config) {
                warn!("Giving up on {} after {} attempts", url, reconnect.attempts);
                return;
            }
            info!(
                "Scheduled reconnect to {} in {:?} (attempt {})",
                url, delay, reconnect.attempts
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn read_loop(inner: &LinkInner, url: &str, mut read: SplitStream<WsStream>) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let data = match msg {
                        Message::Text(text) => text.as_bytes().to_vec(),
                        Message::Binary(data) => data.to_vec(),
                        Message::Close(_) => {
                            debug!("Received close frame from {}", url);
                            break;
                        }
                        _ => continue,
                    };

                    if data.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            "Message from {} exceeds max size ({} > {}), dropping",
                            url,
                            data.len(),
                            MAX_MESSAGE_SIZE
                        );
                        continue;
                    }

                    match ExternalResponse::from_json(&data) {
                        Some(response) => {
                            let _ = inner.events.send(ExternalEvent::Message(response));
                        }
                        None => debug!("Ignoring unrecognized frame from {}", url),
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection {} closed", url);
                        }
                        _ => {
                            error!("WebSocket error on {}: {}", url, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", url);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ExternalLink for WebSocketLink {
    async fn open(&self, url: &str) {
        self.stop_task();
        *self.inner.writer.lock().await = None;
        let task = tokio::spawn(Self::connection_loop(Arc::clone(&self.inner), url.to_string()));
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    async fn send(&self, text: String) -> Result<(), LinkError> {
        let mut writer = self.inner.writer.lock().await;
        let write = writer.as_mut().ok_or(LinkError::NotOpen)?;
        write
            .send(Message::text(text))
            .await
            .map_err(|e| LinkError::Send(e.to_string()))
    }

    async fn close(&self) {
        self.stop_task();
        if let Some(mut write) = self.inner.writer.lock().await.take() {
            let _ = write.send(Message::Close(None)).await;
        }
        self.inner.set_status(ConnectionStatus::Closed);
    }

    fn status(&self) -> ConnectionStatus {
        *self.inner.status.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for WebSocketLink {
    fn drop(&mut self) {
        self.stop_task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_backoff_exponential() {
        let config = ReconnectConfig::default();

        // 5s, 10s, 20s, 40s, 60s (capped)
        assert_eq!(calculate_backoff(1, &config), Duration::from_secs(5));
        assert_eq!(calculate_backoff(2, &config), Duration::from_secs(10));
        assert_eq!(calculate_backoff(3, &config), Duration::from_secs(20));
        assert_eq!(calculate_backoff(4, &config), Duration::from_secs(40));
        assert_eq!(calculate_backoff(5, &config), Duration::from_secs(60));
        assert_eq!(calculate_backoff(10, &config), Duration::from_secs(60));
    }

    #[test]
    fn test_calculate_backoff_custom_config() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_factor: 3.0,
            max_attempts: None,
        };

        // 1s, 3s, 9s, 10s (capped)
        assert_eq!(calculate_backoff(1, &config), Duration::from_secs(1));
        assert_eq!(calculate_backoff(2, &config), Duration::from_secs(3));
        assert_eq!(calculate_backoff(3, &config), Duration::from_secs(9));
        assert_eq!(calculate_backoff(4, &config), Duration::from_secs(10));
    }

    #[test]
    fn test_schedule_and_reset() {
        let config = ReconnectConfig::default();
        let mut state = ReconnectState::default();

        assert_eq!(state.schedule(&config), Duration::from_secs(5));
        assert_eq!(state.schedule(&config), Duration::from_secs(10));
        assert_eq!(state.attempts, 2);

        state.reset();
        assert_eq!(state.attempts, 0);
        assert_eq!(state.schedule(&config), Duration::from_secs(5));
    }

    #[test]
    fn test_exceeded_max_attempts() {
        let state = ReconnectState { attempts: 5 };

        assert!(!state.exceeded_max_attempts(&ReconnectConfig::default()));

        let limited = ReconnectConfig {
            max_attempts: Some(5),
            ..Default::default()
        };
        assert!(state.exceeded_max_attempts(&limited));
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let (link, _events) = WebSocketLink::new(ReconnectConfig::default());
        assert!(matches!(
            link.send("{}".to_string()).await,
            Err(LinkError::NotOpen)
        ));
        assert_eq!(link.status(), ConnectionStatus::Uninstantiated);
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_closed() {
        let (link, mut events) = WebSocketLink::new(ReconnectConfig::default());

        // Nothing listens on port 1.
        link.open("ws://127.0.0.1:1/").await;

        assert_eq!(
            events.recv().await,
            Some(ExternalEvent::Status(ConnectionStatus::Connecting))
        );
        assert_eq!(
            events.recv().await,
            Some(ExternalEvent::Status(ConnectionStatus::Closed))
        );
        link.close().await;
    }
}
