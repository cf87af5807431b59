//! Relay gateway: the leader's ownership of the external connection.
//!
//! Only an active (leader) gateway keeps its link open. It stamps outgoing
//! requests with a correlation id, tracks them in the [`PendingLedger`] and
//! folds inbound replies and link status changes into an [`ExternalState`]
//! that the peer node broadcasts to followers.

use crate::ledger::PendingLedger;
use crate::protocol::{ConnectionStatus, ExternalRequest, ExternalResponse, ExternalState};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Port the external editor server listens on unless configured otherwise.
pub const DEFAULT_EXTERNAL_PORT: u16 = 35942;

/// Resids are nine decimal digits.
const RESID_RANGE: std::ops::Range<u64> = 100_000_000..1_000_000_000;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("External connection is not open")]
    NotOpen,

    #[error("Send failed: {0}")]
    Send(String),
}

/// Something the external link observed.
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalEvent {
    Status(ConnectionStatus),
    Message(ExternalResponse),
}

/// Connection to the external server.
///
/// Implementations report status transitions and inbound messages as
/// [`ExternalEvent`]s on a channel handed out at construction.
#[async_trait]
pub trait ExternalLink: Send + Sync {
    /// Connect (or reconnect) to `url`, replacing any current connection.
    async fn open(&self, url: &str);

    /// Transmit one text frame.
    async fn send(&self, text: String) -> Result<(), LinkError>;

    /// Close the connection and stop reconnecting.
    async fn close(&self);

    fn status(&self) -> ConnectionStatus;
}

pub struct RelayGateway {
    link: Arc<dyn ExternalLink>,
    host: String,
    port: u16,
    ledger: PendingLedger,
    status: ConnectionStatus,
    last_message: Option<ExternalResponse>,
    active: bool,
}

impl RelayGateway {
    pub fn new(link: Arc<dyn ExternalLink>, host: impl Into<String>, port: u16, ttl: Duration) -> Self {
        Self {
            link,
            host: host.into(),
            port,
            ledger: PendingLedger::new(ttl),
            status: ConnectionStatus::Uninstantiated,
            last_message: None,
            active: false,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}:{}/", self.host, self.port)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Authoritative external state, as broadcast to followers.
    pub fn state(&self) -> ExternalState {
        ExternalState {
            status: self.status,
            pending: self.ledger.resids(),
            last_message: self.last_message.clone(),
        }
    }

    /// Take ownership of the external connection. No-op when already active.
    pub async fn activate(&mut self) {
        if self.active {
            return;
        }
        self.active = true;
        self.status = ConnectionStatus::Connecting;
        info!("Opening external connection to {}", self.url());
        self.link.open(&self.url()).await;
    }

    /// Give up the external connection and forget outstanding requests.
    pub async fn deactivate(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.link.close().await;
        self.ledger.clear();
        self.status = ConnectionStatus::Uninstantiated;
        self.last_message = None;
        info!("Closed external connection");
    }

    /// Point the gateway at a new port, reconnecting when active.
    pub async fn set_port(&mut self, port: u16) {
        if port == self.port {
            return;
        }
        self.port = port;
        if self.active {
            info!("External port changed, reconnecting to {}", self.url());
            self.link.close().await;
            self.status = ConnectionStatus::Connecting;
            self.link.open(&self.url()).await;
        }
    }

    /// Send a request to the external server and return its resid.
    ///
    /// Never fails: an unavailable link shows up in the status, and the
    /// resid stays pending until it is answered or evicted.
    pub async fn send_to_external(&mut self, mut request: ExternalRequest) -> u64 {
        let resid = match request.resid {
            Some(resid) => resid,
            None => self.fresh_resid(),
        };
        request.resid = Some(resid);
        self.ledger.record(resid, Instant::now());

        if let Err(e) = self.link.send(request.to_json()).await {
            warn!("Request {} not delivered to external server: {}", resid, e);
        } else {
            debug!("Sent {:?} request {} to external server", request.command, resid);
        }
        resid
    }

    /// Apply a link event. Returns the new state when followers need it.
    pub fn on_external_event(&mut self, event: ExternalEvent) -> Option<ExternalState> {
        if !self.active {
            debug!("Ignoring external event while inactive: {:?}", event);
            return None;
        }
        match event {
            ExternalEvent::Status(status) => {
                if status == self.status {
                    return None;
                }
                debug!("External status {:?} -> {:?}", self.status, status);
                self.status = status;
            }
            ExternalEvent::Message(response) => {
                if let Some(resid) = response.resid {
                    if self.ledger.resolve(resid) {
                        debug!("Request {} answered", resid);
                    } else {
                        debug!("Response for unknown request {}", resid);
                    }
                }
                self.last_message = Some(response);
            }
        }
        Some(self.state())
    }

    /// Forget requests that have waited longer than the TTL.
    ///
    /// Returns whether anything was evicted.
    pub fn evict_stale(&mut self, now: Instant) -> bool {
        let evicted = self.ledger.evict_stale(now);
        if evicted > 0 {
            info!("Evicted {} unanswered request(s)", evicted);
        }
        evicted > 0
    }

    fn fresh_resid(&self) -> u64 {
        let mut rng = rand::rng();
        loop {
            let resid = rng.random_range(RESID_RANGE);
            if !self.ledger.contains(resid) {
                return resid;
            }
        }
    }
}

/// In-memory [`ExternalLink`] for tests: records what was sent and lets the
/// test inject events.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    pub struct FakeLink {
        pub sent: Mutex<Vec<String>>,
        pub opened: Mutex<Vec<String>>,
        pub closes: Mutex<usize>,
        status: Mutex<ConnectionStatus>,
        events: mpsc::UnboundedSender<ExternalEvent>,
    }

    impl FakeLink {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ExternalEvent>) {
            let (events, rx) = mpsc::unbounded_channel();
            let link = Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                opened: Mutex::new(Vec::new()),
                closes: Mutex::new(0),
                status: Mutex::new(ConnectionStatus::Uninstantiated),
                events,
            });
            (link, rx)
        }

        /// Simulate the external server answering.
        pub fn reply(&self, response: ExternalResponse) {
            let _ = self.events.send(ExternalEvent::Message(response));
        }

        pub fn sent_requests(&self) -> Vec<ExternalRequest> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|text| serde_json::from_str(text).unwrap())
                .collect()
        }

        fn set_status(&self, status: ConnectionStatus) {
            *self.status.lock().unwrap() = status;
            let _ = self.events.send(ExternalEvent::Status(status));
        }
    }

    #[async_trait]
    impl ExternalLink for FakeLink {
        async fn open(&self, url: &str) {
            self.opened.lock().unwrap().push(url.to_string());
            self.set_status(ConnectionStatus::Open);
        }

        async fn send(&self, text: String) -> Result<(), LinkError> {
            if !self.status().is_open() {
                return Err(LinkError::NotOpen);
            }
            self.sent.lock().unwrap().push(text);
            Ok(())
        }

        async fn close(&self) {
            *self.closes.lock().unwrap() += 1;
            self.set_status(ConnectionStatus::Closed);
        }

        fn status(&self) -> ConnectionStatus {
            *self.status.lock().unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeLink;
    use super::*;
    use crate::protocol::ResponseKind;
    use serde_json::json;

    fn gateway(link: Arc<FakeLink>) -> RelayGateway {
        RelayGateway::new(link, "localhost", DEFAULT_EXTERNAL_PORT, Duration::from_secs(30))
    }

    fn item(resid: u64) -> ExternalResponse {
        ExternalResponse {
            kind: ResponseKind::Item,
            data: json!({"title": "x"}),
            resid: Some(resid),
        }
    }

    #[tokio::test]
    async fn test_activate_opens_default_url() {
        let (link, _events) = FakeLink::new();
        let mut gateway = gateway(link.clone());

        gateway.activate().await;
        gateway.activate().await;

        assert_eq!(*link.opened.lock().unwrap(), vec!["ws://localhost:35942/"]);
        assert!(gateway.is_active());
    }

    #[tokio::test]
    async fn test_send_assigns_nine_digit_resid() {
        let (link, _events) = FakeLink::new();
        let mut gateway = gateway(link.clone());
        gateway.activate().await;

        let resid = gateway
            .send_to_external(ExternalRequest::update_match_query("foo"))
            .await;

        assert!(RESID_RANGE.contains(&resid));
        assert_eq!(gateway.state().pending, vec![resid]);
        let sent = link.sent_requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].resid, Some(resid));
        assert_eq!(sent[0].data, "foo");
    }

    #[tokio::test]
    async fn test_send_keeps_caller_resid() {
        let (link, _events) = FakeLink::new();
        let mut gateway = gateway(link);
        gateway.activate().await;

        let mut request = ExternalRequest::get_item("bar");
        request.resid = Some(123_456_789);
        assert_eq!(gateway.send_to_external(request).await, 123_456_789);
    }

    #[tokio::test]
    async fn test_send_on_closed_link_is_not_an_error() {
        let (link, _events) = FakeLink::new();
        let mut gateway = gateway(link.clone());

        let resid = gateway
            .send_to_external(ExternalRequest::get_item("q"))
            .await;

        assert!(link.sent.lock().unwrap().is_empty());
        assert_eq!(gateway.state().pending, vec![resid]);
    }

    #[tokio::test]
    async fn test_matching_reply_clears_exactly_that_resid() {
        let (link, _events) = FakeLink::new();
        let mut gateway = gateway(link);
        gateway.activate().await;
        let first = gateway.send_to_external(ExternalRequest::get_item("a")).await;
        let second = gateway.send_to_external(ExternalRequest::get_item("b")).await;

        let state = gateway
            .on_external_event(ExternalEvent::Message(item(first)))
            .unwrap();

        assert_eq!(state.pending, vec![second]);
        assert_eq!(state.last_message, Some(item(first)));
    }

    #[tokio::test]
    async fn test_unmatched_reply_still_updates_last_message() {
        let (link, _events) = FakeLink::new();
        let mut gateway = gateway(link);
        gateway.activate().await;
        let pending = gateway.send_to_external(ExternalRequest::get_item("a")).await;

        let state = gateway
            .on_external_event(ExternalEvent::Message(item(1)))
            .unwrap();
        assert_eq!(state.pending, vec![pending]);
        assert!(state.last_message.is_some());
    }

    #[tokio::test]
    async fn test_status_changes_are_reported_once() {
        let (link, _events) = FakeLink::new();
        let mut gateway = gateway(link);
        gateway.activate().await;

        let state = gateway
            .on_external_event(ExternalEvent::Status(ConnectionStatus::Open))
            .unwrap();
        assert_eq!(state.status, ConnectionStatus::Open);
        assert!(gateway
            .on_external_event(ExternalEvent::Status(ConnectionStatus::Open))
            .is_none());
    }

    #[tokio::test]
    async fn test_inactive_gateway_ignores_events() {
        let (link, _events) = FakeLink::new();
        let mut gateway = gateway(link);
        assert!(gateway
            .on_external_event(ExternalEvent::Status(ConnectionStatus::Open))
            .is_none());
    }

    #[tokio::test]
    async fn test_deactivate_closes_and_clears_ledger() {
        let (link, _events) = FakeLink::new();
        let mut gateway = gateway(link.clone());
        gateway.activate().await;
        gateway.send_to_external(ExternalRequest::get_item("a")).await;

        gateway.deactivate().await;

        assert_eq!(*link.closes.lock().unwrap(), 1);
        assert!(gateway.state().pending.is_empty());
        assert_eq!(gateway.state().status, ConnectionStatus::Uninstantiated);
    }

    #[tokio::test]
    async fn test_port_change_reconnects_when_active() {
        let (link, _events) = FakeLink::new();
        let mut gateway = gateway(link.clone());

        gateway.set_port(4000).await;
        assert!(link.opened.lock().unwrap().is_empty());

        gateway.activate().await;
        gateway.set_port(4001).await;
        assert_eq!(
            *link.opened.lock().unwrap(),
            vec!["ws://localhost:4000/", "ws://localhost:4001/"]
        );
        assert_eq!(*link.closes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_evict_stale_drops_old_requests() {
        let (link, _events) = FakeLink::new();
        let mut gateway = RelayGateway::new(link, "localhost", 1, Duration::from_millis(10));
        gateway.send_to_external(ExternalRequest::get_item("a")).await;

        assert!(!gateway.evict_stale(Instant::now()));
        assert!(gateway.evict_stale(Instant::now() + Duration::from_secs(1)));
        assert!(gateway.state().pending.is_empty());
    }
}
