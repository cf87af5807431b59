//! Peer node: per-peer message dispatch and role-dependent behavior.
//!
//! A peer is driven by three inputs, consumed by one task:
//! - envelopes from the coordinator (role directives, relayed messages)
//! - events from its external link (only meaningful while it leads)
//! - commands from the local UI ([`PeerHandle`])
//!
//! A leader answers requests itself through its [`RelayGateway`] and pushes
//! every change of the external state to the followers. A follower forwards
//! requests to whoever currently leads and mirrors the state it is sent.

use crate::arbiter::Role;
use crate::channel::PeerOutbox;
use crate::config::RelayConfig;
use crate::events::{EventBus, RelayEvent};
use crate::gateway::{ExternalEvent, ExternalLink, RelayGateway};
use crate::ledger::DEFAULT_LEDGER_TTL;
use crate::protocol::{
    Address, ConnectionStatus, Direction, Envelope, ExternalRequest, ExternalResponse,
    ExternalState, Message,
};
use crate::store::KeyValueStore;
use crate::PeerId;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Peer runtime settings.
#[derive(Debug, Clone)]
pub struct PeerSettings {
    /// Host of the external server; the port comes from [`RelayConfig`].
    pub external_host: String,
    /// Age after which an unanswered external request is dropped.
    pub ledger_ttl: Duration,
    /// How often the leader checks for stale requests.
    pub tick_interval: Duration,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            external_host: "localhost".to_string(),
            ledger_ttl: DEFAULT_LEDGER_TTL,
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// What a peer knows, as a UI would render it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerState {
    pub peer_id: PeerId,
    pub role: Role,
    pub leader: Option<PeerId>,
    pub status: ConnectionStatus,
    pub pending: Vec<u64>,
    pub last_message: Option<ExternalResponse>,
    pub port: u16,
    pub query: String,
}

/// Local operations a UI can ask of its peer.
enum PeerCommand {
    UpdateMatchQuery(String),
    GetItem(String),
    SetPort(u16),
    State {
        respond_to: oneshot::Sender<PeerState>,
    },
}

pub struct PeerNode {
    state: PeerState,
    outbox: Arc<dyn PeerOutbox>,
    gateway: RelayGateway,
    store: Arc<dyn KeyValueStore>,
    events: Arc<EventBus>,
    settings: PeerSettings,
}

impl PeerNode {
    pub fn new(
        peer_id: PeerId,
        outbox: Arc<dyn PeerOutbox>,
        link: Arc<dyn ExternalLink>,
        store: Arc<dyn KeyValueStore>,
        config: RelayConfig,
        settings: PeerSettings,
    ) -> Self {
        let gateway = RelayGateway::new(
            link,
            settings.external_host.clone(),
            config.port,
            settings.ledger_ttl,
        );
        Self {
            state: PeerState {
                peer_id,
                role: Role::Unresolved,
                leader: None,
                status: ConnectionStatus::Uninstantiated,
                pending: Vec::new(),
                last_message: None,
                port: config.port,
                query: config.query,
            },
            outbox,
            gateway,
            store,
            events: Arc::new(EventBus::new()),
            settings,
        }
    }

    pub fn state(&self) -> &PeerState {
        &self.state
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    /// Run the node on its own task.
    pub fn spawn(
        self,
        inbox: mpsc::UnboundedReceiver<Envelope>,
        external: mpsc::UnboundedReceiver<ExternalEvent>,
    ) -> PeerHandle {
        let (commands_tx, commands) = mpsc::channel(32);
        let events = self.events();
        tokio::spawn(self.run(inbox, external, commands));
        PeerHandle {
            commands: commands_tx,
            events,
        }
    }

    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<Envelope>,
        mut external: mpsc::UnboundedReceiver<ExternalEvent>,
        mut commands: mpsc::Receiver<PeerCommand>,
    ) {
        let mut tick = tokio::time::interval(self.settings.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                envelope = inbox.recv() => match envelope {
                    Some(envelope) => self.handle_envelope(envelope).await,
                    None => {
                        info!("Peer {}: coordinator channel closed", self.state.peer_id);
                        break;
                    }
                },
                Some(event) = external.recv() => self.on_external_event(event).await,
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        debug!("Peer {}: all handles dropped", self.state.peer_id);
                        break;
                    }
                },
                _ = tick.tick() => self.on_tick(Instant::now()).await,
            }
        }

        self.gateway.deactivate().await;
    }

    async fn on_command(&mut self, command: PeerCommand) {
        match command {
            PeerCommand::UpdateMatchQuery(query) => self.update_match_query(query).await,
            PeerCommand::GetItem(query) => self.get_item(query).await,
            PeerCommand::SetPort(port) => self.set_port(port).await,
            PeerCommand::State { respond_to } => {
                let _ = respond_to.send(self.state.clone());
            }
        }
    }

    /// Dispatch one envelope from the coordinator.
    pub async fn handle_envelope(&mut self, envelope: Envelope) {
        if envelope.direction != Direction::ToPeer {
            debug!(
                "Peer {}: dropping {} meant for the coordinator",
                self.state.peer_id,
                envelope.message_type()
            );
            return;
        }

        match &envelope.message {
            Message::ConfirmRoleIsLeader => {
                let is_leader = self.state.role == Role::Leader;
                self.respond(&envelope, Message::RoleIsLeader(is_leader)).await;
            }
            Message::SetRoleLeader => self.become_leader().await,
            Message::SetRoleFollower => self.become_follower().await,
            Message::ConfirmAlive => self.respond(&envelope, Message::Alive).await,
            Message::PassToExternal(None) => {
                warn!(
                    "Peer {}: pass-to-external without a request, not forwarding",
                    self.state.peer_id
                );
            }
            Message::PassToExternal(Some(request)) => self.pass_to_external(request.clone()).await,
            Message::QueryExternalState => self.on_query_external_state(&envelope).await,
            Message::SetExternalState(state) => self.on_external_state(state.clone()),
            Message::SetExternalPort(port) => self.on_external_port(*port, envelope.from).await,
            Message::LeaderIs(leader) => {
                self.state.leader = *leader;
            }
            Message::QueryLeader | Message::RoleIsLeader(_) | Message::Alive => {
                debug!(
                    "Peer {}: ignoring unsolicited {}",
                    self.state.peer_id,
                    envelope.message_type()
                );
            }
        }
    }

    /// Ask the external server to change the match query.
    pub async fn update_match_query(&mut self, query: String) {
        self.state.query = query.clone();
        self.persist_config().await;
        self.pass_to_external(ExternalRequest::update_match_query(query))
            .await;
    }

    /// Ask the external server for one item.
    pub async fn get_item(&mut self, query: String) {
        self.pass_to_external(ExternalRequest::get_item(query)).await;
    }

    /// Change the external port. Followers ask the leader, which decides.
    pub async fn set_port(&mut self, port: u16) {
        if self.state.role == Role::Leader {
            self.adopt_port(port).await;
        } else {
            self.send(Envelope::to_peer(Message::SetExternalPort(port)).addressed(Address::Leader))
                .await;
        }
    }

    /// Periodic housekeeping: the leader forgets stale requests.
    pub async fn on_tick(&mut self, now: Instant) {
        if self.state.role == Role::Leader && self.gateway.evict_stale(now) {
            self.publish_gateway_state().await;
        }
    }

    pub async fn on_external_event(&mut self, event: ExternalEvent) {
        if self.gateway.on_external_event(event).is_some() {
            self.publish_gateway_state().await;
        }
    }

    async fn become_leader(&mut self) {
        if self.state.role == Role::Leader {
            debug!("Peer {}: already leading", self.state.peer_id);
            return;
        }
        self.set_role(Role::Leader);
        self.state.leader = Some(self.state.peer_id);
        self.gateway.activate().await;
        self.publish_gateway_state().await;
    }

    async fn become_follower(&mut self) {
        if self.state.role == Role::Leader {
            self.gateway.deactivate().await;
        }
        self.set_role(Role::Follower);

        // Pull rather than wait: broadcasts sent before this peer followed were missed.
        self.send(Envelope::to_background(Message::QueryLeader)).await;
        self.send(Envelope::to_peer(Message::QueryExternalState).addressed(Address::Leader))
            .await;
    }

    fn set_role(&mut self, role: Role) {
        if self.state.role != role {
            info!("Peer {}: {:?} -> {:?}", self.state.peer_id, self.state.role, role);
            self.state.role = role;
            self.events.emit(RelayEvent::RoleChanged { role });
        }
    }

    async fn pass_to_external(&mut self, request: ExternalRequest) {
        if self.state.role == Role::Leader {
            self.gateway.send_to_external(request).await;
            self.publish_gateway_state().await;
        } else {
            self.send(
                Envelope::to_peer(Message::PassToExternal(Some(request))).addressed(Address::Leader),
            )
            .await;
        }
    }

    async fn on_query_external_state(&self, envelope: &Envelope) {
        if self.state.role != Role::Leader {
            debug!(
                "Peer {}: not leading, ignoring state query",
                self.state.peer_id
            );
            return;
        }
        let Some(requester) = envelope.from else {
            debug!("Peer {}: state query without a sender", self.state.peer_id);
            return;
        };
        let reply = Envelope::to_peer(Message::SetExternalState(self.gateway.state()))
            .addressed(Address::Peer(requester));
        self.send(reply).await;
    }

    /// Overwrite the mirrored state. Applying the same state twice changes nothing.
    fn on_external_state(&mut self, state: ExternalState) {
        if self.state.role == Role::Leader {
            debug!(
                "Peer {}: leader ignores mirrored external state",
                self.state.peer_id
            );
            return;
        }
        self.apply_state(state);
    }

    async fn on_external_port(&mut self, port: u16, from: Option<PeerId>) {
        match self.state.role {
            Role::Leader if from.is_some() && from != Some(self.state.peer_id) => {
                self.adopt_port(port).await;
            }
            Role::Leader => {
                debug!("Peer {}: ignoring own port broadcast", self.state.peer_id);
            }
            Role::Follower => self.update_port(port).await,
            Role::Unresolved => {
                debug!(
                    "Peer {}: no role yet, ignoring port {}",
                    self.state.peer_id, port
                );
            }
        }
    }

    /// Leader only: switch the external connection and tell followers.
    async fn adopt_port(&mut self, port: u16) {
        self.gateway.set_port(port).await;
        self.update_port(port).await;
        self.send(Envelope::to_peer(Message::SetExternalPort(port)).addressed(Address::Followers))
            .await;
    }

    async fn update_port(&mut self, port: u16) {
        if self.state.port == port {
            return;
        }
        self.state.port = port;
        self.persist_config().await;
        self.events.emit(RelayEvent::PortChanged { port });
    }

    /// Leader only: mirror the gateway locally and push it to followers.
    async fn publish_gateway_state(&mut self) {
        let state = self.gateway.state();
        self.apply_state(state.clone());
        self.send(Envelope::to_peer(Message::SetExternalState(state)).addressed(Address::Followers))
            .await;
    }

    fn apply_state(&mut self, state: ExternalState) {
        if self.state.status != state.status {
            self.state.status = state.status;
            self.events.emit(RelayEvent::StatusChanged {
                status: state.status,
            });
        }
        if self.state.pending != state.pending {
            self.state.pending = state.pending;
            self.events.emit(RelayEvent::PendingChanged {
                pending: self.state.pending.clone(),
            });
        }
        if self.state.last_message != state.last_message {
            self.state.last_message = state.last_message;
            if let Some(message) = &self.state.last_message {
                self.events.emit(RelayEvent::MessageReceived {
                    message: message.clone(),
                });
            }
        }
    }

    /// Answer a request, either to the coordinator or to the peer that asked.
    async fn respond(&self, request: &Envelope, message: Message) {
        let reply = match request.from {
            Some(requester) => {
                let mut reply = Envelope::to_peer(message).addressed(Address::Peer(requester));
                reply.resid = request.resid;
                reply
            }
            None => request.reply(message),
        };
        self.send(reply).await;
    }

    async fn send(&self, envelope: Envelope) {
        let kind = envelope.message_type();
        if let Err(e) = self.outbox.send(envelope).await {
            warn!("Peer {}: failed to send {}: {}", self.state.peer_id, kind, e);
        }
    }

    async fn persist_config(&self) {
        let config = RelayConfig {
            port: self.state.port,
            query: self.state.query.clone(),
        };
        if let Err(e) = config.save(self.store.as_ref()).await {
            warn!("Peer {}: failed to persist config: {}", self.state.peer_id, e);
        }
    }
}

/// Handle to a running [`PeerNode`]. Dropping every handle stops the node.
#[derive(Clone)]
pub struct PeerHandle {
    commands: mpsc::Sender<PeerCommand>,
    events: Arc<EventBus>,
}

impl PeerHandle {
    pub async fn update_match_query(&self, query: impl Into<String>) {
        self.command(PeerCommand::UpdateMatchQuery(query.into())).await;
    }

    pub async fn get_item(&self, query: impl Into<String>) {
        self.command(PeerCommand::GetItem(query.into())).await;
    }

    pub async fn set_port(&self, port: u16) {
        self.command(PeerCommand::SetPort(port)).await;
    }

    /// Current state, or `None` once the node has stopped.
    pub async fn state(&self) -> Option<PeerState> {
        let (respond_to, rx) = oneshot::channel();
        self.command(PeerCommand::State { respond_to }).await;
        rx.await.ok()
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    /// Resolves once the node's task has exited.
    pub async fn stopped(&self) {
        self.commands.closed().await
    }

    async fn command(&self, command: PeerCommand) {
        if self.commands.send(command).await.is_err() {
            debug!("Peer node has stopped, dropping command");
        }
    }
}
