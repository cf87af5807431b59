//! The coordinator: single process-wide authority over membership and roles.
//!
//! Runs as one task that drains a single queue of channel events and handle
//! commands, strictly one at a time, so election rounds never overlap.
//! Only one coordinator may be live per process; a second [`Coordinator::init`]
//! fails fast instead of producing a second, disagreeing authority.

use crate::arbiter::RoleArbiter;
use crate::channel::{ChannelEvent, HostChannel};
use crate::prober::LivenessProber;
use crate::protocol::{Address, Direction, Envelope, Message};
use crate::registry::MembershipRegistry;
use crate::store::KeyValueStore;
use crate::PeerId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

static RUNNING: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("A coordinator is already running in this process")]
    AlreadyRunning,

    #[error("Coordinator has stopped")]
    Stopped,
}

/// Coordinator runtime settings.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// How long a restore probe waits for `alive`.
    pub probe_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(1),
        }
    }
}

/// Held by the running actor; releases the process-wide slot on drop.
struct SingletonGuard;

impl SingletonGuard {
    fn acquire() -> Result<Self, CoordinatorError> {
        RUNNING
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| SingletonGuard)
            .map_err(|_| CoordinatorError::AlreadyRunning)
    }
}

impl Drop for SingletonGuard {
    fn drop(&mut self) {
        RUNNING.store(false, Ordering::Release);
    }
}

enum Command {
    Leader {
        respond_to: oneshot::Sender<Option<PeerId>>,
    },
    Snapshot {
        respond_to: oneshot::Sender<Vec<PeerId>>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

pub struct Coordinator;

impl Coordinator {
    /// Start the coordinator on top of a host channel and its event stream.
    ///
    /// Persisted membership is revalidated before any event is consumed;
    /// events that arrive meanwhile wait in the queue.
    pub async fn init(
        channel: Arc<dyn HostChannel>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        store: Arc<dyn KeyValueStore>,
        settings: CoordinatorSettings,
    ) -> Result<CoordinatorHandle, CoordinatorError> {
        let guard = SingletonGuard::acquire()?;

        let registry = MembershipRegistry::new(store);
        let mut arbiter = RoleArbiter::new(registry, Arc::clone(&channel));

        let prober = LivenessProber::new(Arc::clone(&channel));
        let survivors = arbiter.restore(&prober, settings.probe_timeout).await;
        info!(
            "Coordinator started, {} peer(s) restored, leader: {:?}",
            survivors.len(),
            arbiter.leader()
        );

        let (commands_tx, commands) = mpsc::channel(16);
        let actor = CoordinatorActor {
            arbiter,
            channel,
            events,
            commands,
            guard: Some(guard),
        };
        tokio::spawn(actor.run());

        Ok(CoordinatorHandle {
            commands: commands_tx,
        })
    }
}

/// Handle to the running coordinator. Dropping every handle stops it.
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    pub async fn leader(&self) -> Result<Option<PeerId>, CoordinatorError> {
        let (respond_to, rx) = oneshot::channel();
        self.call(Command::Leader { respond_to }, rx).await
    }

    /// Registered peers, oldest first.
    pub async fn snapshot(&self) -> Result<Vec<PeerId>, CoordinatorError> {
        let (respond_to, rx) = oneshot::channel();
        self.call(Command::Snapshot { respond_to }, rx).await
    }

    /// Stop the actor and release the singleton slot.
    ///
    /// Once this returns, a new coordinator may be initialized.
    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        let (respond_to, rx) = oneshot::channel();
        self.call(Command::Shutdown { respond_to }, rx).await
    }

    async fn call<T>(
        &self,
        command: Command,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, CoordinatorError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CoordinatorError::Stopped)?;
        rx.await.map_err(|_| CoordinatorError::Stopped)
    }
}

struct CoordinatorActor {
    arbiter: RoleArbiter,
    channel: Arc<dyn HostChannel>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    commands: mpsc::Receiver<Command>,
    guard: Option<SingletonGuard>,
}

impl CoordinatorActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Leader { respond_to }) => {
                        let _ = respond_to.send(self.arbiter.leader());
                    }
                    Some(Command::Snapshot { respond_to }) => {
                        let _ = respond_to.send(self.arbiter.registry().snapshot());
                    }
                    Some(Command::Shutdown { respond_to }) => {
                        info!("Coordinator shutting down");
                        // Release before answering so an immediate re-init succeeds.
                        drop(self.guard.take());
                        let _ = respond_to.send(());
                        break;
                    }
                    None => {
                        info!("All coordinator handles dropped, stopping");
                        break;
                    }
                },
                event = self.events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => {
                        info!("Host channel closed, coordinator stopping");
                        break;
                    }
                },
            }
        }
    }

    async fn on_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::PeerConnected { peer_id } => {
                self.arbiter.on_connect(peer_id).await;
            }
            ChannelEvent::PeerDisconnected { peer_id } => {
                self.arbiter.on_disconnect(peer_id).await;
            }
            ChannelEvent::Message { peer_id, envelope } => match envelope.direction {
                Direction::ToBackground => self.on_background_message(peer_id, envelope).await,
                Direction::ToPeer => self.relay(peer_id, envelope).await,
            },
        }
    }

    /// Messages addressed to the coordinator itself.
    async fn on_background_message(&self, peer_id: PeerId, envelope: Envelope) {
        let answer = match &envelope.message {
            Message::QueryLeader => Message::LeaderIs(self.arbiter.leader()),
            Message::ConfirmAlive => Message::Alive,
            Message::ConfirmRoleIsLeader => {
                Message::RoleIsLeader(self.arbiter.leader() == Some(peer_id))
            }
            other => {
                debug!(
                    "Dropping {} from {}: not handled by the coordinator",
                    other.message_type(),
                    peer_id
                );
                return;
            }
        };
        if let Err(e) = self.channel.send(peer_id, envelope.reply(answer)).await {
            warn!("Failed to answer {}: {}", peer_id, e);
        }
    }

    /// Deliver a peer-originated `to-peer` message to its resolved targets.
    async fn relay(&self, sender: PeerId, envelope: Envelope) {
        let Some(address) = envelope.to else {
            debug!(
                "Dropping unaddressed {} from {}",
                envelope.message_type(),
                sender
            );
            return;
        };

        let targets = self.resolve(address, sender);
        if targets.is_empty() {
            warn!(
                "No target for {} from {} addressed to {:?}",
                envelope.message_type(),
                sender,
                address
            );
            return;
        }

        let outgoing = Envelope {
            from: Some(sender),
            to: None,
            ..envelope
        };
        for target in targets {
            debug!(
                "Relaying {} from {} to {}",
                outgoing.message_type(),
                sender,
                target
            );
            if let Err(e) = self.channel.send(target, outgoing.clone()).await {
                warn!("Failed to relay to {}: {}", target, e);
            }
        }
    }

    fn resolve(&self, address: Address, sender: PeerId) -> Vec<PeerId> {
        let registry = self.arbiter.registry();
        match address {
            Address::Leader => self.arbiter.leader().into_iter().collect(),
            Address::Peer(peer_id) if registry.contains(peer_id) => vec![peer_id],
            Address::Peer(_) => Vec::new(),
            Address::Followers => {
                let leader = self.arbiter.leader();
                registry
                    .snapshot()
                    .into_iter()
                    .filter(|id| Some(*id) != leader && *id != sender)
                    .collect()
            }
        }
    }
}

/// Serializes tests that start a coordinator; the singleton slot is process-wide.
#[cfg(test)]
pub(crate) fn serial_guard() -> std::sync::MutexGuard<'static, ()> {
    static SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::PeerOutbox;
    use crate::hub::{Hub, PeerLink};
    use crate::registry::MEMBERSHIP_KEY;
    use crate::store::MemoryStore;
    use serde_json::json;

    const WAIT: Duration = Duration::from_secs(2);

    async fn next(link: &mut PeerLink) -> Envelope {
        tokio::time::timeout(WAIT, link.inbox.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("inbox closed")
    }

    async fn start(store: Arc<MemoryStore>) -> (Hub, CoordinatorHandle) {
        let (hub, events) = Hub::new();
        let handle = Coordinator::init(
            Arc::new(hub.clone()),
            events,
            store,
            CoordinatorSettings {
                probe_timeout: Duration::from_millis(200),
            },
        )
        .await
        .unwrap();
        (hub, handle)
    }

    #[tokio::test]
    async fn test_second_init_fails_fast() {
        let _serial = serial_guard();
        let (_hub, handle) = start(Arc::new(MemoryStore::new())).await;

        let (other_hub, other_events) = Hub::new();
        let second = Coordinator::init(
            Arc::new(other_hub),
            other_events,
            Arc::new(MemoryStore::new()),
            CoordinatorSettings::default(),
        )
        .await;
        assert!(matches!(second, Err(CoordinatorError::AlreadyRunning)));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_allows_restart() {
        let _serial = serial_guard();
        let (_hub, handle) = start(Arc::new(MemoryStore::new())).await;
        handle.shutdown().await.unwrap();
        assert!(matches!(handle.leader().await, Err(CoordinatorError::Stopped)));

        let (_hub, handle) = start(Arc::new(MemoryStore::new())).await;
        assert_eq!(handle.leader().await.unwrap(), None);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_roles_assigned_and_failover() {
        let _serial = serial_guard();
        let store = Arc::new(MemoryStore::new());
        let (hub, handle) = start(store.clone()).await;

        let mut a = hub.attach();
        assert_eq!(next(&mut a).await.message, Message::SetRoleLeader);
        let mut b = hub.attach();
        assert_eq!(next(&mut b).await.message, Message::SetRoleFollower);
        let mut c = hub.attach();
        assert_eq!(next(&mut c).await.message, Message::SetRoleFollower);

        assert_eq!(handle.leader().await.unwrap(), Some(a.peer_id));
        assert_eq!(
            store.value(MEMBERSHIP_KEY),
            Some(json!([a.peer_id, b.peer_id, c.peer_id]))
        );

        drop(a);
        assert_eq!(next(&mut b).await.message, Message::SetRoleLeader);
        assert_eq!(next(&mut c).await.message, Message::SetRoleFollower);
        assert_eq!(handle.leader().await.unwrap(), Some(b.peer_id));
        assert_eq!(
            handle.snapshot().await.unwrap(),
            vec![b.peer_id, c.peer_id]
        );

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_restore_keeps_only_responsive_peers() {
        let _serial = serial_guard();
        let store = Arc::new(MemoryStore::new().with_value(MEMBERSHIP_KEY, json!([1, 2, 3])));
        let (hub, events) = Hub::new();

        // Peer 2 outlived the previous coordinator and answers probes;
        // peer 3 is addressable but silent; peer 1 is gone.
        let mut two = hub.attach_silently(PeerId::new(2));
        let _three = hub.attach_silently(PeerId::new(3));
        let responder = tokio::spawn(async move {
            while let Some(envelope) = two.inbox.recv().await {
                match envelope.message {
                    Message::ConfirmAlive => {
                        let _ = two.outbox.send(envelope.reply(Message::Alive)).await;
                    }
                    other => return (Some(other), two),
                }
            }
            (None, two)
        });

        let handle = Coordinator::init(
            Arc::new(hub.clone()),
            events,
            store.clone(),
            CoordinatorSettings {
                probe_timeout: Duration::from_millis(200),
            },
        )
        .await
        .unwrap();

        let (directive, _two) = responder.await.unwrap();
        assert_eq!(directive, Some(Message::SetRoleLeader));
        assert_eq!(handle.snapshot().await.unwrap(), vec![PeerId::new(2)]);
        assert_eq!(store.value(MEMBERSHIP_KEY), Some(json!([2])));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_background_queries_are_answered() {
        let _serial = serial_guard();
        let (hub, handle) = start(Arc::new(MemoryStore::new())).await;

        let mut a = hub.attach();
        next(&mut a).await;
        let mut b = hub.attach();
        next(&mut b).await;

        b.outbox
            .send(Envelope::to_background(Message::QueryLeader).with_resid(5))
            .await
            .unwrap();
        let reply = next(&mut b).await;
        assert_eq!(reply.message, Message::LeaderIs(Some(a.peer_id)));
        assert_eq!(reply.resid, Some(5));
        assert_eq!(reply.direction, Direction::ToPeer);

        b.outbox
            .send(Envelope::to_background(Message::ConfirmRoleIsLeader))
            .await
            .unwrap();
        assert_eq!(next(&mut b).await.message, Message::RoleIsLeader(false));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_addressed_messages_are_relayed() {
        let _serial = serial_guard();
        let (hub, handle) = start(Arc::new(MemoryStore::new())).await;

        let mut a = hub.attach();
        next(&mut a).await;
        let mut b = hub.attach();
        next(&mut b).await;
        let mut c = hub.attach();
        next(&mut c).await;

        // Follower to leader: stamped with the sender.
        c.outbox
            .send(Envelope::to_peer(Message::QueryExternalState).addressed(Address::Leader))
            .await
            .unwrap();
        let relayed = next(&mut a).await;
        assert_eq!(relayed.message, Message::QueryExternalState);
        assert_eq!(relayed.from, Some(c.peer_id));
        assert_eq!(relayed.to, None);

        // Leader to followers: everyone but the leader.
        a.outbox
            .send(Envelope::to_peer(Message::SetExternalPort(4000)).addressed(Address::Followers))
            .await
            .unwrap();
        assert_eq!(next(&mut b).await.message, Message::SetExternalPort(4000));
        assert_eq!(next(&mut c).await.message, Message::SetExternalPort(4000));

        // Direct reply to one peer.
        a.outbox
            .send(Envelope::to_peer(Message::SetExternalPort(4001)).addressed(Address::Peer(b.peer_id)))
            .await
            .unwrap();
        assert_eq!(next(&mut b).await.message, Message::SetExternalPort(4001));
        assert!(c.inbox.try_recv().is_err());

        handle.shutdown().await.unwrap();
    }
}
