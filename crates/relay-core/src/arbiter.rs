//! Role arbitration: who leads, and failover when the leader leaves.
//!
//! Roles are never stored per peer. The leader is always the oldest member
//! of the registry, recomputed on every query. The arbiter is the only
//! component that tells peers their role, and it does so for exactly one
//! leader per election round, so peers cannot disagree about who leads.

use crate::channel::HostChannel;
use crate::prober::Liveness;
use crate::protocol::{Envelope, Message};
use crate::registry::MembershipRegistry;
use crate::PeerId;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Role of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    /// No directive received yet
    #[default]
    Unresolved,
    /// Owns the external connection
    Leader,
    /// Mirrors the leader's state and relays through it
    Follower,
}

impl Role {
    fn directive(self) -> Option<Message> {
        match self {
            Role::Leader => Some(Message::SetRoleLeader),
            Role::Follower => Some(Message::SetRoleFollower),
            Role::Unresolved => None,
        }
    }
}

/// Decides roles for connect/disconnect events and sends role directives.
///
/// Not internally synchronized: the coordinator feeds it one event at a time.
pub struct RoleArbiter {
    registry: MembershipRegistry,
    channel: Arc<dyn HostChannel>,
}

impl RoleArbiter {
    pub fn new(registry: MembershipRegistry, channel: Arc<dyn HostChannel>) -> Self {
        Self { registry, channel }
    }

    pub fn registry(&self) -> &MembershipRegistry {
        &self.registry
    }

    /// Current leader, derived from the registry.
    pub fn leader(&self) -> Option<PeerId> {
        self.registry.oldest()
    }

    /// Role the arbiter currently assigns to `peer_id`.
    pub fn role_of(&self, peer_id: PeerId) -> Role {
        if !self.registry.contains(peer_id) {
            Role::Unresolved
        } else if self.leader() == Some(peer_id) {
            Role::Leader
        } else {
            Role::Follower
        }
    }

    /// Handle a newly connected peer and tell it its role.
    ///
    /// The first peer into an empty registry leads; everyone else follows.
    pub async fn on_connect(&mut self, peer_id: PeerId) -> Role {
        if self.registry.contains(peer_id) {
            let role = self.role_of(peer_id);
            debug!("Peer {} connected again, re-sending {:?}", peer_id, role);
            self.announce(peer_id, role).await;
            return role;
        }

        let role = if self.registry.is_empty() {
            Role::Leader
        } else {
            Role::Follower
        };
        if let Err(e) = self.registry.register(peer_id).await {
            warn!("Failed to persist membership after {} joined: {}", peer_id, e);
        }

        info!("Peer {} joined as {:?}", peer_id, role);
        self.announce(peer_id, role).await;
        role
    }

    /// Handle a departed peer. Returns the new leader when a failover happened.
    ///
    /// When the leader leaves, the oldest remaining member takes over and
    /// every survivor is told its role again, so followers also refresh
    /// their idea of who leads.
    pub async fn on_disconnect(&mut self, peer_id: PeerId) -> Option<PeerId> {
        if !self.registry.contains(peer_id) {
            debug!("Ignoring disconnect of unregistered peer {}", peer_id);
            return None;
        }

        let was_leader = self.leader() == Some(peer_id);
        if let Err(e) = self.registry.unregister(peer_id).await {
            warn!("Failed to persist membership after {} left: {}", peer_id, e);
        }

        if !was_leader {
            info!("Follower {} left", peer_id);
            return None;
        }

        match self.leader() {
            Some(new_leader) => {
                info!("Leader {} left, failing over to {}", peer_id, new_leader);
                self.announce_all().await;
                Some(new_leader)
            }
            None => {
                info!("Leader {} left, no peers remain", peer_id);
                None
            }
        }
    }

    /// Revalidate persisted membership and re-announce roles to survivors.
    pub async fn restore(&mut self, prober: &dyn Liveness, timeout: Duration) -> Vec<PeerId> {
        let survivors = match self.registry.restore(prober, timeout).await {
            Ok(survivors) => survivors,
            Err(e) => {
                warn!("Membership restore failed, continuing with live state: {}", e);
                Vec::new()
            }
        };
        if !self.registry.is_empty() {
            self.announce_all().await;
        }
        survivors
    }

    /// Send every registered peer its current role.
    pub async fn announce_all(&self) {
        for peer_id in self.registry.snapshot() {
            self.announce(peer_id, self.role_of(peer_id)).await;
        }
    }

    async fn announce(&self, peer_id: PeerId, role: Role) {
        let Some(message) = role.directive() else {
            return;
        };
        // A failed send means the peer is going away; its disconnect event follows.
        if let Err(e) = self.channel.send(peer_id, Envelope::to_peer(message)).await {
            warn!("Failed to send {:?} directive to {}: {}", role, peer_id, e);
        }
    }
}
