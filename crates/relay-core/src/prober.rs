//! Liveness probing for peers remembered from a previous coordinator run.
//!
//! Steady-state membership relies on disconnect notifications from the
//! channel. Probing is only needed when the coordinator restarts and has to
//! decide which persisted ids still belong to reachable peers.

use crate::channel::HostChannel;
use crate::protocol::{Envelope, Message};
use crate::PeerId;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Answers "is this peer still there?".
#[async_trait]
pub trait Liveness: Send + Sync {
    /// Resolve to `false` on timeout rather than waiting indefinitely.
    async fn is_alive(&self, peer_id: PeerId, timeout: Duration) -> bool;
}

/// Probes peers with a directed `confirm-alive` request over the host channel.
pub struct LivenessProber {
    channel: Arc<dyn HostChannel>,
}

impl LivenessProber {
    pub fn new(channel: Arc<dyn HostChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl Liveness for LivenessProber {
    async fn is_alive(&self, peer_id: PeerId, timeout: Duration) -> bool {
        if !self.channel.is_addressable(peer_id) {
            debug!("Probe: peer {} is not addressable", peer_id);
            return false;
        }

        let request = Envelope::to_peer(Message::ConfirmAlive);
        match tokio::time::timeout(timeout, self.channel.request(peer_id, request)).await {
            Ok(Ok(reply)) => {
                let alive = reply.message == Message::Alive;
                if !alive {
                    debug!(
                        "Probe: peer {} answered with {} instead of alive",
                        peer_id,
                        reply.message_type()
                    );
                }
                alive
            }
            Ok(Err(e)) => {
                debug!("Probe: request to peer {} failed: {}", peer_id, e);
                false
            }
            Err(_) => {
                debug!("Probe: peer {} did not answer within {:?}", peer_id, timeout);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::PeerOutbox;
    use crate::hub::Hub;

    const TIMEOUT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn test_responsive_peer_is_alive() {
        let (hub, _events) = Hub::new();
        let mut link = hub.attach_silently(PeerId::new(2));
        tokio::spawn(async move {
            while let Some(request) = link.inbox.recv().await {
                let _ = link.outbox.send(request.reply(Message::Alive)).await;
            }
        });

        let prober = LivenessProber::new(Arc::new(hub));
        assert!(prober.is_alive(PeerId::new(2), TIMEOUT).await);
    }

    #[tokio::test]
    async fn test_unknown_peer_is_not_alive() {
        let (hub, _events) = Hub::new();
        let prober = LivenessProber::new(Arc::new(hub));
        assert!(!prober.is_alive(PeerId::new(9), TIMEOUT).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let (hub, _events) = Hub::new();
        // Addressable but never answers.
        let _link = hub.attach_silently(PeerId::new(3));

        let prober = LivenessProber::new(Arc::new(hub));
        assert!(!prober.is_alive(PeerId::new(3), TIMEOUT).await);
    }

    #[tokio::test]
    async fn test_wrong_reply_is_not_alive() {
        let (hub, _events) = Hub::new();
        let mut link = hub.attach_silently(PeerId::new(4));
        tokio::spawn(async move {
            while let Some(request) = link.inbox.recv().await {
                let _ = link
                    .outbox
                    .send(request.reply(Message::RoleIsLeader(false)))
                    .await;
            }
        });

        let prober = LivenessProber::new(Arc::new(hub));
        assert!(!prober.is_alive(PeerId::new(4), TIMEOUT).await);
    }
}
