//! Membership registry: the authoritative, ordered set of live peers.
//!
//! Insertion order is kept because the oldest surviving member wins
//! leadership. Every mutation writes the full set to the store before
//! returning (write-through). When the write fails the in-memory change is
//! kept anyway and the error is handed back, so coordination never stalls on
//! storage.

use crate::prober::Liveness;
use crate::store::{KeyValueStore, StoreError};
use crate::PeerId;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Store key holding the JSON array of registered peer ids.
pub const MEMBERSHIP_KEY: &str = "connectedPeerIds";

pub struct MembershipRegistry {
    members: Vec<PeerId>,
    store: Arc<dyn KeyValueStore>,
}

impl MembershipRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            members: Vec::new(),
            store,
        }
    }

    /// Add a peer at the tail. Adding an existing member changes nothing
    /// but still re-persists.
    pub async fn register(&mut self, peer_id: PeerId) -> Result<(), StoreError> {
        if !self.contains(peer_id) {
            self.members.push(peer_id);
        }
        self.persist().await
    }

    /// Remove a peer. Removing an unknown peer is a no-op (still persisted).
    pub async fn unregister(&mut self, peer_id: PeerId) -> Result<(), StoreError> {
        self.members.retain(|id| *id != peer_id);
        self.persist().await
    }

    pub fn contains(&self, peer_id: PeerId) -> bool {
        self.members.contains(&peer_id)
    }

    /// Members in insertion order, oldest first.
    pub fn snapshot(&self) -> Vec<PeerId> {
        self.members.clone()
    }

    pub fn oldest(&self) -> Option<PeerId> {
        self.members.first().copied()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Reload persisted ids and keep only those that answer a liveness probe.
    ///
    /// Probes run concurrently; persisted order is preserved among survivors.
    /// Members registered before the restore stay, behind the survivors.
    /// The pruned set is written back. Returns the surviving ids.
    pub async fn restore(
        &mut self,
        prober: &dyn Liveness,
        timeout: Duration,
    ) -> Result<Vec<PeerId>, StoreError> {
        let persisted = Self::persisted(self.store.as_ref()).await?;
        if persisted.is_empty() {
            debug!("Registry restore: nothing persisted");
            return Ok(Vec::new());
        }

        let checks = persisted
            .iter()
            .map(|peer_id| prober.is_alive(*peer_id, timeout));
        let results = join_all(checks).await;

        let mut survivors = Vec::new();
        for (peer_id, alive) in persisted.iter().zip(results) {
            if alive {
                info!("Registry restore: peer {} confirmed alive", peer_id);
                survivors.push(*peer_id);
            } else {
                info!("Registry restore: dropping unreachable peer {}", peer_id);
            }
        }

        let newer: Vec<PeerId> = self
            .members
            .iter()
            .filter(|id| !survivors.contains(id))
            .copied()
            .collect();
        self.members = survivors.iter().copied().chain(newer).collect();

        self.persist().await?;
        Ok(survivors)
    }

    /// Ids persisted by a previous run, deduplicated, in persisted order.
    ///
    /// A malformed value reads as empty.
    pub async fn persisted(store: &dyn KeyValueStore) -> Result<Vec<PeerId>, StoreError> {
        let Some(value) = store.get(MEMBERSHIP_KEY).await? else {
            return Ok(Vec::new());
        };
        match serde_json::from_value::<Vec<PeerId>>(value) {
            Ok(ids) => {
                let mut unique = Vec::with_capacity(ids.len());
                for id in ids {
                    if !unique.contains(&id) {
                        unique.push(id);
                    }
                }
                Ok(unique)
            }
            Err(e) => {
                warn!("Ignoring malformed persisted membership: {}", e);
                Ok(Vec::new())
            }
        }
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let value = serde_json::to_value(&self.members)?;
        self.store.set(MEMBERSHIP_KEY, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;

    /// Liveness stub: only the listed peers answer.
    struct Responding(HashSet<PeerId>);

    impl Responding {
        fn only(ids: &[u64]) -> Self {
            Self(ids.iter().copied().map(PeerId::new).collect())
        }
    }

    #[async_trait]
    impl Liveness for Responding {
        async fn is_alive(&self, peer_id: PeerId, _timeout: Duration) -> bool {
            self.0.contains(&peer_id)
        }
    }

    fn ids(raw: &[u64]) -> Vec<PeerId> {
        raw.iter().copied().map(PeerId::new).collect()
    }

    const TIMEOUT: Duration = Duration::from_millis(100);

    #[tokio::test]
    async fn test_register_is_idempotent_and_ordered() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = MembershipRegistry::new(store.clone());

        registry.register(PeerId::new(5)).await.unwrap();
        registry.register(PeerId::new(3)).await.unwrap();
        registry.register(PeerId::new(5)).await.unwrap();

        assert_eq!(registry.snapshot(), ids(&[5, 3]));
        assert_eq!(registry.oldest(), Some(PeerId::new(5)));
        assert_eq!(store.value(MEMBERSHIP_KEY), Some(json!([5, 3])));
    }

    #[tokio::test]
    async fn test_unregister_persists_and_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = MembershipRegistry::new(store.clone());
        registry.register(PeerId::new(1)).await.unwrap();
        registry.register(PeerId::new(2)).await.unwrap();

        registry.unregister(PeerId::new(1)).await.unwrap();
        registry.unregister(PeerId::new(1)).await.unwrap();

        assert!(!registry.contains(PeerId::new(1)));
        assert_eq!(registry.snapshot(), ids(&[2]));
        assert_eq!(store.value(MEMBERSHIP_KEY), Some(json!([2])));
    }

    #[tokio::test]
    async fn test_write_failure_keeps_memory_mutation() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = MembershipRegistry::new(store.clone());
        store.set_fail_writes(true);

        assert!(registry.register(PeerId::new(8)).await.is_err());
        assert!(registry.contains(PeerId::new(8)));
        assert_eq!(store.value(MEMBERSHIP_KEY), None);

        store.set_fail_writes(false);
        registry.register(PeerId::new(9)).await.unwrap();
        assert_eq!(store.value(MEMBERSHIP_KEY), Some(json!([8, 9])));
    }

    #[tokio::test]
    async fn test_restore_keeps_only_live_peers() {
        let store = Arc::new(MemoryStore::new().with_value(MEMBERSHIP_KEY, json!([1, 2, 3])));
        let mut registry = MembershipRegistry::new(store.clone());

        let survivors = registry
            .restore(&Responding::only(&[2]), TIMEOUT)
            .await
            .unwrap();

        assert_eq!(survivors, ids(&[2]));
        assert_eq!(registry.snapshot(), ids(&[2]));
        assert_eq!(store.value(MEMBERSHIP_KEY), Some(json!([2])));
    }

    #[tokio::test]
    async fn test_restore_preserves_persisted_order() {
        let store = Arc::new(MemoryStore::new().with_value(MEMBERSHIP_KEY, json!([9, 4, 7, 4])));
        let mut registry = MembershipRegistry::new(store);

        registry
            .restore(&Responding::only(&[7, 9, 4]), TIMEOUT)
            .await
            .unwrap();

        assert_eq!(registry.snapshot(), ids(&[9, 4, 7]));
    }

    #[tokio::test]
    async fn test_restore_with_nothing_persisted() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = MembershipRegistry::new(store.clone());

        let survivors = registry.restore(&Responding::only(&[1]), TIMEOUT).await.unwrap();

        assert!(survivors.is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_restore_ignores_malformed_data() {
        let store = Arc::new(MemoryStore::new().with_value(MEMBERSHIP_KEY, json!({"oops": true})));
        let mut registry = MembershipRegistry::new(store);

        let survivors = registry.restore(&Responding::only(&[1]), TIMEOUT).await.unwrap();
        assert!(survivors.is_empty());
    }

    #[tokio::test]
    async fn test_persisted_reads_without_registry() {
        let store = MemoryStore::new().with_value(MEMBERSHIP_KEY, json!([4, 2, 4]));
        assert_eq!(MembershipRegistry::persisted(&store).await.unwrap(), ids(&[4, 2]));

        let empty = MemoryStore::new();
        assert!(MembershipRegistry::persisted(&empty).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_keeps_members_registered_meanwhile() {
        let store = Arc::new(MemoryStore::new().with_value(MEMBERSHIP_KEY, json!([1, 2])));
        let mut registry = MembershipRegistry::new(store);
        registry.register(PeerId::new(10)).await.unwrap();

        // Registering overwrote the persisted value, so seed it again.
        let store = Arc::new(MemoryStore::new().with_value(MEMBERSHIP_KEY, json!([1, 2])));
        registry.store = store as Arc<dyn KeyValueStore>;

        registry
            .restore(&Responding::only(&[1, 2]), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(registry.snapshot(), ids(&[1, 2, 10]));
    }
}
