//! User-facing relay configuration: external port and the last match query.

use crate::gateway::DEFAULT_EXTERNAL_PORT;
use crate::store::{KeyValueStore, StoreError};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Store key holding the serialized [`RelayConfig`].
pub const CONFIG_KEY: &str = "relayConfig";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub port: u16,
    pub query: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_EXTERNAL_PORT,
            query: String::new(),
        }
    }
}

impl RelayConfig {
    /// Load from the store, falling back to defaults when absent or unreadable.
    pub async fn load(store: &dyn KeyValueStore) -> Result<Self, StoreError> {
        let Some(value) = store.get(CONFIG_KEY).await? else {
            return Ok(Self::default());
        };
        Ok(serde_json::from_value(value).unwrap_or_else(|e| {
            warn!("Ignoring malformed relay config: {}", e);
            Self::default()
        }))
    }

    pub async fn save(&self, store: &dyn KeyValueStore) -> Result<(), StoreError> {
        store.set(CONFIG_KEY, serde_json::to_value(self)?).await
    }
}
