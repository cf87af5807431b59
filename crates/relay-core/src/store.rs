//! KeyValueStore trait abstraction for persisted coordinator and peer state.
//!
//! Implementations:
//! - `MemoryStore` - For testing (supports injected write failures)
//! - `JsonFileStore` (in relay-daemon) - One JSON document on disk

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Durable key/value storage.
///
/// `set` must not return until the value is durable (write-through).
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Store `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: Value) -> Result<()>;
}

/// In-memory store for testing.
#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, Value>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value without going through `set`.
    pub fn with_value(self, key: &str, value: Value) -> Self {
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value);
        self
    }

    /// Make every subsequent `set` fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Peek at a stored value synchronously.
    pub fn value(&self, key: &str) -> Option<Value> {
        self.values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.value(key))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("write to {key} rejected")));
        }
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value);
        Ok(())
    }
}
