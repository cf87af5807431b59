//! File-backed key/value store.
//!
//! All keys live in one JSON object at `<state-dir>/relay_state.json`.
//! Several processes may share a state dir, so every access re-reads the
//! file and every `set` merges its key into what is on disk before
//! rewriting it. The in-memory copy is only a fallback for unreadable files.

use async_trait::async_trait;
use relay_core::store::{KeyValueStore, Result, StoreError};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// File name of the state document inside the state directory.
pub const STATE_FILE: &str = "relay_state.json";

pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl JsonFileStore {
    /// Open the store in `dir`, loading existing state if present.
    ///
    /// A missing or unreadable file starts an empty store; the directory is
    /// created on first write.
    pub fn open(dir: &Path) -> Self {
        let path = dir.join(STATE_FILE);
        let values = match Self::load(&path) {
            Ok(values) => values,
            Err(e) => {
                warn!("Starting with empty state, could not read {:?}: {}", path, e);
                Map::new()
            }
        };
        debug!("Opened state file {:?} ({} keys)", path, values.len());
        Self {
            path,
            values: Mutex::new(values),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<Map<String, Value>> {
        if !path.exists() {
            return Ok(Map::new());
        }
        let contents = fs::read_to_string(path).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// What is on disk now, or `cached` when the file cannot be read.
    fn current(&self, cached: &Map<String, Value>) -> Map<String, Value> {
        match Self::load(&self.path) {
            Ok(values) => values,
            Err(e) => {
                warn!("Could not re-read {:?}, using last known state: {}", self.path, e);
                cached.clone()
            }
        }
    }

    fn save(&self, values: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        let contents = serde_json::to_string_pretty(values)?;
        let tmp = self
            .path
            .with_extension(format!("json.{}.tmp", std::process::id()));
        fs::write(&tmp, contents).map_err(|e| StoreError::Io(e.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|e| StoreError::Io(e.to_string()))
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut cached = self.values.lock().unwrap_or_else(|e| e.into_inner());
        let values = self.current(&cached);
        let value = values.get(key).cloned();
        *cached = values;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut cached = self.values.lock().unwrap_or_else(|e| e.into_inner());
        let mut values = self.current(&cached);
        values.insert(key.to_string(), value);
        self.save(&values)?;
        *cached = values;
        Ok(())
    }
}
