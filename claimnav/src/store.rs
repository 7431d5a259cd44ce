//! Shared key-value state visible to every context of one host.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::AutomationError;

pub mod keys {
    pub const HANDOFF: &str = "handoff";
    pub const OWNER_REQUEST_ID: &str = "ownerRequestId";
    pub const KICK: &str = "kick";
    pub const LAST_REQUEST_ID: &str = "lastRequestId";
    pub const LAST_CLAIM: &str = "lastClaim";
    pub const LAST_KICK: &str = "lastKick";
    pub const SETTINGS_V1: &str = "settings_v1";
    pub const SETTINGS_V2: &str = "settings_v2";
    pub const CLAIM_FAILURES: &str = "claimFailures";
}

/// Computes the entries to write from the current values of the requested keys.
pub type UpdateFn = Box<dyn FnOnce(&HashMap<String, Value>) -> Vec<(String, Value)> + Send>;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Values for the requested keys; absent keys are omitted.
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>, AutomationError>;

    /// Writes all entries as one change and notifies subscribers once.
    async fn set_many(&self, entries: Vec<(String, Value)>) -> Result<(), AutomationError>;

    async fn remove(&self, keys: &[&str]) -> Result<(), AutomationError>;

    /// Read-modify-write with no other write in between. `f` sees the
    /// current values of `keys`; whatever it returns is written as one
    /// change and handed back. An empty result writes nothing.
    async fn update(&self, keys: &[&str], f: UpdateFn) -> Result<Vec<(String, Value)>, AutomationError>;

    /// Stream of changed key sets.
    fn subscribe(&self) -> broadcast::Receiver<Vec<String>>;
}

pub async fn read<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, AutomationError> {
    let mut values = store.get(&[key]).await?;
    match values.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v)
            .map(Some)
            .map_err(|e| AutomationError::Storage(format!("{key}: {e}"))),
    }
}

pub async fn write<T: Serialize + ?Sized>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
) -> Result<(), AutomationError> {
    let v = serde_json::to_value(value)
        .map_err(|e| AutomationError::Storage(format!("{key}: {e}")))?;
    store.set_many(vec![(key.to_string(), v)]).await
}

/// In-process store shared by the portal, mediator and target agents.
pub struct MemoryStore {
    data: RwLock<HashMap<String, Value>>,
    changes: broadcast::Sender<Vec<String>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(128);
        Self {
            data: RwLock::new(HashMap::new()),
            changes,
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>, AutomationError> {
        let data = self.data.read().await;
        Ok(keys
            .iter()
            .filter_map(|k| data.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect())
    }

    async fn set_many(&self, entries: Vec<(String, Value)>) -> Result<(), AutomationError> {
        let changed: Vec<String> = entries.iter().map(|(k, _)| k.clone()).collect();
        {
            let mut data = self.data.write().await;
            for (k, v) in entries {
                data.insert(k, v);
            }
        }
        debug!(keys = ?changed, "store updated");
        // No subscribers is fine.
        let _ = self.changes.send(changed);
        Ok(())
    }

    async fn remove(&self, keys: &[&str]) -> Result<(), AutomationError> {
        {
            let mut data = self.data.write().await;
            for k in keys {
                data.remove(*k);
            }
        }
        let _ = self
            .changes
            .send(keys.iter().map(|k| k.to_string()).collect());
        Ok(())
    }

    async fn update(&self, keys: &[&str], f: UpdateFn) -> Result<Vec<(String, Value)>, AutomationError> {
        let written = {
            let mut data = self.data.write().await;
            let current: HashMap<String, Value> = keys
                .iter()
                .filter_map(|k| data.get(*k).map(|v| (k.to_string(), v.clone())))
                .collect();
            let entries = f(&current);
            for (k, v) in &entries {
                data.insert(k.clone(), v.clone());
            }
            entries
        };
        if !written.is_empty() {
            let changed: Vec<String> = written.iter().map(|(k, _)| k.clone()).collect();
            debug!(keys = ?changed, "store updated");
            let _ = self.changes.send(changed);
        }
        Ok(written)
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<String>> {
        self.changes.subscribe()
    }
}
