use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::store::CoordinationStore;

const PUBLISH_BUFFER: usize = 1024;

/// In-process coordination store.
///
/// Keeps every published message so callers can inspect what went out, and
/// re-broadcasts publications to in-process subscribers.
#[derive(Debug)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    published: Mutex<Vec<(String, String)>>,
    publish_tx: broadcast::Sender<(String, String)>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (publish_tx, _) = broadcast::channel(PUBLISH_BUFFER);
        Self {
            values: Mutex::new(HashMap::new()),
            published: Mutex::new(Vec::new()),
            publish_tx,
        }
    }

    /// All payloads published on `channel`, oldest first.
    pub fn published(&self, channel: &str) -> Vec<String> {
        self.published
            .lock()
            .map(|published| {
                published
                    .iter()
                    .filter(|(c, _)| c == channel)
                    .map(|(_, p)| p.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Receive `(channel, payload)` for every later publication.
    pub fn subscribe(&self) -> broadcast::Receiver<(String, String)> {
        self.publish_tx.subscribe()
    }

    pub fn keys(&self) -> Vec<String> {
        self.values
            .lock()
            .map(|values| values.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .values
            .lock()
            .ok()
            .and_then(|values| values.get(key).cloned()))
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        if let Ok(mut published) = self.published.lock() {
            published.push((channel.to_string(), payload.clone()));
        }
        // No subscribers is fine
        let _ = self.publish_tx.send((channel.to_string(), payload));
        Ok(())
    }
}
