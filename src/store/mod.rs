//! Coordination store: per-node queue state, run records, cached build
//! configurations and pub/sub publication.
//!
//! - [`RedisStore`]: production backend
//! - [`MemoryStore`]: in-process backend used by tests and local runs
//!
//! Only the owning node writes its own `node:<id>:*` keys.

pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::scheduler::job::{QueueEntry, RunRecord};
use crate::scheduler::registry::RegistryEntry;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Key layout of the coordination store.
pub mod keys {
    pub fn queued_builds(node_id: &str) -> String {
        format!("node:{node_id}:queued_builds")
    }

    pub fn current_builds(node_id: &str) -> String {
        format!("node:{node_id}:current_builds")
    }

    pub fn run(job_id: &str) -> String {
        format!("run:{job_id}")
    }

    pub fn build_config(builder_id: i64) -> String {
        format!("build_config:{builder_id}")
    }
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String) -> Result<()>;

    async fn publish(&self, channel: &str, payload: String) -> Result<()>;
}

/// Typed accessors layered over the raw key/value interface.
#[async_trait]
pub trait CoordinationStoreExt: CoordinationStore {
    async fn get_run(&self, job_id: &str) -> Result<Option<RunRecord>> {
        self.get_json(&keys::run(job_id)).await
    }

    async fn put_run(&self, record: &RunRecord) -> Result<()> {
        self.set_json(&keys::run(&record.id), record).await
    }

    async fn load_queue(&self, node_id: &str) -> Result<Vec<QueueEntry>> {
        Ok(self
            .get_json(&keys::queued_builds(node_id))
            .await?
            .unwrap_or_default())
    }

    async fn save_queue(&self, node_id: &str, entries: &[QueueEntry]) -> Result<()> {
        self.set_json(&keys::queued_builds(node_id), &entries).await
    }

    async fn save_current_builds(&self, node_id: &str, entries: &[RegistryEntry]) -> Result<()> {
        self.set_json(&keys::current_builds(node_id), &entries).await
    }

    async fn build_config(&self, builder_id: i64) -> Result<Option<Value>> {
        self.get_json(&keys::build_config(builder_id)).await
    }

    async fn get_json<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de> + Send,
    {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let raw = serde_json::to_string(value)?;
        self.set(key, raw).await
    }
}

impl<S: CoordinationStore + ?Sized> CoordinationStoreExt for S {}
