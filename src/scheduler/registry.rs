use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::naming::ContainerName;

/// Lifecycle phase of a registered container.
///
/// `Died`/`Stopped` are not represented: a terminal runtime event removes the
/// entry from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerPhase {
    /// Creation requested, no `start` event seen yet
    Created,
    /// `start` event seen
    Started,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub job_id: String,
    pub builder_id: i64,
    pub container_name: String,
    pub container_id: Option<String>,
    pub phase: ContainerPhase,
    /// A stop has been issued; further stop requests are suppressed
    pub stop_requested: bool,
    /// Set when the job was cancelled while containerized
    pub cancel_reason: Option<String>,
    pub session_active: bool,
    /// The run was already finalized by its session; the container's
    /// termination only frees capacity
    pub run_settled: bool,
}

impl RegistryEntry {
    pub fn new(name: &ContainerName) -> Self {
        Self {
            job_id: name.job_id().to_string(),
            builder_id: name.builder_id(),
            container_name: name.to_string(),
            container_id: None,
            phase: ContainerPhase::Created,
            stop_requested: false,
            cancel_reason: None,
            session_active: false,
            run_settled: false,
        }
    }
}

/// In-process list of containers this node is running.
///
/// Rebuilt from nothing on restart; its length is the node's running count
/// and never exceeds the concurrency ceiling.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<RegistryEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a container. Returns false if the job is already registered.
    pub fn insert(&mut self, entry: RegistryEntry) -> bool {
        if self.contains(&entry.job_id) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn get(&self, job_id: &str) -> Option<&RegistryEntry> {
        self.entries.iter().find(|e| e.job_id == job_id)
    }

    pub fn get_mut(&mut self, job_id: &str) -> Option<&mut RegistryEntry> {
        self.entries.iter_mut().find(|e| e.job_id == job_id)
    }

    pub fn remove(&mut self, job_id: &str) -> Option<RegistryEntry> {
        let index = self.entries.iter().position(|e| e.job_id == job_id)?;
        Some(self.entries.remove(index))
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.get(job_id).is_some()
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Bounded memory of containers whose termination was already handled.
///
/// The runtime reports `die` and then `stop` for a single stop; the second
/// event must not be mistaken for an orphan.
#[derive(Debug)]
pub struct FinishedContainers {
    names: VecDeque<String>,
    capacity: usize,
}

impl Default for FinishedContainers {
    fn default() -> Self {
        Self::with_capacity(256)
    }
}

impl FinishedContainers {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            names: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn insert(&mut self, name: impl Into<String>) {
        let name = name.into();
        if self.contains(&name) {
            return;
        }
        if self.names.len() >= self.capacity {
            self.names.pop_front();
        }
        self.names.push_back(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}
