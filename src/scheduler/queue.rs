use std::collections::VecDeque;

use crate::scheduler::job::QueueEntry;

/// Jobs this node has won, in dispatch (FIFO) order.
///
/// An entry leaves the queue exactly once: at dispatch, or when its job is
/// cancelled before a container was ever created.
#[derive(Debug, Default)]
pub struct LocalQueue {
    entries: VecDeque<QueueEntry>,
}

impl LocalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<QueueEntry>) -> Self {
        let mut queue = Self::new();
        for entry in entries {
            queue.push(entry);
        }
        queue
    }

    /// Append an entry. Returns false if the job is already queued.
    pub fn push(&mut self, entry: QueueEntry) -> bool {
        if self.contains(&entry.job_id) {
            return false;
        }
        self.entries.push_back(entry);
        true
    }

    pub fn pop_front(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    /// Remove the entry for `job_id`, if present.
    pub fn remove(&mut self, job_id: &str) -> Option<QueueEntry> {
        let index = self.entries.iter().position(|e| e.job_id == job_id)?;
        self.entries.remove(index)
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.entries.iter().any(|e| e.job_id == job_id)
    }

    /// Snapshot in dispatch order, as persisted to the store
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
