//! Durable queue adapter contract.
//!
//! The on-disk representation belongs to an external queue implementation;
//! the relay only needs a lockable set of entries it can list, read, rewrite,
//! and remove. Entries must be locked before mutation and unlocked on every
//! exit path, including early skips, so another consumer is never left
//! staring at an orphaned lock.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::message::Headers;

/// Errors from the durable queue backend.
#[derive(Debug, Error)]
pub enum QueueError {
    /// No entry with the given id.
    #[error("queue entry not found: {0}")]
    NotFound(String),

    /// The backend failed.
    #[error("queue backend error: {0}")]
    Backend(String),
}

/// Delivery failure bookkeeping carried on each outbound entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureMeta {
    /// When the last send attempt failed.
    pub last_failed: Option<DateTime<Utc>>,
    /// Why it failed.
    pub last_error: Option<String>,
    /// Consecutive failed attempts so far.
    pub failed_count: u32,
}

/// One outbound entry waiting in the durable queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Message headers; the `destination` header says where it goes.
    pub headers: Headers,
    /// Message body.
    pub body: Vec<u8>,
    /// Failure metadata, updated on each failed send.
    #[serde(default)]
    pub failure: FailureMeta,
}

impl QueueEntry {
    /// A fresh entry with no failure history.
    #[must_use]
    pub fn new(headers: Headers, body: Vec<u8>) -> Self {
        Self {
            headers,
            body,
            failure: FailureMeta::default(),
        }
    }

    /// Stamps a failed attempt onto the entry.
    pub fn record_failure(&mut self, reason: impl Into<String>, at: DateTime<Utc>) {
        self.failure.failed_count += 1;
        self.failure.last_failed = Some(at);
        self.failure.last_error = Some(reason.into());
    }
}

/// Contract over an external durable, lockable on-disk queue.
pub trait DurableQueue: Send {
    /// Lists current entry ids.
    fn list(&self) -> Result<Vec<String>, QueueError>;

    /// Takes the exclusive lock on an entry. Returns false if another
    /// consumer holds it.
    fn lock(&self, id: &str) -> bool;

    /// Releases the lock on an entry. Safe to call for ids that no longer
    /// exist; unlock runs on every exit path.
    fn unlock(&self, id: &str);

    /// Reads an entry.
    fn read(&self, id: &str) -> Result<QueueEntry, QueueError>;

    /// Writes an entry under the given id, creating or replacing it.
    fn write(&self, id: &str, entry: &QueueEntry) -> Result<(), QueueError>;

    /// Removes an entry.
    fn remove(&self, id: &str) -> Result<(), QueueError>;

    /// Number of entries currently queued.
    fn count(&self) -> usize;

    /// Housekeeping hint: a good moment to compact or purge. Not
    /// correctness-critical; implementations may ignore it.
    fn purge_hint(&self);
}

#[derive(Debug, Default)]
struct MemoryQueueState {
    entries: BTreeMap<String, QueueEntry>,
    locks: BTreeMap<String, bool>,
    purge_hints: u64,
}

/// Thread-safe in-memory queue for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryQueueState>,
}

impl MemoryQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, MemoryQueueState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Enqueues a new entry under a generated id, returning the id.
    pub fn push(&self, entry: QueueEntry) -> String {
        let id = Uuid::new_v4().as_simple().to_string();
        self.lock_state().entries.insert(id.clone(), entry);
        id
    }

    /// Number of purge hints received, for test assertions.
    #[must_use]
    pub fn purge_hints(&self) -> u64 {
        self.lock_state().purge_hints
    }

    /// Returns true if the entry is currently locked.
    #[must_use]
    pub fn is_locked(&self, id: &str) -> bool {
        self.lock_state().locks.get(id).copied().unwrap_or(false)
    }
}

impl DurableQueue for MemoryQueue {
    fn list(&self) -> Result<Vec<String>, QueueError> {
        Ok(self.lock_state().entries.keys().cloned().collect())
    }

    fn lock(&self, id: &str) -> bool {
        let mut state = self.lock_state();
        if !state.entries.contains_key(id) {
            return false;
        }
        let held = state.locks.entry(id.to_string()).or_insert(false);
        if *held {
            false
        } else {
            *held = true;
            true
        }
    }

    fn unlock(&self, id: &str) {
        self.lock_state().locks.remove(id);
    }

    fn read(&self, id: &str) -> Result<QueueEntry, QueueError> {
        self.lock_state()
            .entries
            .get(id)
            .cloned()
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    fn write(&self, id: &str, entry: &QueueEntry) -> Result<(), QueueError> {
        self.lock_state()
            .entries
            .insert(id.to_string(), entry.clone());
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), QueueError> {
        self.lock_state()
            .entries
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    fn count(&self) -> usize {
        self.lock_state().entries.len()
    }

    fn purge_hint(&self) {
        self.lock_state().purge_hints += 1;
    }
}
