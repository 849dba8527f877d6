//! In-memory session state backend.
//!
//! Entries live in a `DashMap`, so `get` and `set` are atomic per key.
//! Expiry is checked lazily on read; `purge_expired` sweeps the whole map.

use std::time::Duration;

use agentflow_core::storage::state_backend::StateBackend;
use agentflow_types::error::StoreError;
use dashmap::DashMap;
use serde_json::Value;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Session state held in process memory. Lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryStateBackend {
    entries: DashMap<String, Entry>,
}

impl InMemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }
}

impl StateBackend for InMemoryStateBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let now = Instant::now();
        let live = self
            .entries
            .get(key)
            .map(|entry| (!entry.is_expired(now)).then(|| entry.value.clone()));
        match live {
            Some(Some(value)) => Ok(Some(value)),
            Some(None) => {
                self.entries.remove_if(key, |_, entry| entry.is_expired(now));
                tracing::debug!(key, "session state entry expired");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        let entry = Entry {
            value: value.clone(),
            // A ttl past the clock's range never expires.
            expires_at: ttl.and_then(|ttl| Instant::now().checked_add(ttl)),
        };
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}
