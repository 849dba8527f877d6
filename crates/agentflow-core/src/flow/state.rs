//! Request- and session-scoped node state.
//!
//! Request state is a map private to one run and dropped with it. Session
//! state lives in a named `StateBackend` and outlives runs. Either way a
//! capability only sees a `ScopedState` bound to its rendered key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agentflow_types::error::StoreError;
use agentflow_types::flow::{Node, StateScope};
use dashmap::DashMap;
use serde_json::{Map, Value};
use thiserror::Error;

use super::context::{render_key_template, Context, ContextError};
use crate::storage::state_backend::{BoxStateBackend, StateBackend};

/// Name under which the default session backend is registered.
pub const DEFAULT_BACKEND: &str = "default";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state key error: {0}")]
    Key(#[from] ContextError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Request scope
// ---------------------------------------------------------------------------

/// Per-run state map. Aliased keys are last-write-wins.
#[derive(Debug, Clone, Default)]
pub struct RequestState {
    values: Arc<DashMap<String, Value>>,
}

impl RequestState {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|v| v.value().clone())
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Session backends
// ---------------------------------------------------------------------------

/// Named session backends available to an engine.
#[derive(Debug, Clone, Default)]
pub struct StateBackends {
    backends: HashMap<String, Arc<BoxStateBackend>>,
}

impl StateBackends {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the backend used when a node sets no `backend_ref`.
    pub fn with_default<T: StateBackend + 'static>(self, backend: T) -> Self {
        self.with_named(DEFAULT_BACKEND, backend)
    }

    pub fn with_named<T: StateBackend + 'static>(mut self, name: impl Into<String>, backend: T) -> Self {
        self.backends
            .insert(name.into(), Arc::new(BoxStateBackend::new(backend)));
        self
    }

    pub fn get(&self, backend_ref: Option<&str>) -> Result<Arc<BoxStateBackend>, StoreError> {
        let name = backend_ref.unwrap_or(DEFAULT_BACKEND);
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownBackend(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

// ---------------------------------------------------------------------------
// Manager and scoped handle
// ---------------------------------------------------------------------------

/// Binds nodes to their state for one run.
#[derive(Debug, Clone)]
pub struct StateManager {
    request: RequestState,
    backends: Arc<StateBackends>,
}

impl StateManager {
    pub fn new(backends: Arc<StateBackends>) -> Self {
        Self {
            request: RequestState::default(),
            backends,
        }
    }

    pub fn request_state(&self) -> &RequestState {
        &self.request
    }

    /// The state handle for one node execution, or `None` when the node has
    /// no state configuration.
    pub fn scoped(
        &self,
        node: &Node,
        ctx: &Context,
        inputs: &Map<String, Value>,
    ) -> Result<Option<ScopedState>, StateError> {
        let Some(config) = &node.state_config else {
            return Ok(None);
        };
        let key = render_key_template(&config.key_template, &node.id, ctx, inputs)?;
        let slot = match config.scope {
            StateScope::Request => Slot::Request(self.request.clone()),
            StateScope::Session => Slot::Session {
                backend: self.backends.get(config.backend_ref.as_deref())?,
                ttl: config.ttl(),
            },
        };
        Ok(Some(ScopedState { key, slot }))
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Request(RequestState),
    Session {
        backend: Arc<BoxStateBackend>,
        ttl: Option<Duration>,
    },
}

/// A node's view of its state, bound to one rendered key.
#[derive(Debug, Clone)]
pub struct ScopedState {
    key: String,
    slot: Slot,
}

impl ScopedState {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn scope(&self) -> StateScope {
        match self.slot {
            Slot::Request(_) => StateScope::Request,
            Slot::Session { .. } => StateScope::Session,
        }
    }

    /// Current value, or `default` when unset or expired.
    pub async fn get(&self, default: Value) -> Result<Value, StoreError> {
        let current = match &self.slot {
            Slot::Request(map) => map.get(&self.key),
            Slot::Session { backend, .. } => backend.get(&self.key).await?,
        };
        Ok(current.unwrap_or(default))
    }

    pub async fn set(&self, value: Value) -> Result<(), StoreError> {
        match &self.slot {
            Slot::Request(map) => {
                map.set(self.key.clone(), value);
                Ok(())
            }
            Slot::Session { backend, ttl } => backend.set(&self.key, &value, *ttl).await,
        }
    }
}
