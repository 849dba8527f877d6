//! Session state backend trait.
//!
//! Session-scoped node state outlives a single run, so it is delegated to a
//! pluggable store. Implementations live in agentflow-infra.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use agentflow_types::error::StoreError;
use serde_json::Value;

/// Trait for keyed session state storage.
///
/// `get` and `set` must each be atomic per key. Uses RPITIT (native async fn
/// in traits, Rust 2024 edition).
pub trait StateBackend: Send + Sync {
    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    /// Get a value. Expired entries read as `None`.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Value>, StoreError>> + Send;

    /// Upsert a value. A `ttl` of `None` keeps the entry until overwritten.
    fn set(
        &self,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delete a key. No-op if the key does not exist.
    fn delete(&self, key: &str) -> impl Future<Output = Result<(), StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// Type-erased wrapper
// ---------------------------------------------------------------------------

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe version of [`StateBackend`] with boxed futures.
pub trait StateBackendDyn: Send + Sync {
    fn name(&self) -> &str;

    fn get_boxed<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>, StoreError>>;

    fn set_boxed<'a>(
        &'a self,
        key: &'a str,
        value: &'a Value,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    fn delete_boxed<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StoreError>>;
}

impl<T: StateBackend> StateBackendDyn for T {
    fn name(&self) -> &str {
        StateBackend::name(self)
    }

    fn get_boxed<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>, StoreError>> {
        Box::pin(self.get(key))
    }

    fn set_boxed<'a>(
        &'a self,
        key: &'a str,
        value: &'a Value,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(self.set(key, value, ttl))
    }

    fn delete_boxed<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(self.delete(key))
    }
}

/// Type-erased state backend, selected at runtime by `backend_ref`.
pub struct BoxStateBackend {
    inner: Box<dyn StateBackendDyn + Send + Sync>,
}

impl BoxStateBackend {
    pub fn new<T: StateBackend + 'static>(backend: T) -> Self {
        Self {
            inner: Box::new(backend),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get_boxed(key).await
    }

    pub async fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.inner.set_boxed(key, value, ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete_boxed(key).await
    }
}

impl std::fmt::Debug for BoxStateBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStateBackend")
            .field("name", &self.name())
            .finish()
    }
}
