//! BoxModelProvider -- object-safe dynamic dispatch wrapper for ModelProvider.
//!
//! 1. `ModelProviderDyn` is object-safe with boxed futures
//! 2. blanket impl of `ModelProviderDyn` for every `T: ModelProvider`
//! 3. `BoxModelProvider` wraps `Box<dyn ModelProviderDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use super::provider::{GenerateRequest, ModelError, ModelProvider};

/// Object-safe version of [`ModelProvider`].
pub trait ModelProviderDyn: Send + Sync {
    fn name(&self) -> &str;

    fn generate_boxed<'a>(
        &'a self,
        request: &'a GenerateRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ModelError>> + Send + 'a>>;
}

impl<T: ModelProvider> ModelProviderDyn for T {
    fn name(&self) -> &str {
        ModelProvider::name(self)
    }

    fn generate_boxed<'a>(
        &'a self,
        request: &'a GenerateRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ModelError>> + Send + 'a>> {
        Box::pin(self.generate(request))
    }
}

/// Type-erased model provider.
pub struct BoxModelProvider {
    inner: Box<dyn ModelProviderDyn + Send + Sync>,
}

impl BoxModelProvider {
    pub fn new<T: ModelProvider + 'static>(provider: T) -> Self {
        Self {
            inner: Box::new(provider),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn generate(&self, request: &GenerateRequest) -> Result<Value, ModelError> {
        self.inner.generate_boxed(request).await
    }
}

impl std::fmt::Debug for BoxModelProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxModelProvider")
            .field("name", &self.name())
            .finish()
    }
}
