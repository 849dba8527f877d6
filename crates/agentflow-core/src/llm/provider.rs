//! Model capability consumed by prompt nodes.
//!
//! The engine only needs "render a prompt, get a value back". Concrete model
//! backends are supplied by the host.

use std::future::Future;

use serde_json::Value;
use thiserror::Error;

/// A single generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    /// The node's `model_ref` (or a fallback model).
    pub model: String,
    pub system: Option<String>,
    /// Rendered prompt text.
    pub prompt: String,
    /// Expected output schema, passed through so providers can use
    /// structured output modes.
    pub schema: Option<Value>,
}

/// Errors a model provider can report.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model '{0}' is not available")]
    UnknownModel(String),

    #[error("provider error: {0}")]
    Provider(String),
}

/// Trait for model backends.
///
/// Uses RPITIT; wrap in [`super::box_provider::BoxModelProvider`] for dynamic
/// dispatch.
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Generate a response. Text responses are returned as JSON strings.
    fn generate(&self, request: &GenerateRequest) -> impl Future<Output = Result<Value, ModelError>> + Send;
}
