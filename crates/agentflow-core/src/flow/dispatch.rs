//! Operation registry and capability dispatch.
//!
//! A node's `Transform` is resolved to a `Capability` once, before a run
//! starts, so unknown operations and missing runtimes surface early. At run
//! time `Dispatcher::invoke` executes the capability for one attempt.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use agentflow_types::flow::{PromptFallback, Transform};
use agentflow_types::run::ErrorKind;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Map, Value};
use thiserror::Error;

use super::context::{resolve_template, Context};
use super::schema::CompiledSchema;
use super::state::ScopedState;
use crate::llm::box_provider::BoxModelProvider;
use crate::llm::provider::{GenerateRequest, ModelProvider};

/// Values on a node's input ports, keyed by port name.
pub type Inputs = Map<String, Value>;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Error raised by an operation or code runtime.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("{0}")]
    Failed(String),
}

impl OperationError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Resolve-time failures, reported before a run starts.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    #[error("code transform requires a code runtime, none is configured")]
    NoCodeRuntime,

    #[error("prompt transform requires a model provider, none is configured")]
    NoModelProvider,

    #[error("invalid output schema: {0}")]
    InvalidSchema(String),
}

/// Failure of a single invocation.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("{0}")]
    Invocation(String),

    #[error("output schema violation: {0}")]
    OutputSchema(String),
}

impl InvokeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InvokeError::Invocation(_) => ErrorKind::Invocation,
            InvokeError::OutputSchema(_) => ErrorKind::OutputSchema,
        }
    }
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// A named declarative operation: `(args, inputs, ctx) -> value`.
pub trait Operation: Send + Sync {
    fn call(
        &self,
        args: &Value,
        inputs: &Inputs,
        ctx: &Context,
    ) -> impl Future<Output = Result<Value, OperationError>> + Send;
}

/// Object-safe version of [`Operation`] with boxed futures.
pub trait OperationDyn: Send + Sync {
    fn call_boxed<'a>(
        &'a self,
        args: &'a Value,
        inputs: &'a Inputs,
        ctx: &'a Context,
    ) -> BoxFuture<'a, Result<Value, OperationError>>;
}

impl<T: Operation> OperationDyn for T {
    fn call_boxed<'a>(
        &'a self,
        args: &'a Value,
        inputs: &'a Inputs,
        ctx: &'a Context,
    ) -> BoxFuture<'a, Result<Value, OperationError>> {
        Box::pin(self.call(args, inputs, ctx))
    }
}

/// Adapter registering a plain closure as an operation.
pub struct FnOperation<F> {
    f: F,
}

impl<F> Operation for FnOperation<F>
where
    F: Fn(&Value, &Inputs, &Context) -> Result<Value, OperationError> + Send + Sync,
{
    async fn call(&self, args: &Value, inputs: &Inputs, ctx: &Context) -> Result<Value, OperationError> {
        (self.f)(args, inputs, ctx)
    }
}

/// Operations available to declarative transforms, by name.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    operations: HashMap<String, Arc<dyn OperationDyn>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation, replacing any previous one with the same name.
    pub fn register<T: Operation + 'static>(&mut self, name: impl Into<String>, operation: T) {
        self.operations.insert(name.into(), Arc::new(operation));
    }

    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&Value, &Inputs, &Context) -> Result<Value, OperationError> + Send + Sync + 'static,
    {
        self.register(name, FnOperation { f });
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn OperationDyn>> {
        self.operations.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("operations", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Code runtime
// ---------------------------------------------------------------------------

/// Host-supplied executor for `code` transforms.
pub trait CodeRuntime: Send + Sync {
    fn run(
        &self,
        body: &str,
        inputs: &Inputs,
        ctx: &Context,
        state: Option<&ScopedState>,
    ) -> impl Future<Output = Result<Value, OperationError>> + Send;
}

/// Object-safe version of [`CodeRuntime`].
pub trait CodeRuntimeDyn: Send + Sync {
    fn run_boxed<'a>(
        &'a self,
        body: &'a str,
        inputs: &'a Inputs,
        ctx: &'a Context,
        state: Option<&'a ScopedState>,
    ) -> BoxFuture<'a, Result<Value, OperationError>>;
}

impl<T: CodeRuntime> CodeRuntimeDyn for T {
    fn run_boxed<'a>(
        &'a self,
        body: &'a str,
        inputs: &'a Inputs,
        ctx: &'a Context,
        state: Option<&'a ScopedState>,
    ) -> BoxFuture<'a, Result<Value, OperationError>> {
        Box::pin(self.run(body, inputs, ctx, state))
    }
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// A resolved, ready-to-invoke transform.
#[derive(Clone)]
pub enum Capability {
    Operation {
        name: String,
        operation: Arc<dyn OperationDyn>,
        args: Value,
    },
    Code {
        body: String,
        runtime: Arc<dyn CodeRuntimeDyn>,
    },
    Prompt(Arc<PromptCapability>),
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Operation { name, .. } => write!(f, "Operation({name})"),
            Capability::Code { .. } => f.write_str("Code"),
            Capability::Prompt(p) => write!(f, "Prompt({})", p.model),
        }
    }
}

/// A prompt transform bound to a model provider.
pub struct PromptCapability {
    template: String,
    system: Option<String>,
    model: String,
    schema: Option<(Value, CompiledSchema)>,
    fallback: PromptFallback,
    provider: Arc<BoxModelProvider>,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Resolves transforms against the registry and host capabilities.
#[derive(Clone, Default)]
pub struct Dispatcher {
    registry: OperationRegistry,
    code_runtime: Option<Arc<dyn CodeRuntimeDyn>>,
    model_provider: Option<Arc<BoxModelProvider>>,
}

impl Dispatcher {
    pub fn new(registry: OperationRegistry) -> Self {
        Self {
            registry,
            code_runtime: None,
            model_provider: None,
        }
    }

    pub fn with_code_runtime<T: CodeRuntime + 'static>(mut self, runtime: T) -> Self {
        self.code_runtime = Some(Arc::new(runtime));
        self
    }

    pub fn with_model_provider<T: ModelProvider + 'static>(mut self, provider: T) -> Self {
        self.model_provider = Some(Arc::new(BoxModelProvider::new(provider)));
        self
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// Resolve a transform to a capability.
    pub fn resolve(&self, transform: &Transform) -> Result<Capability, DispatchError> {
        match transform {
            Transform::Declarative { op_name, args } => {
                let operation = self
                    .registry
                    .get(op_name)
                    .ok_or_else(|| DispatchError::UnknownOperation(op_name.clone()))?;
                Ok(Capability::Operation {
                    name: op_name.clone(),
                    operation,
                    args: args.clone(),
                })
            }
            Transform::Code { body } => {
                let runtime = self.code_runtime.clone().ok_or(DispatchError::NoCodeRuntime)?;
                Ok(Capability::Code {
                    body: body.clone(),
                    runtime,
                })
            }
            Transform::Prompt {
                template,
                system,
                model_ref,
                output_schema,
                fallback,
            } => {
                let provider = self
                    .model_provider
                    .clone()
                    .ok_or(DispatchError::NoModelProvider)?;
                let schema = match output_schema {
                    Some(raw) => Some((
                        raw.clone(),
                        CompiledSchema::compile(raw).map_err(DispatchError::InvalidSchema)?,
                    )),
                    None => None,
                };
                Ok(Capability::Prompt(Arc::new(PromptCapability {
                    template: template.clone(),
                    system: system.clone(),
                    model: model_ref.clone(),
                    schema,
                    fallback: fallback.clone(),
                    provider,
                })))
            }
        }
    }

    /// Run one attempt of a capability.
    ///
    /// Panics raised inside the capability are caught and reported as
    /// invocation errors.
    pub async fn invoke(
        &self,
        capability: &Capability,
        inputs: &Inputs,
        ctx: &Context,
        state: Option<&ScopedState>,
    ) -> Result<Value, InvokeError> {
        let call = async {
            match capability {
                Capability::Operation {
                    operation, args, ..
                } => operation
                    .call_boxed(args, inputs, ctx)
                    .await
                    .map_err(|e| InvokeError::Invocation(e.to_string())),
                Capability::Code { body, runtime } => runtime
                    .run_boxed(body, inputs, ctx, state)
                    .await
                    .map_err(|e| InvokeError::Invocation(e.to_string())),
                Capability::Prompt(prompt) => invoke_prompt(prompt, inputs, ctx, state).await,
            }
        };
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(InvokeError::Invocation(format!(
                "capability panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("code_runtime", &self.code_runtime.is_some())
            .field("model_provider", &self.model_provider)
            .finish()
    }
}

async fn invoke_prompt(
    prompt: &PromptCapability,
    inputs: &Inputs,
    ctx: &Context,
    state: Option<&ScopedState>,
) -> Result<Value, InvokeError> {
    let state_value = match state {
        Some(s) => s
            .get(Value::Null)
            .await
            .map_err(|e| InvokeError::Invocation(e.to_string()))?,
        None => Value::Null,
    };
    let root = json!({
        "inputs": inputs,
        "context": ctx.to_expression_value(),
        "state": state_value,
    });
    let request = GenerateRequest {
        model: prompt.model.clone(),
        system: prompt.system.as_ref().map(|s| resolve_template(s, &root)),
        prompt: resolve_template(&prompt.template, &root),
        schema: prompt.schema.as_ref().map(|(raw, _)| raw.clone()),
    };

    let response = prompt
        .provider
        .generate(&request)
        .await
        .map_err(|e| InvokeError::Invocation(e.to_string()))?;
    let Some((_, schema)) = &prompt.schema else {
        return Ok(response);
    };

    let reason = match conform(response, schema) {
        Ok(value) => return Ok(value),
        Err(reason) => reason,
    };
    match &prompt.fallback {
        PromptFallback::Raise => Err(InvokeError::OutputSchema(reason)),
        PromptFallback::Static { response } => {
            tracing::warn!(model = %prompt.model, %reason, "model output rejected, using static fallback");
            Ok(response.clone())
        }
        PromptFallback::Model { model_ref } => {
            tracing::warn!(model = %prompt.model, fallback = %model_ref, %reason, "model output rejected, asking fallback model");
            let retry = GenerateRequest {
                model: model_ref.clone(),
                ..request
            };
            let response = prompt
                .provider
                .generate(&retry)
                .await
                .map_err(|e| InvokeError::Invocation(e.to_string()))?;
            conform(response, schema)
                .map_err(|r| InvokeError::OutputSchema(format!("fallback model '{model_ref}': {r}")))
        }
    }
}

/// Check a model response against the output schema. String responses that
/// hold JSON are parsed first.
fn conform(response: Value, schema: &CompiledSchema) -> Result<Value, String> {
    let value = match response {
        Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        other => other,
    };
    schema.check(&value)?;
    Ok(value)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
