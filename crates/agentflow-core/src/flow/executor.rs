//! Ready-set executor for validated flows.
//!
//! A single coordinating task owns all run state. A node becomes ready once
//! every incoming edge is resolved (delivered or empty); ready nodes are
//! dispatched in (layer, document order) and their attempts run on a
//! `JoinSet`. Completions are folded back into the coordinator, which
//! resolves outgoing edges and releases downstream nodes.
//!
//! Cancellation is a token tree: one run token (reachable through
//! `FlowEngine::cancel`) and one child token shared by the run's node tasks.
//! An unrouted node failure cancels only the child token.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use agentflow_types::config::{BackoffPolicy, EngineConfig};
use agentflow_types::flow::{Node, Port};
use agentflow_types::run::{
    ErrorKind, NodeExecutionRecord, NodeStatus, RunResult, RunRequest, RunStatus, StructuredError,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::context::{new_context, Context, ContextError};
use super::dag::{build_execution_plan, ExecutionPlan, PortSchemas};
use super::definition::{Flow, FlowError};
use super::dispatch::{Capability, DispatchError, Dispatcher, Inputs};
use super::expression::EdgeEvaluator;
use super::retry::RetryHandler;
use super::schema::CompiledSchema;
use super::state::{StateBackends, StateManager};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Failures that stop a run before it starts.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Plan(#[from] FlowError),

    #[error("node '{node_id}': {source}")]
    Dispatch {
        node_id: String,
        #[source]
        source: DispatchError,
    },

    #[error("context error: {0}")]
    Context(#[from] ContextError),
}

// ---------------------------------------------------------------------------
// FlowEngine
// ---------------------------------------------------------------------------

/// Executes flows against a dispatcher and a set of session backends.
///
/// One engine serves many concurrent runs. Per-node `max_concurrency`
/// semaphores and run cancellation tokens are shared across those runs.
pub struct FlowEngine {
    dispatcher: Arc<Dispatcher>,
    backends: Arc<StateBackends>,
    config: EngineConfig,
    /// Per-node concurrency limits keyed by `flow_name::node_id`.
    node_semaphores: DashMap<String, Arc<Semaphore>>,
    /// Tokens of in-flight runs keyed by trace id. Callers choose trace
    /// ids, so several runs may share one.
    cancellation_tokens: DashMap<String, Vec<(Uuid, CancellationToken)>>,
}

impl FlowEngine {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            backends: Arc::new(StateBackends::default()),
            config: EngineConfig::default(),
            node_semaphores: DashMap::new(),
            cancellation_tokens: DashMap::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_state_backends(mut self, backends: StateBackends) -> Self {
        self.backends = Arc::new(backends);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Resolve every node's transform, in document order.
    pub fn resolve(&self, plan: &ExecutionPlan) -> Result<Vec<Capability>, ExecutorError> {
        plan.flow()
            .nodes()
            .iter()
            .map(|node| {
                self.dispatcher
                    .resolve(&node.transform)
                    .map_err(|source| ExecutorError::Dispatch {
                        node_id: node.id.clone(),
                        source,
                    })
            })
            .collect()
    }

    /// Run a flow for one inbound request.
    ///
    /// `Err` is returned only when the run cannot start (plan, capability
    /// resolution, or context errors). Everything that happens once the run
    /// is under way is reported in the `RunResult`.
    pub async fn execute(&self, flow: &Arc<Flow>, request: RunRequest) -> Result<RunResult, ExecutorError> {
        let ctx = new_context(&request)?;
        ctx.require(flow.context_requirements())?;
        let plan = build_execution_plan(flow.clone())?;
        let capabilities = self.resolve(&plan)?;
        let deadline = request
            .deadline_ms
            .or(self.config.run_timeout_ms)
            .map(Duration::from_millis);
        Ok(self
            .drive(&plan, capabilities, Arc::new(ctx), request.inputs, deadline)
            .await)
    }

    /// Run a prepared plan with an existing context.
    ///
    /// Pre-run problems are reported as a failed `RunResult` in which no
    /// node executed.
    pub async fn run(&self, plan: &ExecutionPlan, ctx: Arc<Context>, inputs: Inputs) -> RunResult {
        let flow = plan.flow();
        if let Err(err) = ctx.require(flow.context_requirements()) {
            return not_started(&ctx, StructuredError::run(ErrorKind::MissingInput, err.to_string()));
        }
        match self.resolve(plan) {
            Ok(capabilities) => {
                let deadline = self.config.run_timeout_ms.map(Duration::from_millis);
                self.drive(plan, capabilities, ctx, inputs, deadline).await
            }
            Err(ExecutorError::Dispatch { node_id, source }) => not_started(
                &ctx,
                StructuredError::node(node_id, ErrorKind::Invocation, 0, source.to_string()),
            ),
            Err(err) => not_started(&ctx, StructuredError::run(ErrorKind::Invocation, err.to_string())),
        }
    }

    /// Cancel every active run with this trace id. Returns whether any was
    /// found.
    pub fn cancel(&self, trace_id: &str) -> bool {
        match self.cancellation_tokens.get(trace_id) {
            Some(runs) if !runs.is_empty() => {
                for (run_id, token) in runs.iter() {
                    tracing::info!(trace_id, %run_id, "cancelling run");
                    token.cancel();
                }
                true
            }
            _ => false,
        }
    }

    /// Number of runs currently executing.
    pub fn active_runs(&self) -> usize {
        self.cancellation_tokens.iter().map(|runs| runs.value().len()).sum()
    }

    fn node_limit(&self, flow: &Flow, node: &Node) -> Option<Arc<Semaphore>> {
        let max = node.runtime_policy.max_concurrency? as usize;
        let key = format!("{}::{}", flow.name(), node.id);
        Some(
            self.node_semaphores
                .entry(key)
                .or_insert_with(|| Arc::new(Semaphore::new(max)))
                .value()
                .clone(),
        )
    }

    /// The coordinator loop.
    async fn drive(
        &self,
        plan: &ExecutionPlan,
        capabilities: Vec<Capability>,
        ctx: Arc<Context>,
        inputs: Inputs,
        deadline: Option<Duration>,
    ) -> RunResult {
        let flow = plan.flow();
        let run_id = Uuid::now_v7();
        let trace_id = ctx.trace_id().to_string();
        let started = Instant::now();
        tracing::info!(flow = flow.name(), %run_id, %trace_id, "flow run started");

        let run_token = CancellationToken::new();
        let _registration = TokenRegistration::new(&self.cancellation_tokens, &trace_id, run_id, run_token.clone());
        let node_token = run_token.child_token();
        let global = Arc::new(Semaphore::new(self.config.max_parallel_nodes.max(1)));
        let deadline_at = deadline.map(|d| started + d);
        let states = StateManager::new(self.backends.clone());

        let mut run = RunState::new(plan, ctx.clone());
        run.bind_inputs(&inputs);

        let mut tasks: JoinSet<NodeCompletion> = JoinSet::new();

        loop {
            if !run.is_stopping() {
                while let Some((_, index)) = run.ready.pop_first() {
                    let Some(node_inputs) = run.gather(index) else {
                        run.skip(index);
                        continue;
                    };
                    let node = plan.node(index);
                    tracing::debug!(node_id = %node.id, %trace_id, "dispatching node");
                    let task = NodeTask {
                        index,
                        flow: flow.clone(),
                        capability: capabilities[index].clone(),
                        inputs: node_inputs,
                        ctx: ctx.clone(),
                        states: states.clone(),
                        dispatcher: self.dispatcher.clone(),
                        schemas: plan.schemas().clone(),
                        backoff: self.config.backoff.clone(),
                        token: node_token.clone(),
                        global: global.clone(),
                        node_limit: self.node_limit(flow, node),
                    };
                    tasks.spawn(task.run());
                }
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = run_token.cancelled(), if !run.aborted => {
                    run.abort(StructuredError::run(ErrorKind::Cancelled, "run cancelled"));
                    node_token.cancel();
                }
                _ = tokio::time::sleep_until(deadline_at.unwrap_or(started)), if deadline_at.is_some() && !run.aborted => {
                    let limit = deadline.map_or(0, |d| d.as_millis());
                    run.abort(StructuredError::run(
                        ErrorKind::Timeout,
                        format!("run deadline of {limit}ms exceeded"),
                    ));
                    node_token.cancel();
                }
                joined = tasks.join_next() => {
                    match joined {
                        Some(Ok(completion)) => run.complete(completion),
                        // Node tasks catch capability panics, so this is an engine bug.
                        Some(Err(err)) => run.fail(StructuredError::run(
                            ErrorKind::Invocation,
                            format!("node task failed: {err}"),
                        )),
                        None => {}
                    }
                    if run.is_stopping() {
                        node_token.cancel();
                    }
                }
            }
        }

        let result = run.finish(run_id);
        tracing::info!(
            flow = flow.name(),
            %run_id,
            %trace_id,
            status = %result.status,
            duration_ms = started.elapsed().as_millis() as u64,
            "flow run finished"
        );
        result
    }
}

/// Keeps a run token reachable by trace id for the lifetime of a run.
struct TokenRegistration<'a> {
    tokens: &'a DashMap<String, Vec<(Uuid, CancellationToken)>>,
    trace_id: String,
    run_id: Uuid,
}

impl<'a> TokenRegistration<'a> {
    fn new(
        tokens: &'a DashMap<String, Vec<(Uuid, CancellationToken)>>,
        trace_id: &str,
        run_id: Uuid,
        token: CancellationToken,
    ) -> Self {
        tokens.entry(trace_id.to_string()).or_default().push((run_id, token));
        Self {
            tokens,
            trace_id: trace_id.to_string(),
            run_id,
        }
    }
}

impl Drop for TokenRegistration<'_> {
    fn drop(&mut self) {
        if let Some(mut runs) = self.tokens.get_mut(&self.trace_id) {
            runs.retain(|(id, _)| *id != self.run_id);
        }
        self.tokens.remove_if(&self.trace_id, |_, runs| runs.is_empty());
    }
}

fn not_started(ctx: &Context, error: StructuredError) -> RunResult {
    tracing::warn!(trace_id = ctx.trace_id(), %error, "flow run not started");
    RunResult {
        run_id: Uuid::now_v7(),
        trace_id: ctx.trace_id().to_string(),
        status: RunStatus::Failed,
        outputs: BTreeMap::new(),
        boundary_outputs: BTreeMap::new(),
        error: Some(error),
        trace: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Coordinator state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum EdgeState {
    Pending,
    Empty,
    Delivered(Value),
}

struct RunState<'p> {
    plan: &'p ExecutionPlan,
    ctx: Arc<Context>,
    edges: Vec<EdgeState>,
    /// Unresolved incoming edges per node.
    waiting: Vec<usize>,
    /// Ready nodes as (layer, index).
    ready: BTreeSet<(usize, usize)>,
    outputs: BTreeMap<String, Value>,
    trace: Vec<NodeExecutionRecord>,
    failure: Option<StructuredError>,
    aborted: bool,
}

impl<'p> RunState<'p> {
    fn new(plan: &'p ExecutionPlan, ctx: Arc<Context>) -> Self {
        let node_count = plan.flow().nodes().len();
        let waiting: Vec<usize> = (0..node_count).map(|i| plan.incoming(i).len()).collect();
        let ready = waiting
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == 0)
            .map(|(i, _)| (plan.layer_of_index(i), i))
            .collect();
        Self {
            plan,
            ctx,
            edges: vec![EdgeState::Pending; plan.flow().edges().len()],
            waiting,
            ready,
            outputs: BTreeMap::new(),
            trace: Vec::new(),
            failure: None,
            aborted: false,
        }
    }

    fn is_stopping(&self) -> bool {
        self.aborted || self.failure.is_some()
    }

    /// Record the first unrouted failure; later ones are kept in the trace.
    fn fail(&mut self, error: StructuredError) {
        if self.failure.is_none() {
            tracing::error!(trace_id = self.ctx.trace_id(), %error, "flow run failing");
            self.failure = Some(error);
        }
    }

    fn abort(&mut self, error: StructuredError) {
        tracing::warn!(trace_id = self.ctx.trace_id(), %error, "flow run aborting");
        self.aborted = true;
        self.failure.get_or_insert(error);
    }

    /// Resolve the `_input` edges from the request's inputs.
    fn bind_inputs(&mut self, inputs: &Inputs) {
        let plan = self.plan;
        let flow = plan.flow();
        for &e in plan.input_edges() {
            let edge = &flow.edges()[e];
            let resolved = match inputs.get(&edge.source.port) {
                Some(value) => self.resolve_edge(e, value.clone(), value),
                None => {
                    let required = edge
                        .target
                        .node_id()
                        .and_then(|id| flow.node(id))
                        .and_then(|node| node.input_port(&edge.target.port))
                        .is_some_and(|port| !port.optional);
                    if required {
                        Err(StructuredError::run(
                            ErrorKind::MissingInput,
                            format!("required input '{}' was not provided", edge.source.port),
                        ))
                    } else {
                        Ok(EdgeState::Empty)
                    }
                }
            };
            match resolved {
                Ok(state) => self.settle(e, state),
                Err(error) => {
                    self.fail(error);
                    self.settle(e, EdgeState::Empty);
                }
            }
        }
    }

    fn settle(&mut self, e: usize, state: EdgeState) {
        self.edges[e] = state;
        let flow = self.plan.flow();
        let target = flow.edges()[e].target.node_id().and_then(|id| flow.node_index(id));
        if let Some(t) = target {
            self.waiting[t] = self.waiting[t].saturating_sub(1);
            if self.waiting[t] == 0 {
                self.ready.insert((self.plan.layer_of_index(t), t));
            }
        }
    }

    /// Collect a ready node's inputs, or `None` when a required port got no
    /// value. For each port the first delivered edge in document order wins.
    fn gather(&self, index: usize) -> Option<Inputs> {
        let flow = self.plan.flow();
        let mut inputs = Inputs::new();
        for &e in self.plan.incoming(index) {
            if let EdgeState::Delivered(value) = &self.edges[e] {
                inputs
                    .entry(flow.edges()[e].target.port.clone())
                    .or_insert_with(|| value.clone());
            }
        }
        let node = self.plan.node(index);
        node.input_ports
            .iter()
            .all(|p| p.optional || inputs.contains_key(&p.name))
            .then_some(inputs)
    }

    fn skip(&mut self, index: usize) {
        let plan = self.plan;
        let node = plan.node(index);
        tracing::debug!(node_id = %node.id, "skipping node, required input received no value");
        self.trace.push(NodeExecutionRecord::skipped(node.id.clone()));
        for &e in plan.outgoing(index) {
            self.settle(e, EdgeState::Empty);
        }
    }

    fn complete(&mut self, completion: NodeCompletion) {
        let plan = self.plan;
        let node = plan.node(completion.index);
        let mut record = NodeExecutionRecord {
            node_id: node.id.clone(),
            status: NodeStatus::Succeeded,
            attempts: completion.attempts,
            started_at: completion.started_at,
            duration_ms: completion.duration_ms,
            error: None,
        };

        match completion.outcome {
            NodeOutcome::Succeeded(output) => {
                self.outputs.insert(node.id.clone(), output.clone());
                self.trace.push(record);
                if self.is_stopping() {
                    return;
                }
                for &e in plan.outgoing(completion.index) {
                    let port = &plan.flow().edges()[e].source.port;
                    let resolved = match port_value(node, &output, port) {
                        Some(value) if !node.is_error_port(port) => self.resolve_edge(e, value, &output),
                        _ => Ok(EdgeState::Empty),
                    };
                    match resolved {
                        Ok(state) => self.settle(e, state),
                        Err(error) => return self.fail(error),
                    }
                }
            }
            NodeOutcome::Failed(error) => {
                let error_port = node.error_port.as_ref().filter(|port| {
                    plan.outgoing(completion.index)
                        .iter()
                        .any(|&e| plan.flow().edges()[e].source.port == port.name)
                });
                match error_port {
                    Some(port) if !self.is_stopping() => {
                        tracing::warn!(node_id = %node.id, %error, "node failed, routing to error port");
                        let value = error.to_port_value(port.port_type);
                        record.status = NodeStatus::Routed;
                        record.error = Some(error);
                        self.trace.push(record);
                        for &e in plan.outgoing(completion.index) {
                            let resolved = if node.is_error_port(&plan.flow().edges()[e].source.port) {
                                self.resolve_edge(e, value.clone(), &value)
                            } else {
                                Ok(EdgeState::Empty)
                            };
                            match resolved {
                                Ok(state) => self.settle(e, state),
                                Err(error) => return self.fail(error),
                            }
                        }
                    }
                    _ => {
                        record.status = NodeStatus::Failed;
                        record.error = Some(error.clone());
                        self.trace.push(record);
                        self.fail(error);
                    }
                }
            }
            NodeOutcome::Cancelled => {
                record.status = NodeStatus::Cancelled;
                record.error = Some(StructuredError::node(
                    node.id.clone(),
                    ErrorKind::Cancelled,
                    completion.attempts,
                    "cancelled by run",
                ));
                self.trace.push(record);
            }
        }
    }

    /// Evaluate an edge's condition and inline transform, apply its
    /// coercion, and type-check the delivered value.
    fn resolve_edge(&self, e: usize, value: Value, output: &Value) -> Result<EdgeState, StructuredError> {
        let flow = self.plan.flow();
        let edge = &flow.edges()[e];
        let mut value = value;

        if edge.condition.is_some() || edge.inline_transform.is_some() {
            let evaluator = EdgeEvaluator::new();
            let scope = EdgeEvaluator::edge_scope(&edge.source.port, &value, output, &self.ctx);
            if let Some(condition) = &edge.condition {
                let pass = evaluator.evaluate_bool(condition, &scope).map_err(|err| {
                    self.edge_error(e, ErrorKind::Expression, format!("condition '{condition}': {err}"))
                })?;
                if !pass {
                    tracing::debug!(edge = e, %condition, "edge condition is false");
                    return Ok(EdgeState::Empty);
                }
            }
            if let Some(expression) = &edge.inline_transform {
                value = evaluator.evaluate_value(expression, &scope).map_err(|err| {
                    self.edge_error(e, ErrorKind::Expression, format!("transform '{expression}': {err}"))
                })?;
            }
        }

        if value.is_null() {
            return Ok(EdgeState::Empty);
        }
        let value = edge
            .coercion
            .apply(value)
            .map_err(|reason| self.edge_error(e, ErrorKind::Invocation, reason))?;

        let target = edge.target.node_id().and_then(|id| flow.node_index(id));
        if let Some(index) = target {
            if let Some(port) = flow.nodes()[index].input_port(&edge.target.port) {
                check_port_value(port, self.plan.schema(index, &port.name), &value)
                    .map_err(|reason| self.edge_error(e, ErrorKind::Invocation, reason))?;
            }
        }
        Ok(EdgeState::Delivered(value))
    }

    fn edge_error(&self, e: usize, kind: ErrorKind, reason: String) -> StructuredError {
        let edge = &self.plan.flow().edges()[e];
        let message = format!("edge {e} ({} -> {}): {reason}", edge.source, edge.target);
        match edge.target.node_id().or(edge.source.node_id()) {
            Some(id) => StructuredError::node(id, kind, 0, message),
            None => StructuredError::run(kind, message),
        }
    }

    fn finish(self, run_id: Uuid) -> RunResult {
        let flow = self.plan.flow();
        let mut boundary_outputs = BTreeMap::new();
        for &e in self.plan.output_edges() {
            if let EdgeState::Delivered(value) = &self.edges[e] {
                boundary_outputs
                    .entry(flow.edges()[e].target.port.clone())
                    .or_insert_with(|| value.clone());
            }
        }

        let (status, error) = if self.aborted {
            (RunStatus::Aborted, self.failure)
        } else if let Some(error) = self.failure {
            (RunStatus::Failed, Some(error))
        } else if !self.plan.output_edges().is_empty() && boundary_outputs.is_empty() {
            (
                RunStatus::Failed,
                Some(StructuredError::run(
                    ErrorKind::NoOutput,
                    "no value reached _output",
                )),
            )
        } else {
            (RunStatus::Succeeded, None)
        };

        RunResult {
            run_id,
            trace_id: self.ctx.trace_id().to_string(),
            status,
            outputs: self.outputs,
            boundary_outputs,
            error,
            trace: self.trace,
        }
    }
}

/// The value a node produced on `port`. A single output port carries the
/// whole value; several ports read from an object keyed by port name.
fn port_value(node: &Node, output: &Value, port: &str) -> Option<Value> {
    match node.output_ports.as_slice() {
        [only] => (only.name == port).then(|| output.clone()),
        _ => output.get(port).cloned(),
    }
}

fn check_port_value(port: &Port, schema: Option<&CompiledSchema>, value: &Value) -> Result<(), String> {
    if !port.port_type.accepts(value) {
        return Err(format!(
            "port '{}' expects {}, got {}",
            port.name,
            port.port_type,
            json_kind(value)
        ));
    }
    if let Some(schema) = schema {
        schema
            .check(value)
            .map_err(|reason| format!("port '{}': {reason}", port.name))?;
    }
    Ok(())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Node task
// ---------------------------------------------------------------------------

enum NodeOutcome {
    Succeeded(Value),
    Failed(StructuredError),
    Cancelled,
}

struct NodeCompletion {
    index: usize,
    outcome: NodeOutcome,
    attempts: u32,
    started_at: Option<DateTime<Utc>>,
    duration_ms: u64,
}

/// Everything one node execution needs, owned so it can run on the
/// `JoinSet`.
struct NodeTask {
    index: usize,
    flow: Arc<Flow>,
    capability: Capability,
    inputs: Inputs,
    ctx: Arc<Context>,
    states: StateManager,
    dispatcher: Arc<Dispatcher>,
    schemas: Arc<PortSchemas>,
    backoff: BackoffPolicy,
    token: CancellationToken,
    global: Arc<Semaphore>,
    node_limit: Option<Arc<Semaphore>>,
}

impl NodeTask {
    async fn run(self) -> NodeCompletion {
        let node = &self.flow.nodes()[self.index];
        let queued = Instant::now();

        let permits = tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            permits = acquire(&self.global, self.node_limit.as_ref()) => permits,
        };
        let Some(_permits) = permits else {
            return self.completion(NodeOutcome::Cancelled, 0, None, queued);
        };

        let started = Instant::now();
        let started_at = Some(Utc::now());
        let policy = &node.runtime_policy;

        let state = match self.states.scoped(node, &self.ctx, &self.inputs) {
            Ok(state) => state,
            Err(err) => {
                let error = StructuredError::node(node.id.clone(), ErrorKind::Invocation, 1, err.to_string());
                return self.completion(NodeOutcome::Failed(error), 1, started_at, started);
            }
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            tracing::debug!(node_id = %node.id, attempt, "node attempt started");

            let invocation = self
                .dispatcher
                .invoke(&self.capability, &self.inputs, &self.ctx, state.as_ref());
            let result = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    return self.completion(NodeOutcome::Cancelled, attempt, started_at, started);
                }
                result = tokio::time::timeout(policy.timeout(), invocation) => result,
            };

            let (kind, message) = match result {
                Ok(Ok(value)) => match validate_output(node, self.index, &self.schemas, &value) {
                    Ok(()) => {
                        tracing::debug!(node_id = %node.id, attempt, "node succeeded");
                        return self.completion(NodeOutcome::Succeeded(value), attempt, started_at, started);
                    }
                    Err(reason) => (ErrorKind::OutputSchema, reason),
                },
                Ok(Err(err)) => (err.kind(), err.to_string()),
                Err(_) => (
                    ErrorKind::Timeout,
                    format!("attempt timed out after {}ms", policy.timeout_ms),
                ),
            };
            tracing::warn!(node_id = %node.id, attempt, %kind, error = %message, "node attempt failed");

            if !RetryHandler::should_retry(policy, attempt, kind) {
                let error = StructuredError::node(node.id.clone(), kind, attempt, message);
                return self.completion(NodeOutcome::Failed(error), attempt, started_at, started);
            }

            let delay = RetryHandler::backoff_delay(&self.backoff, policy.retry_backoff(), attempt);
            tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    return self.completion(NodeOutcome::Cancelled, attempt, started_at, started);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn completion(
        &self,
        outcome: NodeOutcome,
        attempts: u32,
        started_at: Option<DateTime<Utc>>,
        started: Instant,
    ) -> NodeCompletion {
        NodeCompletion {
            index: self.index,
            outcome,
            attempts,
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Take the node's own permit before a global one so a node waiting on its
/// limit does not hold a global slot. `None` if a semaphore was closed.
async fn acquire(
    global: &Arc<Semaphore>,
    node_limit: Option<&Arc<Semaphore>>,
) -> Option<(Option<OwnedSemaphorePermit>, OwnedSemaphorePermit)> {
    let node_permit = match node_limit {
        Some(limit) => Some(limit.clone().acquire_owned().await.ok()?),
        None => None,
    };
    let global_permit = global.clone().acquire_owned().await.ok()?;
    Some((node_permit, global_permit))
}

/// Check a produced value against the node's output ports.
fn validate_output(node: &Node, index: usize, schemas: &PortSchemas, value: &Value) -> Result<(), String> {
    let check = |port: &Port, v: &Value| -> Result<(), String> {
        if v.is_null() && port.optional {
            return Ok(());
        }
        let schema = schemas.get(&(index, port.name.clone()));
        check_port_value(port, schema, v)
    };
    match node.output_ports.as_slice() {
        [] => Ok(()),
        [port] => check(port, value),
        ports => {
            let Some(fields) = value.as_object() else {
                return Err(format!(
                    "expected an object keyed by output port, got {}",
                    json_kind(value)
                ));
            };
            for port in ports {
                match fields.get(&port.name) {
                    Some(v) => check(port, v)?,
                    None if port.optional => {}
                    None => return Err(format!("missing output port '{}'", port.name)),
                }
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use agentflow_types::error::StoreError;
    use serde_json::json;
    use tokio::sync::Barrier;

    use crate::flow::definition::compile_flow_yaml;
    use crate::flow::dispatch::{CodeRuntime, Operation, OperationError, OperationRegistry};
    use crate::flow::state::ScopedState;
    use crate::storage::state_backend::StateBackend;

    fn compile(yaml: &str) -> Arc<Flow> {
        Arc::new(compile_flow_yaml(yaml).unwrap())
    }

    fn engine(registry: OperationRegistry) -> FlowEngine {
        FlowEngine::new(Dispatcher::new(registry))
    }

    /// Waits until every fetch has started, so it only completes when the
    /// fetches run concurrently.
    struct BarrierFetch {
        barrier: Arc<Barrier>,
        rows: Value,
    }

    impl Operation for BarrierFetch {
        async fn call(&self, _args: &Value, _inputs: &Inputs, _ctx: &Context) -> Result<Value, OperationError> {
            self.barrier.wait().await;
            Ok(self.rows.clone())
        }
    }

    /// Never finishes within any test timeout.
    struct SlowOp {
        attempts: Arc<AtomicU32>,
    }

    impl Operation for SlowOp {
        async fn call(&self, _args: &Value, _inputs: &Inputs, _ctx: &Context) -> Result<Value, OperationError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(json!("late"))
        }
    }

    /// Records the peak number of concurrent calls.
    #[derive(Clone, Default)]
    struct Tracked {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Operation for Tracked {
        async fn call(&self, _args: &Value, _inputs: &Inputs, _ctx: &Context) -> Result<Value, OperationError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(json!("done"))
        }
    }

    /// Code runtime with a few built-in bodies that exercise state.
    struct TestRuntime;

    impl CodeRuntime for TestRuntime {
        async fn run(
            &self,
            body: &str,
            _inputs: &Inputs,
            _ctx: &Context,
            state: Option<&ScopedState>,
        ) -> Result<Value, OperationError> {
            let state = state.ok_or_else(|| OperationError::failed("no state bound"))?;
            let store_err = |e: StoreError| OperationError::failed(e.to_string());
            match body {
                "count" => {
                    let n = state.get(json!(0)).await.map_err(store_err)?.as_u64().unwrap_or(0) + 1;
                    state.set(json!(n)).await.map_err(store_err)?;
                    Ok(json!(n))
                }
                "write" => {
                    state.set(json!("hello")).await.map_err(store_err)?;
                    Ok(json!("written"))
                }
                "read" => state.get(Value::Null).await.map_err(store_err),
                other => Err(OperationError::failed(format!("unknown body '{other}'"))),
            }
        }
    }

    #[derive(Default)]
    struct MemBackend {
        entries: DashMap<String, Value>,
    }

    impl StateBackend for MemBackend {
        fn name(&self) -> &str {
            "mem"
        }

        async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
            Ok(self.entries.get(key).map(|v| v.value().clone()))
        }

        async fn set(&self, key: &str, value: &Value, _ttl: Option<Duration>) -> Result<(), StoreError> {
            self.entries.insert(key.to_string(), value.clone());
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.entries.remove(key);
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Parallel fetch then combine
    // -----------------------------------------------------------------------

    const PARALLEL: &str = r#"
version: "1.0"
metadata: { name: parallel_fetch }
nodes:
  fetch_a:
    input_ports: [{ name: q, type: string }]
    output_ports: [{ name: rows, type: table }]
    transform: { kind: declarative, op_name: fetch_a }
  fetch_b:
    input_ports: [{ name: q, type: string }]
    output_ports: [{ name: rows, type: table }]
    transform: { kind: declarative, op_name: fetch_b }
  combine:
    input_ports:
      - { name: left, type: array }
      - { name: right, type: array }
    output_ports: [{ name: summary, type: string }]
    transform: { kind: declarative, op_name: merge }
edges:
  - { from: _input.question, to: fetch_a.q }
  - { from: _input.question, to: fetch_b.q }
  - { from: fetch_a.rows, to: combine.left }
  - { from: fetch_b.rows, to: combine.right }
  - { from: combine.summary, to: _output.answer }
"#;

    fn parallel_registry() -> OperationRegistry {
        let barrier = Arc::new(Barrier::new(2));
        let mut registry = OperationRegistry::new();
        registry.register(
            "fetch_a",
            BarrierFetch {
                barrier: barrier.clone(),
                rows: json!([{ "id": 1 }]),
            },
        );
        registry.register(
            "fetch_b",
            BarrierFetch {
                barrier,
                rows: json!([{ "id": 2 }, { "id": 3 }]),
            },
        );
        registry.register_fn("merge", |_args, inputs, _ctx| {
            let count = |port: &str| inputs[port].as_array().map_or(0, Vec::len);
            Ok(json!(format!("{} + {} rows", count("left"), count("right"))))
        });
        registry
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_fetch_then_combine() {
        let flow = compile(PARALLEL);
        let engine = engine(parallel_registry());
        let request = RunRequest::new().with_input("question", json!("q"));

        let result = engine.execute(&flow, request).await.unwrap();
        assert!(result.is_success(), "run failed: {:?}", result.error);
        assert_eq!(result.boundary_outputs["answer"], json!("1 + 2 rows"));
        assert_eq!(result.trace.len(), 3);
        assert_eq!(result.trace[2].node_id, "combine");
        assert!(result.trace.iter().all(|r| r.status == NodeStatus::Succeeded && r.attempts == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_outputs_are_deterministic() {
        let flow = compile(PARALLEL);
        let first = engine(parallel_registry())
            .execute(&flow, RunRequest::new().with_input("question", json!("q")))
            .await
            .unwrap();
        let second = engine(parallel_registry())
            .execute(&flow, RunRequest::new().with_input("question", json!("q")))
            .await
            .unwrap();
        assert_eq!(first.outputs, second.outputs);
        assert_eq!(first.boundary_outputs, second.boundary_outputs);
        assert_ne!(first.run_id, second.run_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_parallelism_bound() {
        let flow = compile(
            r#"
version: "1.0"
nodes:
  one: { output_ports: [{ name: out, type: string }], transform: { kind: declarative, op_name: work } }
  two: { output_ports: [{ name: out, type: string }], transform: { kind: declarative, op_name: work } }
edges:
  - { from: one.out, to: _output.one }
  - { from: two.out, to: _output.two }
"#,
        );
        let tracked = Tracked::default();
        let mut registry = OperationRegistry::new();
        registry.register("work", tracked.clone());
        let engine = engine(registry).with_config(EngineConfig {
            max_parallel_nodes: 1,
            ..Default::default()
        });

        let started = Instant::now();
        let result = engine.execute(&flow, RunRequest::new()).await.unwrap();
        assert!(result.is_success());
        assert_eq!(tracked.peak.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_concurrency_shared_across_runs() {
        let flow = compile(
            r#"
version: "1.0"
metadata: { name: limited }
nodes:
  call:
    output_ports: [{ name: out, type: string }]
    transform: { kind: declarative, op_name: work }
    runtime_policy: { max_concurrency: 1 }
edges:
  - { from: call.out, to: _output.out }
"#,
        );
        let tracked = Tracked::default();
        let mut registry = OperationRegistry::new();
        registry.register("work", tracked.clone());
        let engine = engine(registry);

        let (a, b) = tokio::join!(
            engine.execute(&flow, RunRequest::new()),
            engine.execute(&flow, RunRequest::new())
        );
        assert!(a.unwrap().is_success());
        assert!(b.unwrap().is_success());
        assert_eq!(tracked.peak.load(Ordering::SeqCst), 1);
    }

    // -----------------------------------------------------------------------
    // Timeouts and retries
    // -----------------------------------------------------------------------

    const SLOW: &str = r#"
version: "1.0"
nodes:
  call:
    input_ports: [{ name: q, type: string }]
    output_ports: [{ name: out, type: string }]
    transform: { kind: declarative, op_name: slow }
    runtime_policy: { timeout_ms: 100, retries: 3, retry_backoff_ms: 50 }
edges:
  - { from: _input.q, to: call.q }
  - { from: call.out, to: _output.answer }
"#;

    fn slow_registry(attempts: Arc<AtomicU32>) -> OperationRegistry {
        let mut registry = OperationRegistry::new();
        registry.register("slow", SlowOp { attempts });
        registry
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_retry_with_fixed_backoff() {
        let attempts = Arc::new(AtomicU32::new(0));
        let engine = engine(slow_registry(attempts.clone()));

        let started = Instant::now();
        let result = engine
            .execute(&compile(SLOW), RunRequest::new().with_input("q", json!("x")))
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(result.status, RunStatus::Failed);
        let error = result.error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::Timeout);
        assert_eq!(error.node_id.as_deref(), Some("call"));
        assert_eq!(error.attempts, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(result.record("call").unwrap().status, NodeStatus::Failed);
        // 3 x 100ms attempts + 2 x 50ms backoff
        assert!(elapsed >= Duration::from_millis(400), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(420), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_backoff_override() {
        let attempts = Arc::new(AtomicU32::new(0));
        let engine = engine(slow_registry(attempts)).with_config(EngineConfig {
            backoff: BackoffPolicy::Exponential {
                factor: 2.0,
                max_ms: 1_000,
            },
            ..Default::default()
        });

        let started = Instant::now();
        let result = engine
            .execute(&compile(SLOW), RunRequest::new().with_input("q", json!("x")))
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(result.status, RunStatus::Failed);
        // 3 x 100ms attempts + 50ms + 100ms backoff
        assert!(elapsed >= Duration::from_millis(450), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(470), "elapsed {elapsed:?}");
    }

    // -----------------------------------------------------------------------
    // Error routing
    // -----------------------------------------------------------------------

    const ROUTED: &str = r#"
version: "1.0"
nodes:
  risky:
    input_ports: [{ name: q, type: string }]
    output_ports: [{ name: out, type: string }]
    error_port: { name: error, type: object }
    transform: { kind: declarative, op_name: flaky }
  fallback:
    input_ports: [{ name: err, type: object }]
    output_ports: [{ name: out, type: string }]
    transform: { kind: declarative, op_name: apologize }
edges:
  - { from: _input.q, to: risky.q }
  - { from: risky.out, to: _output.answer }
  - { from: risky.error, to: fallback.err }
  - { from: fallback.out, to: _output.answer }
"#;

    fn routed_registry() -> OperationRegistry {
        let mut registry = OperationRegistry::new();
        registry.register_fn("flaky", |_args, _inputs, _ctx| {
            Err(OperationError::failed("upstream unavailable"))
        });
        registry.register_fn("apologize", |_args, inputs, _ctx| {
            let message = inputs["err"]["message"].as_str().unwrap_or("?");
            Ok(json!(format!("sorry: {message}")))
        });
        registry
    }

    #[tokio::test]
    async fn test_error_port_routes_to_fallback() {
        let result = engine(routed_registry())
            .execute(&compile(ROUTED), RunRequest::new().with_input("q", json!("hi")))
            .await
            .unwrap();

        assert!(result.is_success(), "run failed: {:?}", result.error);
        assert_eq!(result.boundary_outputs["answer"], json!("sorry: upstream unavailable"));

        let risky = result.record("risky").unwrap();
        assert_eq!(risky.status, NodeStatus::Routed);
        assert_eq!(risky.attempts, 1);
        assert_eq!(risky.error.as_ref().unwrap().kind, ErrorKind::Invocation);
        assert!(!result.outputs.contains_key("risky"));
        assert_eq!(result.record("fallback").unwrap().status, NodeStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrouted_failure_cancels_siblings() {
        let flow = compile(
            r#"
version: "1.0"
nodes:
  boom:
    output_ports: [{ name: out, type: string }]
    transform: { kind: declarative, op_name: flaky }
  hang:
    output_ports: [{ name: out, type: string }]
    transform: { kind: declarative, op_name: slow }
    runtime_policy: { retries: 3 }
edges:
  - { from: boom.out, to: _output.a }
  - { from: hang.out, to: _output.b }
"#,
        );
        let mut registry = routed_registry();
        registry.register(
            "slow",
            SlowOp {
                attempts: Arc::new(AtomicU32::new(0)),
            },
        );

        let started = Instant::now();
        let result = engine(registry).execute(&flow, RunRequest::new()).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        let error = result.error.as_ref().unwrap();
        assert_eq!(error.node_id.as_deref(), Some("boom"));
        assert_eq!(error.kind, ErrorKind::Invocation);
        assert_eq!(result.record("hang").unwrap().status, NodeStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    // -----------------------------------------------------------------------
    // Scoped state
    // -----------------------------------------------------------------------

    const COUNTER: &str = r#"
version: "1.0"
context: { requires: [session_id] }
nodes:
  counter:
    output_ports: [{ name: count, type: number }]
    transform: { kind: code, body: count }
    state_config: { scope: session, key_template: "visits_{session_id}", ttl_secs: 3600 }
edges:
  - { from: counter.count, to: _output.count }
"#;

    fn session(id: &str) -> RunRequest {
        RunRequest::new().with_field("session_id", json!(id))
    }

    #[tokio::test]
    async fn test_session_state_persists_across_runs() {
        let flow = compile(COUNTER);
        let engine = FlowEngine::new(Dispatcher::default().with_code_runtime(TestRuntime))
            .with_state_backends(StateBackends::new().with_default(MemBackend::default()));

        let run = |id: &'static str| {
            let engine = &engine;
            let flow = &flow;
            async move { engine.execute(flow, session(id)).await.unwrap() }
        };
        assert_eq!(run("s1").await.boundary_outputs["count"], json!(1));
        assert_eq!(run("s1").await.boundary_outputs["count"], json!(2));
        assert_eq!(run("s2").await.boundary_outputs["count"], json!(1));
    }

    #[tokio::test]
    async fn test_missing_required_context_prevents_run() {
        let engine = FlowEngine::new(Dispatcher::default().with_code_runtime(TestRuntime))
            .with_state_backends(StateBackends::new().with_default(MemBackend::default()));
        let err = engine
            .execute(&compile(COUNTER), RunRequest::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Context(ContextError::MissingField(f)) if f == "session_id"));
    }

    #[tokio::test]
    async fn test_request_state_shared_within_run_only() {
        let flow = compile(
            r#"
version: "1.0"
nodes:
  writer:
    output_ports: [{ name: done, type: string }]
    transform: { kind: code, body: write }
    state_config: { scope: request, key_template: "shared" }
  reader:
    input_ports: [{ name: after, type: string }]
    output_ports: [{ name: value, type: string }]
    transform: { kind: code, body: read }
    state_config: { scope: request, key_template: "shared" }
  counter:
    output_ports: [{ name: n, type: number }]
    transform: { kind: code, body: count }
    state_config: { scope: request }
edges:
  - { from: writer.done, to: reader.after }
  - { from: reader.value, to: _output.value }
  - { from: counter.n, to: _output.n }
"#,
        );
        let engine = FlowEngine::new(Dispatcher::default().with_code_runtime(TestRuntime));

        for _ in 0..2 {
            let result = engine.execute(&flow, RunRequest::new()).await.unwrap();
            assert!(result.is_success(), "run failed: {:?}", result.error);
            assert_eq!(result.boundary_outputs["value"], json!("hello"));
            assert_eq!(result.boundary_outputs["n"], json!(1));
        }
    }

    // -----------------------------------------------------------------------
    // Conditional edges
    // -----------------------------------------------------------------------

    const TRIAGE: &str = r#"
version: "1.0"
nodes:
  classify:
    input_ports: [{ name: text, type: string }]
    output_ports: [{ name: score, type: number }]
    transform: { kind: declarative, op_name: score }
  escalate:
    input_ports: [{ name: score, type: number }]
    output_ports: [{ name: ticket, type: string }]
    transform: { kind: declarative, op_name: ticket }
edges:
  - { from: _input.text, to: classify.text }
  - { from: classify.score, to: escalate.score, condition: "score > 0.7" }
  - { from: classify.score, to: _output.score }
  - { from: escalate.ticket, to: _output.ticket }
"#;

    fn triage_registry() -> OperationRegistry {
        let mut registry = OperationRegistry::new();
        registry.register_fn("score", |_args, inputs, _ctx| {
            let urgent = inputs["text"].as_str().is_some_and(|t| t.contains("urgent"));
            Ok(json!(if urgent { 0.9 } else { 0.3 }))
        });
        registry.register_fn("ticket", |_args, inputs, _ctx| {
            Ok(json!(format!("ticket at {}", inputs["score"])))
        });
        registry
    }

    #[tokio::test]
    async fn test_false_condition_skips_node() {
        let result = engine(triage_registry())
            .execute(&compile(TRIAGE), RunRequest::new().with_input("text", json!("hello")))
            .await
            .unwrap();

        assert!(result.is_success(), "run failed: {:?}", result.error);
        assert_eq!(result.boundary_outputs.get("score"), Some(&json!(0.3)));
        assert!(!result.boundary_outputs.contains_key("ticket"));
        assert_eq!(result.record("escalate").unwrap().status, NodeStatus::Skipped);
        assert!(!result.outputs.contains_key("escalate"));
    }

    #[tokio::test]
    async fn test_true_condition_delivers() {
        let result = engine(triage_registry())
            .execute(&compile(TRIAGE), RunRequest::new().with_input("text", json!("urgent!")))
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.boundary_outputs["ticket"], json!("ticket at 0.9"));
    }

    #[tokio::test]
    async fn test_no_output_when_every_path_is_empty() {
        let yaml = TRIAGE.replace("  - { from: classify.score, to: _output.score }\n", "");
        let result = engine(triage_registry())
            .execute(&compile(&yaml), RunRequest::new().with_input("text", json!("hello")))
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::NoOutput);
    }

    #[tokio::test]
    async fn test_condition_error_fails_run() {
        let yaml = TRIAGE.replace("score > 0.7", "score >");
        let result = engine(triage_registry())
            .execute(&compile(&yaml), RunRequest::new().with_input("text", json!("hello")))
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Expression);
        assert!(result.record("escalate").is_none());
    }

    #[tokio::test]
    async fn test_inline_transform_maps_value() {
        let yaml = TRIAGE.replace(
            "{ from: classify.score, to: _output.score }",
            "{ from: classify.score, to: _output.score, inline_transform: \"score * 2\" }",
        );
        let result = engine(triage_registry())
            .execute(&compile(&yaml), RunRequest::new().with_input("text", json!("hello")))
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.boundary_outputs["score"].as_f64(), Some(0.6));
    }

    // -----------------------------------------------------------------------
    // Inputs, outputs and run lifecycle
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_missing_required_input_fails_before_dispatch() {
        let result = engine(triage_registry())
            .execute(&compile(TRIAGE), RunRequest::new())
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::MissingInput);
        assert!(result.trace.is_empty());
    }

    #[tokio::test]
    async fn test_input_type_checked_on_delivery() {
        let result = engine(triage_registry())
            .execute(&compile(TRIAGE), RunRequest::new().with_input("text", json!(42)))
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        let error = result.error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::Invocation);
        assert_eq!(error.node_id.as_deref(), Some("classify"));
    }

    #[tokio::test]
    async fn test_multi_port_output_must_cover_required_ports() {
        let flow = compile(
            r#"
version: "1.0"
nodes:
  split:
    output_ports:
      - { name: head, type: string }
      - { name: tail, type: array }
    transform: { kind: declarative, op_name: partial }
edges:
  - { from: split.head, to: _output.head }
"#,
        );
        let mut registry = OperationRegistry::new();
        registry.register_fn("partial", |_args, _inputs, _ctx| Ok(json!({ "head": "h" })));
        let result = engine(registry).execute(&flow, RunRequest::new()).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        let error = result.error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::OutputSchema);
        assert!(error.message.contains("tail"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_run() {
        let flow = compile(
            r#"
version: "1.0"
nodes:
  hang:
    output_ports: [{ name: out, type: string }]
    transform: { kind: declarative, op_name: slow }
edges:
  - { from: hang.out, to: _output.out }
"#,
        );
        let engine = Arc::new(engine(slow_registry(Arc::new(AtomicU32::new(0)))));
        let handle = {
            let engine = engine.clone();
            let flow = flow.clone();
            tokio::spawn(async move {
                engine
                    .execute(&flow, RunRequest::new().with_field("trace_id", json!("t-cancel")))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.active_runs(), 1);
        assert!(engine.cancel("t-cancel"));

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status, RunStatus::Aborted);
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
        assert_eq!(result.record("hang").unwrap().status, NodeStatus::Cancelled);
        assert_eq!(engine.active_runs(), 0);
        assert!(!engine.cancel("t-cancel"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_sharing_trace_id_stay_cancellable() {
        let slow = compile(
            r#"
version: "1.0"
nodes:
  hang:
    output_ports: [{ name: out, type: string }]
    transform: { kind: declarative, op_name: slow }
edges:
  - { from: hang.out, to: _output.out }
"#,
        );
        let quick = compile(
            r#"
version: "1.0"
nodes:
  quick:
    output_ports: [{ name: out, type: string }]
    transform: { kind: declarative, op_name: quick }
edges:
  - { from: quick.out, to: _output.out }
"#,
        );
        let mut registry = slow_registry(Arc::new(AtomicU32::new(0)));
        registry.register_fn("quick", |_args, _inputs, _ctx| Ok(json!("fast")));
        let engine = Arc::new(engine(registry));
        let shared = || RunRequest::new().with_field("trace_id", json!("t-shared"));

        let handle = {
            let engine = engine.clone();
            let request = shared();
            tokio::spawn(async move { engine.execute(&slow, request).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let fast = engine.execute(&quick, shared()).await.unwrap();
        assert!(fast.is_success());
        assert_eq!(engine.active_runs(), 1);
        assert!(engine.cancel("t-shared"));

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status, RunStatus::Aborted);
        assert_eq!(engine.active_runs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_deadline_preempts_node_timeout() {
        let started = Instant::now();
        let result = engine(slow_registry(Arc::new(AtomicU32::new(0))))
            .execute(
                &compile(SLOW),
                RunRequest::new().with_input("q", json!("x")).with_deadline_ms(50),
            )
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Aborted);
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_run_with_prepared_plan() {
        let plan = build_execution_plan(compile(TRIAGE)).unwrap();
        let ctx = Arc::new(new_context(&RunRequest::new()).unwrap());
        let mut inputs = Inputs::new();
        inputs.insert("text".to_string(), json!("urgent"));

        let result = engine(triage_registry()).run(&plan, ctx.clone(), inputs.clone()).await;
        assert!(result.is_success());
        assert_eq!(result.trace_id, ctx.trace_id());

        // Unresolvable capabilities fail the run before any node executes.
        let result = engine(OperationRegistry::new()).run(&plan, ctx, inputs).await;
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.trace.is_empty());
        assert_eq!(result.error.as_ref().unwrap().node_id.as_deref(), Some("classify"));
    }

    #[tokio::test]
    async fn test_execute_reports_unknown_operation() {
        let err = engine(OperationRegistry::new())
            .execute(&compile(TRIAGE), RunRequest::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Dispatch { node_id, .. } if node_id == "classify"));
    }
}
