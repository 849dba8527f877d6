//! IR document parsing and validation.
//!
//! Turns a `FlowDocument` into an immutable, validated `Flow`. Validation
//! accumulates every problem it finds in one pass so an editor can show the
//! whole list at once; it never stops at the first error.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use agentflow_types::error::ValidationError;
use agentflow_types::flow::{
    Coercion, EdgeDefinition, Endpoint, FlowDocument, Node, NodeEntries, PortRef, PortType,
    StateScope, Transform,
};
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use serde_json::Value;
use thiserror::Error;

use super::context::template_variables;
use super::schema::CompiledSchema;

/// `(from, to, condition, inline_transform)` of an authored edge.
type EdgeKey<'a> = (&'a str, &'a str, Option<&'a str>, Option<&'a str>);

/// Variables a state key template may always reference.
const KEY_TEMPLATE_VARIABLES: &[&str] = &["node_id", "user_id", "session_id", "trace_id"];

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from loading, validating, or planning a flow.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The document failed validation.
    #[error("invalid flow ({} error(s)): {}", .0.len(), join_errors(.0))]
    Invalid(Vec<ValidationError>),

    /// The flow could not be turned into an execution plan.
    #[error("plan error: {0}")]
    PlanError(String),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// ---------------------------------------------------------------------------
// Validated form
// ---------------------------------------------------------------------------

/// A validated edge with parsed endpoints and its compile-time coercion.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub source: PortRef,
    pub target: PortRef,
    pub condition: Option<String>,
    pub inline_transform: Option<String>,
    /// Conversion applied on delivery (identity for boundary edges).
    pub coercion: Coercion,
}

impl Edge {
    fn to_definition(&self) -> EdgeDefinition {
        EdgeDefinition {
            from: self.source.to_string(),
            to: self.target.to_string(),
            condition: self.condition.clone(),
            inline_transform: self.inline_transform.clone(),
        }
    }
}

/// An immutable, validated flow.
///
/// Only `validate` constructs one, so every `Flow` satisfies the structural
/// invariants: unique ids and port names, acyclic node graph, type-compatible
/// edges, and consistent context and state configuration.
#[derive(Debug, Clone)]
pub struct Flow {
    version: String,
    metadata: HashMap<String, Value>,
    context_requirements: BTreeSet<String>,
    nodes: Vec<Node>,
    node_index: HashMap<String, usize>,
    edges: Vec<Edge>,
    deployment: Option<Value>,
}

impl Flow {
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    /// `metadata.name`, or `"flow"` when unnamed.
    pub fn name(&self) -> &str {
        self.metadata
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("flow")
    }

    pub fn context_requirements(&self) -> &BTreeSet<String> {
        &self.context_requirements
    }

    /// Nodes in document order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.node_index.get(id).map(|&i| &self.nodes[i])
    }

    /// Position of a node in document order.
    pub fn node_index(&self, id: &str) -> Option<usize> {
        self.node_index.get(id).copied()
    }

    /// Edges in document order.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn deployment(&self) -> Option<&Value> {
        self.deployment.as_ref()
    }

    /// Convert back to the wire form.
    pub fn to_document(&self) -> FlowDocument {
        let mut nodes = NodeEntries::default();
        for node in &self.nodes {
            nodes.push(node.id.clone(), node.clone());
        }
        FlowDocument {
            version: self.version.clone(),
            metadata: self.metadata.clone(),
            context: agentflow_types::flow::ContextRequirements {
                requires: self.context_requirements.clone(),
            },
            nodes,
            edges: self.edges.iter().map(Edge::to_definition).collect(),
            deployment: self.deployment.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML IR document without validating it.
pub fn parse_flow_yaml(yaml: &str) -> Result<FlowDocument, ValidationError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| ValidationError::Parse(e.to_string()))
}

/// Parse a JSON IR document without validating it.
pub fn parse_flow_json(json: &str) -> Result<FlowDocument, ValidationError> {
    serde_json::from_str(json).map_err(|e| ValidationError::Parse(e.to_string()))
}

/// Parse and validate a YAML document.
pub fn compile_flow_yaml(yaml: &str) -> Result<Flow, Vec<ValidationError>> {
    validate(parse_flow_yaml(yaml).map_err(|e| vec![e])?)
}

/// Parse and validate a JSON document.
pub fn compile_flow_json(json: &str) -> Result<Flow, Vec<ValidationError>> {
    validate(parse_flow_json(json).map_err(|e| vec![e])?)
}

/// Load a flow from disk. `.json` files are parsed as JSON, anything else as
/// YAML.
pub fn load_flow_file(path: &Path) -> Result<Flow, FlowError> {
    let content = std::fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let compiled = if is_json {
        compile_flow_json(&content)
    } else {
        compile_flow_yaml(&content)
    };
    compiled.map_err(FlowError::Invalid)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate an IR document into a `Flow`.
///
/// Checks:
/// - version major is 1
/// - node id format, duplicate node ids, duplicate port names
/// - runtime policy bounds, compilable schemas, error port type
/// - context requirements and state configuration
/// - edge endpoint syntax, boundary direction, unknown nodes and ports
/// - port type compatibility, duplicate edges, unwired required inputs
/// - cycles (including self-loops)
pub fn validate(doc: FlowDocument) -> Result<Flow, Vec<ValidationError>> {
    let mut errors = Vec::new();

    if !is_supported_version(&doc.version) {
        errors.push(ValidationError::UnsupportedVersion(doc.version.clone()));
    }

    let requires = doc.context.requires;
    let mut nodes: Vec<Node> = Vec::with_capacity(doc.nodes.len());
    let mut node_index: HashMap<String, usize> = HashMap::new();
    for (id, mut node) in doc.nodes.0 {
        if !is_valid_node_id(&id) {
            errors.push(ValidationError::InvalidNodeId(id.clone()));
        }
        if node_index.contains_key(&id) {
            errors.push(ValidationError::DuplicateNode(id));
            continue;
        }
        node.id = id.clone();
        check_node(&node, &requires, &mut errors);
        node_index.insert(id, nodes.len());
        nodes.push(node);
    }

    let mut edges = Vec::with_capacity(doc.edges.len());
    let mut wired: HashSet<(String, String)> = HashSet::new();
    let mut node_links: Vec<(usize, usize)> = Vec::new();
    let mut first_seen: HashMap<EdgeKey<'_>, usize> = HashMap::new();
    for (i, def) in doc.edges.iter().enumerate() {
        let key = (
            def.from.as_str(),
            def.to.as_str(),
            def.condition.as_deref(),
            def.inline_transform.as_deref(),
        );
        if let Some(&first) = first_seen.get(&key) {
            errors.push(ValidationError::DuplicateEdge { edge: i, first });
        } else {
            first_seen.insert(key, i);
        }

        let (source, target) = parse_endpoints(i, def, &mut errors);
        if let Some(target) = &target {
            if let Some(id) = target.node_id() {
                wired.insert((id.to_string(), target.port.clone()));
            }
        }
        if let (Some(s), Some(t)) = (
            source.as_ref().and_then(PortRef::node_id).and_then(|id| node_index.get(id)),
            target.as_ref().and_then(PortRef::node_id).and_then(|id| node_index.get(id)),
        ) {
            node_links.push((*s, *t));
        }

        if let (Some(source), Some(target)) = (source, target) {
            if let Some(coercion) = check_edge(i, &source, &target, &nodes, &node_index, &mut errors) {
                edges.push(Edge {
                    source,
                    target,
                    condition: def.condition.clone(),
                    inline_transform: def.inline_transform.clone(),
                    coercion,
                });
            }
        }
    }

    for node in &nodes {
        for port in node.input_ports.iter().filter(|p| !p.optional) {
            if !wired.contains(&(node.id.clone(), port.name.clone())) {
                errors.push(ValidationError::UnwiredInput {
                    node: node.id.clone(),
                    port: port.name.clone(),
                });
            }
        }
    }

    errors.extend(find_cycles(&nodes, &node_links));

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(Flow {
        version: doc.version,
        metadata: doc.metadata,
        context_requirements: requires,
        nodes,
        node_index,
        edges,
        deployment: doc.deployment,
    })
}

fn is_supported_version(version: &str) -> bool {
    let mut parts = version.split('.');
    parts.next() == Some("1")
        && parts.all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

fn is_valid_node_id(id: &str) -> bool {
    let mut chars = id.chars();
    chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Per-node checks that do not depend on edges.
fn check_node(node: &Node, requires: &BTreeSet<String>, errors: &mut Vec<ValidationError>) {
    let id = &node.id;
    let policy = &node.runtime_policy;
    if policy.retries < 1 {
        errors.push(ValidationError::InvalidRuntime {
            node: id.clone(),
            reason: "retries must be at least 1".to_string(),
        });
    }
    if policy.timeout_ms == 0 {
        errors.push(ValidationError::InvalidRuntime {
            node: id.clone(),
            reason: "timeout_ms must be greater than 0".to_string(),
        });
    }
    if policy.max_concurrency == Some(0) {
        errors.push(ValidationError::InvalidRuntime {
            node: id.clone(),
            reason: "max_concurrency must be at least 1".to_string(),
        });
    }

    let mut port_names = HashSet::new();
    for port in node
        .input_ports
        .iter()
        .chain(node.output_ports.iter())
        .chain(node.error_port.iter())
    {
        if !port_names.insert(port.name.as_str()) {
            errors.push(ValidationError::DuplicatePort {
                node: id.clone(),
                port: port.name.clone(),
            });
        }
        if let Some(schema) = &port.validation_schema {
            if let Err(reason) = CompiledSchema::compile(schema) {
                errors.push(ValidationError::InvalidSchema {
                    node: id.clone(),
                    port: port.name.clone(),
                    reason,
                });
            }
        }
    }

    if let Transform::Prompt {
        output_schema: Some(schema),
        ..
    } = &node.transform
    {
        if let Err(reason) = CompiledSchema::compile(schema) {
            errors.push(ValidationError::InvalidSchema {
                node: id.clone(),
                port: "output_schema".to_string(),
                reason,
            });
        }
    }

    if let Some(port) = &node.error_port {
        if !matches!(port.port_type, PortType::Object | PortType::String) {
            errors.push(ValidationError::InvalidErrorPort {
                node: id.clone(),
                port_type: port.port_type,
            });
        }
    }

    for field in &policy.required_context_fields {
        if !requires.contains(field) {
            errors.push(ValidationError::MissingContextRequirement {
                node: id.clone(),
                field: field.clone(),
            });
        }
    }

    if let Some(state) = &node.state_config {
        if state.scope == StateScope::Request && state.ttl_secs.is_some() {
            errors.push(ValidationError::TtlOnRequestScope { node: id.clone() });
        }
        if state.scope == StateScope::Session && state.ttl_secs == Some(0) {
            errors.push(ValidationError::ZeroTtl { node: id.clone() });
        }
        let variables = template_variables(&state.key_template);
        for var in &variables {
            if !is_known_key_variable(node, var) {
                errors.push(ValidationError::UnknownKeyVariable {
                    node: id.clone(),
                    variable: var.to_string(),
                });
            }
        }
        if state.scope == StateScope::Session && !variables.contains(&"session_id") {
            errors.push(ValidationError::SessionKeyWithoutSession {
                node: id.clone(),
                template: state.key_template.clone(),
            });
        }
    }
}

fn is_known_key_variable(node: &Node, var: &str) -> bool {
    if KEY_TEMPLATE_VARIABLES.contains(&var) {
        return true;
    }
    if let Some(port) = var.strip_prefix("inputs.") {
        return node.input_port(port).is_some();
    }
    var.strip_prefix("raw.").is_some_and(|field| !field.is_empty())
}

/// Parse both endpoints and check boundary direction.
fn parse_endpoints(
    i: usize,
    def: &EdgeDefinition,
    errors: &mut Vec<ValidationError>,
) -> (Option<PortRef>, Option<PortRef>) {
    let source = match PortRef::parse(&def.from) {
        Ok(r) if r.endpoint == Endpoint::Output => {
            errors.push(ValidationError::InvalidEdge {
                edge: i,
                reason: format!("'{}' cannot be an edge source", def.from),
            });
            None
        }
        Ok(r) => Some(r),
        Err(reason) => {
            errors.push(ValidationError::InvalidEdge { edge: i, reason });
            None
        }
    };
    let target = match PortRef::parse(&def.to) {
        Ok(r) if r.endpoint == Endpoint::Input => {
            errors.push(ValidationError::InvalidEdge {
                edge: i,
                reason: format!("'{}' cannot be an edge target", def.to),
            });
            None
        }
        Ok(r) => Some(r),
        Err(reason) => {
            errors.push(ValidationError::InvalidEdge { edge: i, reason });
            None
        }
    };
    (source, target)
}

/// Resolve both endpoints against the node table and check types.
///
/// Returns the coercion to apply on delivery when the edge is valid.
fn check_edge(
    i: usize,
    source: &PortRef,
    target: &PortRef,
    nodes: &[Node],
    node_index: &HashMap<String, usize>,
    errors: &mut Vec<ValidationError>,
) -> Option<Coercion> {
    let mut lookup = |port_ref: &PortRef, direction: &'static str| -> Result<Option<PortType>, ()> {
        let Some(id) = port_ref.node_id() else {
            return Ok(None);
        };
        let Some(&idx) = node_index.get(id) else {
            errors.push(ValidationError::UnknownNode {
                edge: i,
                node: id.to_string(),
            });
            return Err(());
        };
        let node = &nodes[idx];
        let port = if direction == "output" {
            node.output_port(&port_ref.port)
        } else {
            node.input_port(&port_ref.port)
        };
        match port {
            Some(p) => Ok(Some(p.port_type)),
            None => {
                errors.push(ValidationError::UnknownPort {
                    edge: i,
                    node: id.to_string(),
                    port: port_ref.port.clone(),
                    direction,
                });
                Err(())
            }
        }
    };

    let from_type = lookup(source, "output");
    let to_type = lookup(target, "input");
    match (from_type, to_type) {
        (Ok(Some(from_type)), Ok(Some(to_type))) => {
            let coercion = from_type.coercion_to(to_type);
            if coercion.is_none() {
                errors.push(ValidationError::TypeMismatch {
                    edge: i,
                    from: source.to_string(),
                    from_type,
                    to: target.to_string(),
                    to_type,
                });
            }
            coercion
        }
        // Boundary edges are untyped; `_input` values are checked on delivery.
        (Ok(_), Ok(_)) => Some(Coercion::Identity),
        _ => None,
    }
}

/// Every strongly connected component with more than one node, plus every
/// self-loop, as a sorted list of node ids.
fn find_cycles(nodes: &[Node], links: &[(usize, usize)]) -> Vec<ValidationError> {
    let mut graph = DiGraph::<usize, ()>::new();
    let indices: Vec<_> = (0..nodes.len()).map(|i| graph.add_node(i)).collect();
    for &(from, to) in links {
        graph.add_edge(indices[from], indices[to], ());
    }

    let mut cycles: Vec<Vec<String>> = tarjan_scc(&graph)
        .into_iter()
        .filter(|component| {
            component.len() > 1
                || component
                    .first()
                    .is_some_and(|&n| graph.contains_edge(n, n))
        })
        .map(|component| {
            let mut ids: Vec<String> = component
                .into_iter()
                .map(|n| nodes[graph[n]].id.clone())
                .collect();
            ids.sort();
            ids
        })
        .collect();
    cycles.sort();
    cycles
        .into_iter()
        .map(|nodes| ValidationError::Cycle { nodes })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID: &str = r#"
version: "1.0"
metadata:
  name: research
context:
  requires: [session_id]
nodes:
  fetch_a:
    input_ports: [{ name: q, type: string }]
    output_ports: [{ name: rows, type: table }]
    transform: { kind: declarative, op_name: search }
  fetch_b:
    input_ports: [{ name: q, type: string }]
    output_ports: [{ name: rows, type: table }]
    transform: { kind: declarative, op_name: search }
  combine:
    input_ports:
      - { name: left, type: array }
      - { name: right, type: object }
    output_ports: [{ name: summary, type: string }]
    transform: { kind: code, body: "merge" }
    state_config:
      scope: session
      key_template: "summary_{session_id}"
edges:
  - { from: _input.question, to: fetch_a.q }
  - { from: _input.question, to: fetch_b.q }
  - { from: fetch_a.rows, to: combine.left }
  - { from: fetch_b.rows, to: combine.right }
  - { from: combine.summary, to: _output.answer }
"#;

    fn errors_of(yaml: &str) -> Vec<ValidationError> {
        compile_flow_yaml(yaml).expect_err("document should be invalid")
    }

    #[test]
    fn test_valid_document_compiles() {
        let flow = compile_flow_yaml(VALID).unwrap();
        assert_eq!(flow.name(), "research");
        assert_eq!(flow.nodes().len(), 3);
        assert_eq!(flow.nodes()[2].id, "combine");
        assert_eq!(flow.node_index("fetch_b"), Some(1));
        assert_eq!(flow.edges().len(), 5);
        assert_eq!(flow.edges()[2].coercion, Coercion::Identity);
        assert_eq!(flow.edges()[3].coercion, Coercion::FirstRow);
        assert!(flow.context_requirements().contains("session_id"));
    }

    #[test]
    fn test_revalidation_is_idempotent() {
        let flow = compile_flow_yaml(VALID).unwrap();
        let again = validate(flow.to_document()).unwrap();
        assert_eq!(again.edges(), flow.edges());
        assert_eq!(again.nodes().len(), flow.nodes().len());
    }

    #[test]
    fn test_parse_error_is_single_error() {
        let errors = errors_of("version: [unterminated");
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], ValidationError::Parse(_)));
    }

    #[test]
    fn test_unsupported_version() {
        let yaml = VALID.replace("version: \"1.0\"", "version: \"2.0\"");
        let errors = errors_of(&yaml);
        assert_eq!(errors, vec![ValidationError::UnsupportedVersion("2.0".to_string())]);
    }

    #[test]
    fn test_errors_accumulate() {
        let yaml = r#"
version: "1.0"
nodes:
  Bad:
    output_ports: [{ name: out, type: string }]
    transform: { kind: code, body: "" }
    runtime_policy: { retries: 0, timeout_ms: 0 }
  sink:
    input_ports:
      - { name: n, type: number }
      - { name: extra, type: string }
    transform: { kind: code, body: "" }
edges:
  - { from: Bad.out, to: sink.n }
  - { from: sink.n, to: _input.x }
  - { from: ghost.out, to: sink.extra }
"#;
        let errors = errors_of(yaml);
        assert!(errors.contains(&ValidationError::InvalidNodeId("Bad".to_string())));
        assert!(errors.iter().filter(|e| matches!(e, ValidationError::InvalidRuntime { .. })).count() == 2);
        assert!(errors.iter().any(|e| matches!(e, ValidationError::TypeMismatch { edge: 0, .. })));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::InvalidEdge { edge: 1, .. })));
        assert!(errors.contains(&ValidationError::UnknownNode {
            edge: 2,
            node: "ghost".to_string()
        }));
    }

    #[test]
    fn test_duplicate_nodes_and_ports() {
        let json = r#"{
            "version": "1.0",
            "nodes": {
                "a": {
                    "input_ports": [{ "name": "x", "type": "string", "optional": true }],
                    "output_ports": [{ "name": "x", "type": "string" }],
                    "transform": { "kind": "code", "body": "" }
                },
                "a": { "transform": { "kind": "code", "body": "" } }
            }
        }"#;
        let errors = compile_flow_json(json).unwrap_err();
        assert!(errors.contains(&ValidationError::DuplicateNode("a".to_string())));
        assert!(errors.contains(&ValidationError::DuplicatePort {
            node: "a".to_string(),
            port: "x".to_string()
        }));
    }

    #[test]
    fn test_cycle_names_participants() {
        let yaml = r#"
version: "1.0"
nodes:
  b:
    input_ports: [{ name: i, type: string }]
    output_ports: [{ name: o, type: string }]
    transform: { kind: code, body: "" }
  a:
    input_ports: [{ name: i, type: string }]
    output_ports: [{ name: o, type: string }]
    transform: { kind: code, body: "" }
  c:
    input_ports: [{ name: i, type: string }]
    output_ports: [{ name: o, type: string }]
    transform: { kind: code, body: "" }
edges:
  - { from: a.o, to: b.i }
  - { from: b.o, to: a.i }
  - { from: c.o, to: c.i }
"#;
        let errors = errors_of(yaml);
        let cycles: Vec<_> = errors
            .iter()
            .filter_map(|e| match e {
                ValidationError::Cycle { nodes } => Some(nodes.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            cycles,
            vec![
                vec!["a".to_string(), "b".to_string()],
                vec!["c".to_string()]
            ]
        );
    }

    #[test]
    fn test_unwired_required_input() {
        let yaml = r#"
version: "1.0"
nodes:
  n:
    input_ports:
      - { name: needed, type: string }
      - { name: maybe, type: string, optional: true }
    transform: { kind: code, body: "" }
"#;
        assert_eq!(
            errors_of(yaml),
            vec![ValidationError::UnwiredInput {
                node: "n".to_string(),
                port: "needed".to_string()
            }]
        );
    }

    #[test]
    fn test_duplicate_edge() {
        let yaml = format!("{VALID}  - {{ from: combine.summary, to: _output.answer }}\n");
        assert_eq!(
            errors_of(&yaml),
            vec![ValidationError::DuplicateEdge { edge: 5, first: 4 }]
        );
    }

    #[test]
    fn test_unknown_port_direction() {
        let yaml = VALID.replace("to: combine.left", "to: combine.rows");
        let errors = errors_of(&yaml);
        assert!(errors.contains(&ValidationError::UnknownPort {
            edge: 2,
            node: "combine".to_string(),
            port: "rows".to_string(),
            direction: "input",
        }));
        // combine.left lost its only edge.
        assert!(errors.contains(&ValidationError::UnwiredInput {
            node: "combine".to_string(),
            port: "left".to_string()
        }));
    }

    #[test]
    fn test_state_configuration_checks() {
        let yaml = r#"
version: "1.0"
context:
  requires: [user_id]
nodes:
  memo:
    input_ports: [{ name: q, type: string }]
    transform: { kind: code, body: "" }
    runtime_policy:
      required_context_fields: [user_id, tenant]
    state_config:
      scope: session
      key_template: "memo_{user_id}_{inputs.q}_{inputs.nope}_{shard}"
  scratch:
    transform: { kind: code, body: "" }
    state_config: { scope: request, ttl_secs: 10 }
edges:
  - { from: _input.q, to: memo.q }
"#;
        let errors = errors_of(yaml);
        assert!(errors.contains(&ValidationError::MissingContextRequirement {
            node: "memo".to_string(),
            field: "tenant".to_string()
        }));
        assert!(errors.contains(&ValidationError::UnknownKeyVariable {
            node: "memo".to_string(),
            variable: "inputs.nope".to_string()
        }));
        assert!(errors.contains(&ValidationError::UnknownKeyVariable {
            node: "memo".to_string(),
            variable: "shard".to_string()
        }));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::SessionKeyWithoutSession { node, .. } if node == "memo")));
        assert!(errors.contains(&ValidationError::TtlOnRequestScope {
            node: "scratch".to_string()
        }));
        assert_eq!(errors.len(), 5);
    }

    #[test]
    fn test_zero_session_ttl_rejected() {
        let yaml = r#"
version: "1.0"
context: { requires: [session_id] }
nodes:
  counter:
    transform: { kind: code, body: "" }
    state_config: { scope: session, key_template: "visits_{session_id}", ttl_secs: 0 }
"#;
        assert_eq!(
            errors_of(yaml),
            vec![ValidationError::ZeroTtl {
                node: "counter".to_string()
            }]
        );
        assert!(compile_flow_yaml(&yaml.replace("ttl_secs: 0", "ttl_secs: 60")).is_ok());
    }

    #[test]
    fn test_schema_and_error_port_checks() {
        let yaml = r#"
version: "1.0"
nodes:
  ask:
    output_ports:
      - { name: out, type: object, validation_schema: { type: 12 } }
    error_port: { name: err, type: number }
    transform:
      kind: prompt
      template: "hi"
      model_ref: small
      output_schema: { type: "nonsense" }
"#;
        let errors = errors_of(yaml);
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| matches!(e, ValidationError::InvalidSchema { port, .. } if port == "out")));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::InvalidSchema { port, .. } if port == "output_schema")));
        assert!(errors.contains(&ValidationError::InvalidErrorPort {
            node: "ask".to_string(),
            port_type: PortType::Number
        }));
    }

    #[test]
    fn test_error_port_edges_validate() {
        let yaml = r#"
version: "1.0"
nodes:
  risky:
    output_ports: [{ name: out, type: string }]
    error_port: { name: error, type: object }
    transform: { kind: declarative, op_name: flaky }
  fallback:
    input_ports: [{ name: err, type: object }]
    output_ports: [{ name: out, type: string }]
    transform: { kind: declarative, op_name: apologize }
edges:
  - { from: risky.out, to: _output.answer }
  - { from: risky.error, to: fallback.err }
  - { from: fallback.out, to: _output.answer }
"#;
        let flow = compile_flow_yaml(yaml).unwrap();
        assert_eq!(flow.edges().len(), 3);
    }

    #[test]
    fn test_load_flow_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let yaml_path = dir.path().join("flow.yaml");
        std::fs::write(&yaml_path, VALID).unwrap();
        assert_eq!(load_flow_file(&yaml_path).unwrap().nodes().len(), 3);

        let doc = parse_flow_yaml(VALID).unwrap();
        let json_path = dir.path().join("flow.json");
        let mut file = std::fs::File::create(&json_path).unwrap();
        file.write_all(serde_json::to_string(&doc).unwrap().as_bytes())
            .unwrap();
        assert_eq!(load_flow_file(&json_path).unwrap().name(), "research");

        let missing = load_flow_file(&dir.path().join("missing.yaml"));
        assert!(matches!(missing, Err(FlowError::IoError(_))));
    }

    #[test]
    fn test_version_and_id_formats() {
        assert!(is_supported_version("1"));
        assert!(is_supported_version("1.2"));
        assert!(!is_supported_version("1."));
        assert!(!is_supported_version("10.0"));
        assert!(is_valid_node_id("fetch_a2"));
        assert!(!is_valid_node_id("_input"));
        assert!(!is_valid_node_id("2fast"));
        assert!(!is_valid_node_id(""));
    }
}
