//! Flow domain types for agentflow.
//!
//! Defines the wire form of the intermediate representation (IR): a versioned
//! document of typed transformation nodes and the edges between their ports.
//! The editor, the chat assistant, and the engine all exchange this shape, so
//! field names and the port-type vocabulary are a compatibility surface.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

/// Source endpoint name for flow-level inputs.
pub const INPUT_BOUNDARY: &str = "_input";

/// Target endpoint name for flow-level outputs.
pub const OUTPUT_BOUNDARY: &str = "_output";

// ---------------------------------------------------------------------------
// Flow Document (wire form)
// ---------------------------------------------------------------------------

/// The IR document as authored.
///
/// Nothing here is validated; `agentflow-core` turns it into a `Flow`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDocument {
    /// Document format version (e.g. "1.0").
    pub version: String,
    /// Free-form metadata. `metadata.name` names the flow in logs.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    /// Context fields the flow needs from every inbound request.
    #[serde(default)]
    pub context: ContextRequirements,
    /// Nodes keyed by id, in document order.
    #[serde(default)]
    pub nodes: NodeEntries,
    /// Port-to-port data links.
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
    /// Deployment section, carried through without interpretation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<Value>,
}

/// Context fields a flow requires.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRequirements {
    #[serde(default)]
    pub requires: BTreeSet<String>,
}

/// Ordered node map that keeps duplicate keys.
///
/// A plain map would silently keep the last duplicate; the validator needs to
/// see every entry to report duplicate ids.
#[derive(Debug, Clone, Default)]
pub struct NodeEntries(pub Vec<(String, Node)>);

impl NodeEntries {
    pub fn iter(&self) -> impl Iterator<Item = &(String, Node)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, id: impl Into<String>, node: Node) {
        self.0.push((id.into(), node));
    }
}

impl Serialize for NodeEntries {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (id, node) in &self.0 {
            map.serialize_entry(id, node)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for NodeEntries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = NodeEntries;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of node id to node definition")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((id, node)) = access.next_entry::<String, Node>()? {
                    entries.push((id, node));
                }
                Ok(NodeEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A typed transformation step.
///
/// There is one node shape; capabilities (error port, prompt layer, state)
/// are optional fields rather than node kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Filled from the map key during validation.
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub input_ports: Vec<Port>,
    #[serde(default)]
    pub output_ports: Vec<Port>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_port: Option<Port>,
    pub transform: Transform,
    #[serde(default)]
    pub runtime_policy: RuntimeConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_config: Option<StateConfig>,
}

impl Node {
    pub fn input_port(&self, name: &str) -> Option<&Port> {
        self.input_ports.iter().find(|p| p.name == name)
    }

    /// Look up an output port, including the error port.
    pub fn output_port(&self, name: &str) -> Option<&Port> {
        self.output_ports
            .iter()
            .chain(self.error_port.iter())
            .find(|p| p.name == name)
    }

    pub fn is_error_port(&self, name: &str) -> bool {
        self.error_port.as_ref().is_some_and(|p| p.name == name)
    }
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// A named, typed data slot on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    pub name: String,
    #[serde(rename = "type")]
    pub port_type: PortType,
    #[serde(default)]
    pub optional: bool,
    /// JSON Schema applied to values on this port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_schema: Option<Value>,
}

impl Port {
    pub fn new(name: impl Into<String>, port_type: PortType) -> Self {
        Self {
            name: name.into(),
            port_type,
            optional: false,
            validation_schema: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Port type vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Document,
    Table,
    Embedding,
}

impl PortType {
    /// How a value on a `self` port is converted when it flows into a
    /// `target` port. `None` means the connection is not allowed.
    pub fn coercion_to(self, target: PortType) -> Option<Coercion> {
        use PortType::*;
        match (self, target) {
            (String, String)
            | (Number, Number)
            | (Boolean, Boolean)
            | (Object, Object)
            | (Array, Array)
            | (Document, Document)
            | (Table, Array)
            | (Embedding, Array) => Some(Coercion::Identity),
            (String, Document) => Some(Coercion::WrapDocument),
            (Number, String) | (Boolean, String) => Some(Coercion::Stringify),
            (Document, String) => Some(Coercion::DocumentText),
            (Table, Object) => Some(Coercion::FirstRow),
            _ => None,
        }
    }

    /// Whether `value` has the shape of this port type.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            PortType::String => value.is_string(),
            PortType::Number => value.is_number(),
            PortType::Boolean => value.is_boolean(),
            PortType::Object => value.is_object(),
            PortType::Array => value.is_array(),
            PortType::Document => {
                value.is_string() || value.get("content").is_some_and(Value::is_string)
            }
            PortType::Table => value
                .as_array()
                .is_some_and(|rows| rows.iter().all(Value::is_object)),
            PortType::Embedding => value
                .as_array()
                .is_some_and(|xs| xs.iter().all(Value::is_number)),
        }
    }
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PortType::String => "string",
            PortType::Number => "number",
            PortType::Boolean => "boolean",
            PortType::Object => "object",
            PortType::Array => "array",
            PortType::Document => "document",
            PortType::Table => "table",
            PortType::Embedding => "embedding",
        };
        f.write_str(s)
    }
}

/// Value conversion applied along an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercion {
    Identity,
    /// number/boolean rendered as a string.
    Stringify,
    /// document reduced to its text content.
    DocumentText,
    /// string wrapped as `{ "content": ... }`.
    WrapDocument,
    /// table reduced to its first row.
    FirstRow,
}

impl Coercion {
    pub fn apply(self, value: Value) -> Result<Value, String> {
        match self {
            Coercion::Identity => Ok(value),
            Coercion::Stringify => match value {
                Value::String(_) => Ok(value),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                other => Err(format!("cannot cast {other} to string")),
            },
            Coercion::DocumentText => match value {
                Value::String(_) => Ok(value),
                Value::Object(mut map) => match map.remove("content") {
                    Some(Value::String(text)) => Ok(Value::String(text)),
                    _ => Err("document has no text content".to_string()),
                },
                other => Err(format!("{other} is not a document")),
            },
            Coercion::WrapDocument => match value {
                Value::String(text) => Ok(json!({ "content": text })),
                other if other.get("content").is_some() => Ok(other),
                other => Err(format!("{other} is not a string")),
            },
            Coercion::FirstRow => match value {
                Value::Array(rows) => rows
                    .into_iter()
                    .next()
                    .ok_or_else(|| "table has no rows".to_string()),
                other => Err(format!("{other} is not a table")),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

/// An edge as authored: `node.port` strings on both ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub from: String,
    pub to: String,
    /// Boolean JEXL expression over the upstream value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// JEXL expression mapping the upstream value before delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_transform: Option<String>,
}

impl EdgeDefinition {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
            inline_transform: None,
        }
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// One side of an edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Input,
    Output,
    Node(String),
}

/// A parsed `node.port` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub endpoint: Endpoint,
    pub port: String,
}

impl PortRef {
    /// Parse `node.port`, `_input.name`, or `_output.name`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let (node, port) = s
            .split_once('.')
            .ok_or_else(|| format!("'{s}' is not of the form node.port"))?;
        if node.is_empty() || port.is_empty() || port.contains('.') {
            return Err(format!("'{s}' is not of the form node.port"));
        }
        let endpoint = match node {
            INPUT_BOUNDARY => Endpoint::Input,
            OUTPUT_BOUNDARY => Endpoint::Output,
            id => Endpoint::Node(id.to_string()),
        };
        Ok(Self {
            endpoint,
            port: port.to_string(),
        })
    }

    pub fn node_id(&self) -> Option<&str> {
        match &self.endpoint {
            Endpoint::Node(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.endpoint {
            Endpoint::Input => write!(f, "{INPUT_BOUNDARY}.{}", self.port),
            Endpoint::Output => write!(f, "{OUTPUT_BOUNDARY}.{}", self.port),
            Endpoint::Node(id) => write!(f, "{id}.{}", self.port),
        }
    }
}

// ---------------------------------------------------------------------------
// Transform
// ---------------------------------------------------------------------------

/// What a node does. Exactly one variant per node.
///
/// Internally tagged by `kind`:
/// ```yaml
/// transform:
///   kind: declarative
///   op_name: feature_lookup
///   args: { table: users }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transform {
    /// A registry-resolved operation.
    Declarative {
        op_name: String,
        #[serde(default)]
        args: Value,
    },
    /// User-supplied code, executed by the host's code runtime.
    Code { body: String },
    /// A templated model invocation with schema-checked output.
    Prompt {
        template: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        system: Option<String>,
        model_ref: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_schema: Option<Value>,
        #[serde(default)]
        fallback: PromptFallback,
    },
}

impl Transform {
    pub fn kind(&self) -> &'static str {
        match self {
            Transform::Declarative { .. } => "declarative",
            Transform::Code { .. } => "code",
            Transform::Prompt { .. } => "prompt",
        }
    }
}

/// Declared policy when a model response fails its output schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum PromptFallback {
    /// Fail the attempt with an output schema error.
    #[default]
    Raise,
    /// Ask a different model once.
    Model { model_ref: String },
    /// Return a fixed response.
    Static { response: Value },
}

// ---------------------------------------------------------------------------
// Runtime and state configuration
// ---------------------------------------------------------------------------

/// Per-node execution policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Per-attempt timeout in milliseconds (default 30000).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Total attempts, including the first (default 1).
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Delay between attempts in milliseconds (default 1000).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Concurrent executions of this node allowed across runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub required_context_fields: BTreeSet<String>,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_retries() -> u32 {
    1
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_concurrency: None,
            required_context_fields: BTreeSet::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Lifetime class of node state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateScope {
    Request,
    Session,
}

/// State attached to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateConfig {
    pub scope: StateScope,
    /// Key template, e.g. `conversation_{session_id}`.
    #[serde(default = "default_key_template")]
    pub key_template: String,
    /// Time-to-live in seconds (session scope only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
    /// Name of the session store; the engine's default store when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_ref: Option<String>,
}

fn default_key_template() -> String {
    "{node_id}".to_string()
}

impl StateConfig {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
