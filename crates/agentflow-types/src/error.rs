use thiserror::Error;

use crate::flow::PortType;

/// A problem found while validating an IR document.
///
/// Validation reports these in batches; none of them is fatal to the
/// process. Edge indices are zero-based positions in the document's
/// `edges` list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("unsupported document version '{0}' (expected 1.x)")]
    UnsupportedVersion(String),

    #[error("invalid node id '{0}' (must match [a-z][a-z0-9_]*)")]
    InvalidNodeId(String),

    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),

    #[error("node '{node}' declares port '{port}' more than once")]
    DuplicatePort { node: String, port: String },

    #[error("edge {edge}: {reason}")]
    InvalidEdge { edge: usize, reason: String },

    #[error("edge {edge}: unknown node '{node}'")]
    UnknownNode { edge: usize, node: String },

    #[error("edge {edge}: node '{node}' has no {direction} port '{port}'")]
    UnknownPort {
        edge: usize,
        node: String,
        port: String,
        direction: &'static str,
    },

    #[error("edge {edge}: cannot connect {from} ({from_type}) to {to} ({to_type})")]
    TypeMismatch {
        edge: usize,
        from: String,
        from_type: PortType,
        to: String,
        to_type: PortType,
    },

    #[error("edge {edge} duplicates edge {first}")]
    DuplicateEdge { edge: usize, first: usize },

    #[error("required input port '{node}.{port}' has no incoming edge")]
    UnwiredInput { node: String, port: String },

    #[error("cycle detected involving nodes: {}", nodes.join(", "))]
    Cycle { nodes: Vec<String> },

    #[error("node '{node}' requires context field '{field}' not listed in context.requires")]
    MissingContextRequirement { node: String, field: String },

    #[error("node '{node}' uses session scope but key template '{template}' does not reference session_id")]
    SessionKeyWithoutSession { node: String, template: String },

    #[error("node '{node}' key template references unknown variable '{variable}'")]
    UnknownKeyVariable { node: String, variable: String },

    #[error("node '{node}' sets ttl on request-scoped state")]
    TtlOnRequestScope { node: String },

    #[error("node '{node}' sets a zero ttl, so its state would expire on write")]
    ZeroTtl { node: String },

    #[error("node '{node}' has invalid runtime policy: {reason}")]
    InvalidRuntime { node: String, reason: String },

    #[error("node '{node}' port '{port}' has an invalid schema: {reason}")]
    InvalidSchema {
        node: String,
        port: String,
        reason: String,
    },

    #[error("node '{node}' error port must be object or string, got {port_type}")]
    InvalidErrorPort { node: String, port_type: PortType },
}

/// Errors from session state backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("unknown state backend '{0}'")]
    UnknownBackend(String),
}
