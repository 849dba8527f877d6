//! Run request and result types.
//!
//! A `RunRequest` carries the boundary inputs and raw context fields of one
//! inbound request; a `RunResult` is the single terminal outcome of running a
//! flow against it.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::flow::PortType;

// ---------------------------------------------------------------------------
// RunRequest
// ---------------------------------------------------------------------------

/// An inbound request for one flow execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    /// Values bound to `_input.<name>` edges.
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// Raw fields the run context is built from (`user_id`, `session_id`, ...).
    #[serde(default)]
    pub fields: Map<String, Value>,
    /// Run deadline in milliseconds; overrides the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

impl RunRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn with_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }
}

// ---------------------------------------------------------------------------
// Errors carried in results
// ---------------------------------------------------------------------------

/// Classification of a node or run error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// An attempt exceeded the node timeout.
    Timeout,
    /// The capability raised, or the node's inputs were unusable.
    Invocation,
    /// A produced value failed its declared port schema.
    OutputSchema,
    /// The node was aborted by run-level cancellation.
    Cancelled,
    /// An edge condition or inline transform failed to evaluate.
    Expression,
    /// A required boundary input was absent from the request.
    MissingInput,
    /// The flow finished without delivering any `_output` value.
    NoOutput,
}

impl ErrorKind {
    /// Whether node policy may retry an attempt that failed this way.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::Invocation | ErrorKind::OutputSchema
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Invocation => "invocation",
            ErrorKind::OutputSchema => "output_schema",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Expression => "expression",
            ErrorKind::MissingInput => "missing_input",
            ErrorKind::NoOutput => "no_output",
        };
        f.write_str(s)
    }
}

/// An error with enough provenance to act on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredError {
    /// Originating node, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub kind: ErrorKind,
    /// Attempts made before the error escalated.
    pub attempts: u32,
    pub message: String,
}

impl StructuredError {
    pub fn node(node_id: impl Into<String>, kind: ErrorKind, attempts: u32, message: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            kind,
            attempts,
            message: message.into(),
        }
    }

    pub fn run(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            node_id: None,
            kind,
            attempts: 0,
            message: message.into(),
        }
    }

    /// The value delivered on an error port of the given type.
    pub fn to_port_value(&self, port_type: PortType) -> Value {
        match port_type {
            PortType::String => Value::String(self.to_string()),
            _ => json!({
                "node_id": self.node_id,
                "kind": self.kind,
                "attempts": self.attempts,
                "message": self.message,
            }),
        }
    }
}

impl fmt::Display for StructuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node_id {
            Some(id) => write!(
                f,
                "node '{id}' failed after {} attempt(s) ({}): {}",
                self.attempts, self.kind, self.message
            ),
            None => write!(f, "run failed ({}): {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for StructuredError {}

// ---------------------------------------------------------------------------
// Execution records
// ---------------------------------------------------------------------------

/// Terminal status of a single node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Succeeded,
    /// Failed with no error route; the run failed with it.
    Failed,
    /// Failed and the error was delivered on the node's error port.
    Routed,
    /// Not executed because a required input received no value.
    Skipped,
    Cancelled,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Succeeded => "succeeded",
            NodeStatus::Failed => "failed",
            NodeStatus::Routed => "routed",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One entry of the run trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    pub node_id: String,
    pub status: NodeStatus,
    /// Attempts made (0 for skipped nodes).
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StructuredError>,
}

impl NodeExecutionRecord {
    pub fn skipped(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Skipped,
            attempts: 0,
            started_at: None,
            duration_ms: 0,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// RunResult
// ---------------------------------------------------------------------------

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    /// Ended by external cancellation or the run deadline.
    Aborted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Outcome of one flow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub trace_id: String,
    pub status: RunStatus,
    /// Output of every node that succeeded, keyed by node id.
    pub outputs: BTreeMap<String, Value>,
    /// Values delivered to `_output.<name>`.
    pub boundary_outputs: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StructuredError>,
    /// Node records in completion order.
    pub trace: Vec<NodeExecutionRecord>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// The trace record for a node, if it reached a terminal state.
    pub fn record(&self, node_id: &str) -> Option<&NodeExecutionRecord> {
        self.trace.iter().find(|r| r.node_id == node_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_error_display() {
        let err = StructuredError::node("call", ErrorKind::Timeout, 3, "attempt timed out after 100ms");
        let msg = err.to_string();
        assert!(msg.contains("call"));
        assert!(msg.contains("3 attempt"));
        assert!(msg.contains("timeout"));

        let err = StructuredError::run(ErrorKind::NoOutput, "no value reached _output");
        assert!(err.to_string().starts_with("run failed (no_output)"));
    }

    #[test]
    fn test_error_port_value_shapes() {
        let err = StructuredError::node("risky", ErrorKind::Invocation, 1, "boom");
        let obj = err.to_port_value(PortType::Object);
        assert_eq!(obj["node_id"], json!("risky"));
        assert_eq!(obj["kind"], json!("invocation"));
        assert_eq!(obj["attempts"], json!(1));

        let text = err.to_port_value(PortType::String);
        assert!(text.as_str().unwrap().contains("boom"));
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::OutputSchema.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
        assert!(!ErrorKind::Expression.is_retryable());
    }

    #[test]
    fn test_request_builder() {
        let req = RunRequest::new()
            .with_input("question", json!("hi"))
            .with_field("session_id", json!("s1"))
            .with_deadline_ms(500);
        assert_eq!(req.inputs["question"], json!("hi"));
        assert_eq!(req.fields["session_id"], json!("s1"));
        assert_eq!(req.deadline_ms, Some(500));
    }
}
