//! Run context construction and template rendering.
//!
//! A `Context` is built once per run from the request's raw fields and never
//! changes afterwards. Two template syntaxes read from it:
//! - prompt templates: `{{ inputs.question }}` paths into a JSON root,
//!   unknown references are left in place;
//! - state key templates: `conversation_{session_id}`, where every variable
//!   must resolve.

use std::collections::HashMap;

use agentflow_types::run::RunRequest;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde_json::{json, Map, Value};
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("context field '{field}' is invalid: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("required context field '{0}' is missing")]
    MissingField(String),

    #[error("key template variable '{0}' has no value")]
    UnresolvedVariable(String),
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Immutable per-run context.
///
/// The auth token is held as a secret: it is excluded from `raw_fields`,
/// from template roots, and from `Debug` output.
#[derive(Debug)]
pub struct Context {
    user_id: Option<String>,
    session_id: Option<String>,
    trace_id: String,
    event_time: DateTime<Utc>,
    auth_token: Option<SecretString>,
    raw_fields: Map<String, Value>,
}

impl Context {
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn event_time(&self) -> DateTime<Utc> {
        self.event_time
    }

    pub fn auth_token(&self) -> Option<&SecretString> {
        self.auth_token.as_ref()
    }

    /// Every request field except the auth token, as received.
    pub fn raw_fields(&self) -> &Map<String, Value> {
        &self.raw_fields
    }

    /// Whether a well-known or raw field is present.
    pub fn has_field(&self, name: &str) -> bool {
        match name {
            "user_id" => self.user_id.is_some(),
            "session_id" => self.session_id.is_some(),
            "trace_id" | "event_time" => true,
            "auth_token" => self.auth_token.is_some(),
            other => self.raw_fields.get(other).is_some_and(|v| !v.is_null()),
        }
    }

    /// Fail on the first required field that is absent.
    pub fn require<'a>(&self, fields: impl IntoIterator<Item = &'a String>) -> Result<(), ContextError> {
        for field in fields {
            if !self.has_field(field) {
                return Err(ContextError::MissingField(field.clone()));
            }
        }
        Ok(())
    }

    /// JSON view used by edge conditions and prompt templates.
    pub fn to_expression_value(&self) -> Value {
        json!({
            "user_id": self.user_id,
            "session_id": self.session_id,
            "trace_id": self.trace_id,
            "event_time": self.event_time.to_rfc3339(),
            "raw": self.raw_fields,
        })
    }
}

/// Build the run context from a request. Pure apart from defaulting
/// `trace_id` (UUIDv7) and `event_time` (now).
pub fn new_context(request: &RunRequest) -> Result<Context, ContextError> {
    let fields = &request.fields;

    let user_id = string_field(fields, "user_id")?;
    let session_id = string_field(fields, "session_id")?;
    let trace_id = string_field(fields, "trace_id")?.unwrap_or_else(|| Uuid::now_v7().to_string());
    let event_time = match string_field(fields, "event_time")? {
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map_err(|e| ContextError::InvalidField {
                field: "event_time".to_string(),
                reason: e.to_string(),
            })?
            .with_timezone(&Utc),
        None => Utc::now(),
    };
    let auth_token = string_field(fields, "auth_token")?.map(SecretString::from);

    let raw_fields = fields
        .iter()
        .filter(|(k, _)| k.as_str() != "auth_token")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(Context {
        user_id,
        session_id,
        trace_id,
        event_time,
        auth_token,
        raw_fields,
    })
}

fn string_field(fields: &Map<String, Value>, name: &str) -> Result<Option<String>, ContextError> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(ContextError::InvalidField {
            field: name.to_string(),
            reason: format!("expected a string, got {other}"),
        }),
    }
}

// ---------------------------------------------------------------------------
// Prompt templates
// ---------------------------------------------------------------------------

/// Replace every `{{ path }}` with the value at `path` in `root`.
///
/// Strings render bare, other values as compact JSON. References that do
/// not resolve are left exactly as written.
pub fn resolve_template(template: &str, root: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        let end = start + 2 + len + 2;
        out.push_str(&rest[..start]);
        let path = rest[start + 2..end - 2].trim();
        match lookup_path(root, path) {
            Some(value) => out.push_str(&value_to_string(value)),
            None => out.push_str(&rest[start..end]),
        }
        rest = &rest[end..];
    }
    out.push_str(rest);
    out
}

/// Follow a dotted path through objects (and arrays, by index).
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Key templates
// ---------------------------------------------------------------------------

/// Variables referenced as `{name}` in a key template, in order.
pub fn template_variables(template: &str) -> Vec<&str> {
    let mut vars = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let Some(len) = rest[start + 1..].find('}') else {
            break;
        };
        let var = rest[start + 1..start + 1 + len].trim();
        if !var.is_empty() {
            vars.push(var);
        }
        rest = &rest[start + 1 + len + 1..];
    }
    vars
}

/// Render a state key template for one node execution.
pub fn render_key_template(
    template: &str,
    node_id: &str,
    ctx: &Context,
    inputs: &Map<String, Value>,
) -> Result<String, ContextError> {
    let mut values: HashMap<&str, String> = HashMap::new();
    for var in template_variables(template) {
        let value = match var {
            "node_id" => Some(node_id.to_string()),
            "user_id" => ctx.user_id.clone(),
            "session_id" => ctx.session_id.clone(),
            "trace_id" => Some(ctx.trace_id.clone()),
            other => {
                if let Some(port) = other.strip_prefix("inputs.") {
                    inputs.get(port).map(value_to_string)
                } else if let Some(field) = other.strip_prefix("raw.") {
                    ctx.raw_fields.get(field).map(value_to_string)
                } else {
                    None
                }
            }
        };
        let value = value.ok_or_else(|| ContextError::UnresolvedVariable(var.to_string()))?;
        values.insert(var, value);
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let Some(len) = rest[start + 1..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let var = rest[start + 1..start + 1 + len].trim();
        if let Some(value) = values.get(var) {
            out.push_str(value);
        }
        rest = &rest[start + 1 + len + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
