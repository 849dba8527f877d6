//! JEXL expression evaluator for edge conditions and inline transforms.
//!
//! Wraps `jexl_eval::Evaluator` with a small set of standard transforms.
//! Upstream values are always passed as the evaluation context, never
//! interpolated into expression strings.

use serde_json::{json, Map, Value};

use super::context::Context;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// EdgeEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with standard transforms registered.
///
/// Cheap to build; the engine creates one per edge resolution so it never
/// has to be shared between tasks.
pub struct EdgeEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl EdgeEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            .with_transform("keys", |args: &[Value]| {
                let keys: Vec<&String> = match args.first() {
                    Some(Value::Object(o)) => o.keys().collect(),
                    _ => Vec::new(),
                };
                Ok(json!(keys))
            })
            .with_transform("first", |args: &[Value]| {
                let first = match args.first() {
                    Some(Value::Array(a)) => a.first().cloned().unwrap_or(Value::Null),
                    _ => Value::Null,
                };
                Ok(first)
            });

        Self { evaluator }
    }

    /// Evaluation scope for an edge out of `port`.
    ///
    /// `{ <port>: value, value, output, context }`, plus the fields of
    /// `value` itself when it is an object, so `score > 0.7` works on an
    /// object carrying `score`.
    pub fn edge_scope(port: &str, value: &Value, output: &Value, ctx: &Context) -> Value {
        let mut scope = match value {
            Value::Object(fields) => fields.clone(),
            _ => Map::new(),
        };
        scope.insert(port.to_string(), value.clone());
        scope.insert("value".to_string(), value.clone());
        scope.insert("output".to_string(), output.clone());
        scope.insert("context".to_string(), ctx.to_expression_value());
        Value::Object(scope)
    }

    /// Evaluate to a boolean using JavaScript-like truthiness.
    pub fn evaluate_bool(&self, expression: &str, scope: &Value) -> Result<bool, ExpressionError> {
        let result = self.evaluate_value(expression, scope)?;
        Ok(Self::value_to_bool(&result))
    }

    /// Evaluate and return the raw JSON value.
    pub fn evaluate_value(&self, expression: &str, scope: &Value) -> Result<Value, ExpressionError> {
        if !scope.is_object() {
            return Err(ExpressionError::InvalidContext(
                "scope must be a JSON object".to_string(),
            ));
        }
        self.evaluator
            .eval_in_context(expression, scope)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }

    fn value_to_bool(value: &Value) -> bool {
        match value {
            Value::Bool(b) => *b,
            Value::Null => false,
            Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) => true,
        }
    }
}

impl Default for EdgeEvaluator {
    fn default() -> Self {
        Self::new()
    }
}
