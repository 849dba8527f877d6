//! A small operation library for running flows without a host.
//!
//! | name       | args                          | result                              |
//! |------------|-------------------------------|-------------------------------------|
//! | `identity` |                               | the single input, or all inputs     |
//! | `constant` | `value`                       | `value`                             |
//! | `template` | `template`                    | `{{ path }}` rendered over inputs   |
//! | `join`     | `separator` (default `" "`)   | string inputs joined by port name  |
//! | `pick`     | `path`, `from` (input port)   | the value at `path`, or null        |
//! | `length`   | `from` (input port)           | length of a string, array or object |

use agentflow_core::flow::context::{lookup_path, resolve_template, value_to_string, Context};
use agentflow_core::flow::dispatch::{Inputs, OperationError, OperationRegistry};
use serde_json::{json, Value};

/// Register every built-in operation on `registry`.
pub fn register_builtins(registry: &mut OperationRegistry) {
    registry.register_fn("identity", identity);
    registry.register_fn("constant", constant);
    registry.register_fn("template", template);
    registry.register_fn("join", join);
    registry.register_fn("pick", pick);
    registry.register_fn("length", length);
}

/// A registry holding only the built-in operations.
pub fn builtin_registry() -> OperationRegistry {
    let mut registry = OperationRegistry::new();
    register_builtins(&mut registry);
    registry
}

fn identity(_args: &Value, inputs: &Inputs, _ctx: &Context) -> Result<Value, OperationError> {
    let mut values = inputs.values();
    match (values.next(), values.next()) {
        (Some(only), None) => Ok(only.clone()),
        _ => Ok(Value::Object(inputs.clone())),
    }
}

fn constant(args: &Value, _inputs: &Inputs, _ctx: &Context) -> Result<Value, OperationError> {
    args.get("value")
        .cloned()
        .ok_or_else(|| OperationError::InvalidArgs("constant requires args.value".to_string()))
}

fn template(args: &Value, inputs: &Inputs, ctx: &Context) -> Result<Value, OperationError> {
    let template = string_arg(args, "template")?;
    let root = json!({
        "inputs": inputs,
        "context": ctx.to_expression_value(),
    });
    Ok(Value::String(resolve_template(template, &root)))
}

fn join(args: &Value, inputs: &Inputs, _ctx: &Context) -> Result<Value, OperationError> {
    let separator = args.get("separator").and_then(Value::as_str).unwrap_or(" ");
    let parts: Vec<String> = inputs.values().map(value_to_string).collect();
    Ok(Value::String(parts.join(separator)))
}

fn pick(args: &Value, inputs: &Inputs, _ctx: &Context) -> Result<Value, OperationError> {
    let path = string_arg(args, "path")?;
    let source = input_arg(args, inputs)?;
    Ok(lookup_path(source, path).cloned().unwrap_or(Value::Null))
}

fn length(args: &Value, inputs: &Inputs, _ctx: &Context) -> Result<Value, OperationError> {
    let len = match input_arg(args, inputs)? {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        other => return Err(OperationError::failed(format!("cannot take the length of {other}"))),
    };
    Ok(json!(len))
}

fn string_arg<'a>(args: &'a Value, name: &str) -> Result<&'a str, OperationError> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| OperationError::InvalidArgs(format!("missing string argument '{name}'")))
}

/// The input named by `args.from`, or the only input when there is one.
fn input_arg<'a>(args: &Value, inputs: &'a Inputs) -> Result<&'a Value, OperationError> {
    match args.get("from").and_then(Value::as_str) {
        Some(port) => inputs
            .get(port)
            .ok_or_else(|| OperationError::InvalidArgs(format!("no input on port '{port}'"))),
        None if inputs.len() == 1 => inputs
            .values()
            .next()
            .ok_or_else(|| OperationError::InvalidArgs("no inputs".to_string())),
        None => Err(OperationError::InvalidArgs(
            "args.from is required when a node has several inputs".to_string(),
        )),
    }
}
