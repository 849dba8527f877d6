//! Compiled JSON Schemas for port values and prompt outputs.

use std::fmt;
use std::sync::Arc;

use jsonschema::JSONSchema;
use serde_json::Value;

/// A JSON Schema compiled once and shared between runs.
#[derive(Clone)]
pub struct CompiledSchema {
    inner: Arc<JSONSchema>,
}

impl CompiledSchema {
    /// Compile a schema document. The error is the compiler's message.
    pub fn compile(schema: &Value) -> Result<Self, String> {
        let compiled = JSONSchema::compile(schema).map_err(|e| e.to_string())?;
        Ok(Self {
            inner: Arc::new(compiled),
        })
    }

    /// Check a value, joining every violation into one message.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        match self.inner.validate(value) {
            Ok(()) => Ok(()),
            Err(errors) => {
                let messages: Vec<String> = errors
                    .map(|e| {
                        let path = e.instance_path.to_string();
                        if path.is_empty() {
                            e.to_string()
                        } else {
                            format!("{path}: {e}")
                        }
                    })
                    .collect();
                Err(messages.join("; "))
            }
        }
    }
}

impl fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledSchema").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_check_accepts_and_rejects() {
        let schema = CompiledSchema::compile(&json!({
            "type": "object",
            "required": ["answer"],
            "properties": { "answer": { "type": "string" } }
        }))
        .unwrap();

        assert!(schema.check(&json!({ "answer": "yes" })).is_ok());
        let err = schema.check(&json!({ "answer": 42 })).unwrap_err();
        assert!(err.contains("answer"), "got: {err}");
        assert!(schema.check(&json!({})).is_err());
    }

    #[test]
    fn test_compile_rejects_invalid_schema() {
        assert!(CompiledSchema::compile(&json!({ "type": "not-a-type" })).is_err());
    }
}
