//! Flow engine core: IR validation, planning, and execution.
//!
//! - `definition` -- document parsing and accumulated validation into a `Flow`
//! - `dag` -- execution plan with topological layers
//! - `schema` -- compiled JSON Schemas for ports and prompt outputs
//! - `context` -- immutable run context and template rendering
//! - `state` -- request- and session-scoped node state
//! - `expression` -- JEXL evaluator for edge conditions and inline transforms
//! - `dispatch` -- operation registry and capability invocation
//! - `retry` -- attempt and backoff policy
//! - `executor` -- ready-set parallel executor

pub mod context;
pub mod dag;
pub mod definition;
pub mod dispatch;
pub mod executor;
pub mod expression;
pub mod retry;
pub mod schema;
pub mod state;
