//! Observability setup for agentflow binaries.

pub mod tracing_setup;
