//! Shared domain types for agentflow.
//!
//! This crate contains the intermediate representation (IR) of an agent flow,
//! the run result surface, the error taxonomy, and engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod flow;
pub mod run;
