//! Business logic and capability traits for agentflow.
//!
//! This crate defines the flow compiler and execution engine plus the "ports"
//! (capability traits) that a host embedding implements: operations, code
//! runtimes, model providers, and session state backends. It depends only on
//! `agentflow-types` -- never on `agentflow-infra` or any database/IO crate.

pub mod flow;
pub mod llm;
pub mod storage;
