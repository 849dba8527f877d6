//! Infrastructure layer for agentflow.
//!
//! Implements the storage traits defined in `agentflow-core`: an in-memory
//! and a SQLite session state backend. Also hosts the engine config loader
//! and the built-in declarative operations used by the `aflow` binary.

pub mod config;
pub mod ops;
pub mod sqlite;
pub mod state;
