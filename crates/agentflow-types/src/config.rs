//! Engine configuration types.
//!
//! `EngineConfig` represents the `engine.toml` that tunes the execution
//! engine for a host embedding.

use serde::{Deserialize, Serialize};

/// Engine-wide execution settings. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on concurrently executing nodes within one run.
    #[serde(default = "default_max_parallel_nodes")]
    pub max_parallel_nodes: usize,

    /// Run-level deadline in milliseconds (None = no deadline).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_ms: Option<u64>,

    /// How the delay between retry attempts is derived from a node's
    /// `retry_backoff`.
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

fn default_max_parallel_nodes() -> usize {
    16
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: default_max_parallel_nodes(),
            run_timeout_ms: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Retry delay policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Wait exactly `retry_backoff` between attempts.
    #[default]
    Fixed,
    /// Multiply the delay by `factor` after every failed attempt, capped at
    /// `max_ms`.
    Exponential { factor: f64, max_ms: u64 },
}
