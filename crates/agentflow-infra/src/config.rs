//! Engine configuration loader.
//!
//! Reads an `engine.toml` and deserializes it into [`EngineConfig`]. Falls
//! back to defaults when the file is missing or malformed.

use std::path::Path;

use agentflow_types::config::EngineConfig;

/// Default config file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "engine.toml";

/// Load engine configuration from `path`.
///
/// - Missing file: returns [`EngineConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No engine config at {}, using defaults", path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => sanitize(config, path),
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            EngineConfig::default()
        }
    }
}

/// A zero parallelism bound would stall every run.
fn sanitize(mut config: EngineConfig, path: &Path) -> EngineConfig {
    if config.max_parallel_nodes == 0 {
        tracing::warn!(
            "{}: max_parallel_nodes must be at least 1, using {}",
            path.display(),
            EngineConfig::default().max_parallel_nodes
        );
        config.max_parallel_nodes = EngineConfig::default().max_parallel_nodes;
    }
    config
}
