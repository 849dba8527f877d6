//! CLI command definitions for the `aflow` binary.

pub mod flow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Validate, plan and run agentflow IR documents.
#[derive(Parser)]
#[command(name = "aflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Engine config file (defaults to ./engine.toml).
    #[arg(long, global = true, env = "AGENTFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate an IR document and list every problem found.
    Validate {
        /// Path to the IR file (.yaml, .yml or .json).
        file: PathBuf,
    },

    /// Print the execution layers of a valid IR document.
    Plan {
        /// Path to the IR file.
        file: PathBuf,
    },

    /// Run a flow with the built-in operations.
    Run {
        /// Path to the IR file.
        file: PathBuf,

        /// Boundary input as name=value (value parsed as JSON, else a string).
        #[arg(short, long = "input", value_name = "NAME=VALUE")]
        inputs: Vec<String>,

        /// Context field as name=value (user_id, session_id, ...).
        #[arg(short, long = "field", value_name = "NAME=VALUE")]
        fields: Vec<String>,

        /// Run deadline in milliseconds.
        #[arg(long)]
        deadline_ms: Option<u64>,

        /// Persist session state in this SQLite database instead of memory.
        #[arg(long, value_name = "URL")]
        state_db: Option<String>,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
