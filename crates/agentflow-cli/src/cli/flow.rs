//! Flow subcommands: validate, plan and run.

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use serde_json::{json, Map, Value};

use agentflow_core::flow::dag::{build_execution_plan, ExecutionPlan};
use agentflow_core::flow::definition::{load_flow_file, Flow, FlowError};
use agentflow_core::flow::dispatch::Dispatcher;
use agentflow_core::flow::executor::FlowEngine;
use agentflow_core::flow::state::StateBackends;
use agentflow_infra::ops::builtin_registry;
use agentflow_infra::sqlite::pool::DatabasePool;
use agentflow_infra::sqlite::state::SqliteStateBackend;
use agentflow_infra::state::memory::InMemoryStateBackend;
use agentflow_types::config::EngineConfig;
use agentflow_types::run::{NodeStatus, RunRequest, RunResult, RunStatus};

/// Arguments of `aflow run` after clap parsing.
pub struct RunArgs {
    pub inputs: Vec<String>,
    pub fields: Vec<String>,
    pub deadline_ms: Option<u64>,
    pub state_db: Option<String>,
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

pub fn handle_validate(file: &Path, json: bool) -> Result<()> {
    match load_flow_file(file) {
        Ok(flow) => {
            if json {
                let out = json!({
                    "valid": true,
                    "name": flow.name(),
                    "nodes": flow.nodes().len(),
                    "edges": flow.edges().len(),
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!(
                    "  {} '{}' is valid ({} nodes, {} edges)",
                    style("✓").green().bold(),
                    style(flow.name()).cyan(),
                    flow.nodes().len(),
                    flow.edges().len()
                );
            }
            Ok(())
        }
        Err(FlowError::Invalid(errors)) => {
            if json {
                let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
                let out = json!({ "valid": false, "errors": messages });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!();
                println!(
                    "  {} {} has {} problem(s):",
                    style("✗").red().bold(),
                    file.display(),
                    errors.len()
                );
                for error in &errors {
                    println!("    - {error}");
                }
                println!();
            }
            bail!("validation failed with {} error(s)", errors.len())
        }
        Err(other) => Err(anyhow!("Failed to load {}: {other}", file.display())),
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

pub fn handle_plan(file: &Path, json: bool) -> Result<()> {
    let plan = load_plan(file)?;

    if json {
        let layers = plan.layer_ids();
        let out = json!({ "name": plan.flow().name(), "layers": layers });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Layer").fg(Color::Cyan),
            Cell::new("Nodes"),
            Cell::new("Depends on"),
        ]);

    for (depth, layer) in plan.layer_ids().iter().enumerate() {
        let deps: Vec<String> = layer
            .iter()
            .map(|id| format!("{id} <- [{}]", plan.dependencies_of(id).join(", ")))
            .collect();
        table.add_row(vec![
            Cell::new(depth),
            Cell::new(layer.join(", ")),
            Cell::new(deps.join("\n")),
        ]);
    }

    println!();
    println!("  Plan for '{}'", style(plan.flow().name()).cyan());
    println!("{table}");
    Ok(())
}

fn load_plan(file: &Path) -> Result<ExecutionPlan> {
    let flow = load_flow(file)?;
    build_execution_plan(flow).map_err(|e| anyhow!("Failed to plan {}: {e}", file.display()))
}

fn load_flow(file: &Path) -> Result<Arc<Flow>> {
    let flow = load_flow_file(file).map_err(|e| match e {
        FlowError::Invalid(errors) => anyhow!(
            "{} is invalid:\n{}",
            file.display(),
            errors
                .iter()
                .map(|e| format!("  - {e}"))
                .collect::<Vec<_>>()
                .join("\n")
        ),
        other => anyhow!("Failed to load {}: {other}", file.display()),
    })?;
    Ok(Arc::new(flow))
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn handle_run(file: &Path, args: RunArgs, config: EngineConfig, json: bool) -> Result<()> {
    let flow = load_flow(file)?;

    let mut request = RunRequest {
        inputs: parse_assignments(&args.inputs).context("invalid --input")?,
        fields: parse_assignments(&args.fields).context("invalid --field")?,
        deadline_ms: args.deadline_ms,
    };
    let trace_id = match request.fields.get("trace_id").and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => {
            let id = uuid::Uuid::now_v7().to_string();
            request.fields.insert("trace_id".to_string(), Value::String(id.clone()));
            id
        }
    };

    let backends = match &args.state_db {
        Some(url) => {
            let pool = DatabasePool::new(url)
                .await
                .with_context(|| format!("Failed to open state database {url}"))?;
            StateBackends::new().with_default(SqliteStateBackend::new(pool))
        }
        None => StateBackends::new().with_default(InMemoryStateBackend::new()),
    };

    let engine = Arc::new(
        FlowEngine::new(Dispatcher::new(builtin_registry()))
            .with_config(config)
            .with_state_backends(backends),
    );

    let mut run = {
        let engine = engine.clone();
        let flow = flow.clone();
        tokio::spawn(async move { engine.execute(&flow, request).await })
    };

    let result = tokio::select! {
        joined = &mut run => joined,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!(%trace_id, "interrupted, cancelling run");
            engine.cancel(&trace_id);
            run.await
        }
    };
    let result = result
        .context("run task failed")?
        .map_err(|e| anyhow!("Run could not start: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(flow.name(), &result);
    }

    match result.status {
        RunStatus::Succeeded => Ok(()),
        status => bail!("run {status}"),
    }
}

/// Parse `name=value` pairs. Values that parse as JSON keep their type;
/// anything else is taken as a plain string.
pub fn parse_assignments(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for pair in pairs {
        let (name, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("expected NAME=VALUE, got '{pair}'"))?;
        let name = name.trim();
        if name.is_empty() {
            bail!("empty name in '{pair}'");
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        map.insert(name.to_string(), value);
    }
    Ok(map)
}

fn print_result(name: &str, result: &RunResult) {
    println!();
    let status = match result.status {
        RunStatus::Succeeded => style(result.status.to_string()).green().bold(),
        RunStatus::Failed => style(result.status.to_string()).red().bold(),
        RunStatus::Aborted => style(result.status.to_string()).yellow().bold(),
    };
    println!("  Run of '{}': {status}", style(name).cyan());
    println!("  Run ID:   {}", result.run_id);
    println!("  Trace ID: {}", result.trace_id);

    if !result.trace.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Node").fg(Color::Cyan),
                Cell::new("Status"),
                Cell::new("Attempts"),
                Cell::new("Duration"),
                Cell::new("Error"),
            ]);
        for record in &result.trace {
            table.add_row(vec![
                Cell::new(&record.node_id),
                format_status(record.status),
                Cell::new(record.attempts),
                Cell::new(format!("{}ms", record.duration_ms)),
                Cell::new(record.error.as_ref().map(|e| e.message.as_str()).unwrap_or("-")),
            ]);
        }
        println!("{table}");
    }

    if !result.boundary_outputs.is_empty() {
        println!("  Outputs:");
        for (port, value) in &result.boundary_outputs {
            println!("    {} = {value}", style(port).bold());
        }
    }
    if let Some(error) = &result.error {
        println!("  {} {error}", style("Error:").red().bold());
    }
    println!();
}

fn format_status(status: NodeStatus) -> Cell {
    match status {
        NodeStatus::Succeeded => Cell::new("succeeded").fg(Color::Green),
        NodeStatus::Failed => Cell::new("failed").fg(Color::Red),
        NodeStatus::Routed => Cell::new("routed").fg(Color::Magenta),
        NodeStatus::Skipped => Cell::new("skipped").fg(Color::DarkGrey),
        NodeStatus::Cancelled => Cell::new("cancelled").fg(Color::DarkYellow),
    }
}
