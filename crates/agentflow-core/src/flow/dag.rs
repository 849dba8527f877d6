//! Execution plan: topological layers over the node graph.
//!
//! Uses `petgraph` to model node-to-node edges as a directed graph.
//! Topological sort guards acyclicity, and depth-based grouping produces
//! layers where every dependency of a layer-k node lives in a layer below k.
//! Edge conditions are not evaluated here; the plan is purely structural.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use agentflow_types::flow::{Endpoint, Node};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use super::definition::{Flow, FlowError};
use super::schema::CompiledSchema;

/// Compiled port schemas keyed by (node index, port name).
pub type PortSchemas = HashMap<(usize, String), CompiledSchema>;

/// A flow prepared for execution.
///
/// Nodes are referred to by their index in `Flow::nodes()` and edges by
/// their index in `Flow::edges()`.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    flow: Arc<Flow>,
    layers: Vec<Vec<usize>>,
    layer_of: Vec<usize>,
    incoming: Vec<Vec<usize>>,
    outgoing: Vec<Vec<usize>>,
    input_edges: Vec<usize>,
    output_edges: Vec<usize>,
    schemas: Arc<PortSchemas>,
}

impl ExecutionPlan {
    pub fn flow(&self) -> &Arc<Flow> {
        &self.flow
    }

    /// Node indices per layer, each layer in document order.
    pub fn layers(&self) -> &[Vec<usize>] {
        &self.layers
    }

    /// Node ids per layer.
    pub fn layer_ids(&self) -> Vec<Vec<&str>> {
        self.layers
            .iter()
            .map(|layer| layer.iter().map(|&i| self.node(i).id.as_str()).collect())
            .collect()
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.flow.nodes()[index]
    }

    pub fn layer_of(&self, node_id: &str) -> Option<usize> {
        self.flow.node_index(node_id).map(|i| self.layer_of[i])
    }

    pub(crate) fn layer_of_index(&self, index: usize) -> usize {
        self.layer_of[index]
    }

    /// Edges delivering into a node, in document order.
    pub fn incoming(&self, index: usize) -> &[usize] {
        &self.incoming[index]
    }

    /// Edges leaving a node, in document order.
    pub fn outgoing(&self, index: usize) -> &[usize] {
        &self.outgoing[index]
    }

    /// Edges sourced at `_input`.
    pub fn input_edges(&self) -> &[usize] {
        &self.input_edges
    }

    /// Edges targeting `_output`.
    pub fn output_edges(&self) -> &[usize] {
        &self.output_edges
    }

    pub fn schema(&self, index: usize, port: &str) -> Option<&CompiledSchema> {
        self.schemas.get(&(index, port.to_string()))
    }

    pub(crate) fn schemas(&self) -> &Arc<PortSchemas> {
        &self.schemas
    }

    /// Every node `node_id` transitively depends on, sorted by id.
    pub fn dependencies_of(&self, node_id: &str) -> Vec<&str> {
        let Some(start) = self.flow.node_index(node_id) else {
            return Vec::new();
        };
        let mut seen = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(index) = stack.pop() {
            for &e in &self.incoming[index] {
                if let Some(dep) = self.flow.edges()[e]
                    .source
                    .node_id()
                    .and_then(|id| self.flow.node_index(id))
                {
                    if seen.insert(dep) {
                        stack.push(dep);
                    }
                }
            }
        }
        let mut ids: Vec<&str> = seen.into_iter().map(|i| self.node(i).id.as_str()).collect();
        ids.sort_unstable();
        ids
    }
}

/// Build an execution plan from a validated flow.
///
/// 1. Build a `DiGraph` over node indices with one edge per node-to-node
///    flow edge.
/// 2. Run `petgraph::algo::toposort` to verify acyclicity.
/// 3. Compute each node's depth (max predecessor depth + 1).
/// 4. Group nodes by depth into layers.
/// 5. Compile every port `validation_schema` once.
pub fn build_execution_plan(flow: Arc<Flow>) -> Result<ExecutionPlan, FlowError> {
    let node_count = flow.nodes().len();
    let mut graph = DiGraph::<usize, ()>::with_capacity(node_count, flow.edges().len());
    let indices: Vec<NodeIndex> = (0..node_count).map(|i| graph.add_node(i)).collect();

    let mut incoming = vec![Vec::new(); node_count];
    let mut outgoing = vec![Vec::new(); node_count];
    let mut input_edges = Vec::new();
    let mut output_edges = Vec::new();

    for (e, edge) in flow.edges().iter().enumerate() {
        let source = resolve(&flow, &edge.source.endpoint, e)?;
        let target = resolve(&flow, &edge.target.endpoint, e)?;
        match edge.source.endpoint {
            Endpoint::Input => input_edges.push(e),
            _ => {
                if let Some(s) = source {
                    outgoing[s].push(e);
                }
            }
        }
        match edge.target.endpoint {
            Endpoint::Output => output_edges.push(e),
            _ => {
                if let Some(t) = target {
                    incoming[t].push(e);
                }
            }
        }
        if let (Some(s), Some(t)) = (source, target) {
            graph.update_edge(indices[s], indices[t], ());
        }
    }

    // Topological sort -- detects cycles
    let sorted = toposort(&graph, None).map_err(|cycle| {
        let id = &flow.nodes()[graph[cycle.node_id()]].id;
        FlowError::PlanError(format!("cycle detected involving node '{id}'"))
    })?;

    let mut layer_of = vec![0usize; node_count];
    for &n in &sorted {
        let depth = graph
            .neighbors_directed(n, Direction::Incoming)
            .map(|pred| layer_of[graph[pred]] + 1)
            .max()
            .unwrap_or(0);
        layer_of[graph[n]] = depth;
    }

    let layer_count = layer_of.iter().max().map_or(0, |d| d + 1);
    let mut layers = vec![Vec::new(); layer_count];
    for (index, &depth) in layer_of.iter().enumerate() {
        layers[depth].push(index);
    }

    let mut schemas = PortSchemas::new();
    for (index, node) in flow.nodes().iter().enumerate() {
        for port in node
            .input_ports
            .iter()
            .chain(node.output_ports.iter())
            .chain(node.error_port.iter())
        {
            if let Some(schema) = &port.validation_schema {
                let compiled = CompiledSchema::compile(schema).map_err(|reason| {
                    FlowError::PlanError(format!(
                        "schema of port '{}.{}' does not compile: {reason}",
                        node.id, port.name
                    ))
                })?;
                schemas.insert((index, port.name.clone()), compiled);
            }
        }
    }

    tracing::debug!(
        flow = flow.name(),
        nodes = node_count,
        layers = layers.len(),
        "execution plan built"
    );

    Ok(ExecutionPlan {
        flow,
        layers,
        layer_of,
        incoming,
        outgoing,
        input_edges,
        output_edges,
        schemas: Arc::new(schemas),
    })
}

fn resolve(flow: &Flow, endpoint: &Endpoint, edge: usize) -> Result<Option<usize>, FlowError> {
    match endpoint {
        Endpoint::Node(id) => flow
            .node_index(id)
            .map(Some)
            .ok_or_else(|| FlowError::PlanError(format!("edge {edge} references unknown node '{id}'"))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::definition::compile_flow_yaml;

    const DIAMOND: &str = r#"
version: "1.0"
nodes:
  fetch_b:
    input_ports: [{ name: q, type: string }]
    output_ports: [{ name: rows, type: table, validation_schema: { type: array } }]
    transform: { kind: declarative, op_name: search }
  fetch_a:
    input_ports: [{ name: q, type: string }]
    output_ports: [{ name: rows, type: table }]
    transform: { kind: declarative, op_name: search }
  combine:
    input_ports:
      - { name: left, type: array }
      - { name: right, type: array }
    output_ports: [{ name: summary, type: string }]
    transform: { kind: code, body: "" }
  audit:
    transform: { kind: code, body: "" }
  report:
    input_ports: [{ name: text, type: string }]
    output_ports: [{ name: out, type: string }]
    transform: { kind: code, body: "" }
edges:
  - { from: _input.question, to: fetch_a.q }
  - { from: _input.question, to: fetch_b.q }
  - { from: fetch_a.rows, to: combine.left }
  - { from: fetch_b.rows, to: combine.right }
  - { from: combine.summary, to: report.text }
  - { from: report.out, to: _output.answer }
"#;

    fn plan() -> ExecutionPlan {
        let flow = Arc::new(compile_flow_yaml(DIAMOND).unwrap());
        build_execution_plan(flow).unwrap()
    }

    #[test]
    fn test_layers_respect_dependencies() {
        let plan = plan();
        assert_eq!(
            plan.layer_ids(),
            vec![
                vec!["fetch_b", "fetch_a", "audit"],
                vec!["combine"],
                vec!["report"],
            ]
        );
        for edge in plan.flow().edges() {
            if let (Some(s), Some(t)) = (edge.source.node_id(), edge.target.node_id()) {
                assert!(plan.layer_of(s).unwrap() < plan.layer_of(t).unwrap());
            }
        }
    }

    #[test]
    fn test_edge_indices() {
        let plan = plan();
        assert_eq!(plan.input_edges(), &[0, 1]);
        assert_eq!(plan.output_edges(), &[5]);
        let combine = plan.flow().node_index("combine").unwrap();
        assert_eq!(plan.incoming(combine), &[2, 3]);
        assert_eq!(plan.outgoing(combine), &[4]);
    }

    #[test]
    fn test_dependencies_of_is_transitive() {
        let plan = plan();
        assert_eq!(plan.dependencies_of("report"), vec!["combine", "fetch_a", "fetch_b"]);
        assert!(plan.dependencies_of("audit").is_empty());
        assert!(plan.dependencies_of("missing").is_empty());
    }

    #[test]
    fn test_schemas_compiled_once() {
        let plan = plan();
        let fetch_b = plan.flow().node_index("fetch_b").unwrap();
        assert!(plan.schema(fetch_b, "rows").is_some());
        assert!(plan.schema(fetch_b, "q").is_none());
    }

    #[test]
    fn test_empty_flow() {
        let flow = Arc::new(compile_flow_yaml("version: \"1.0\"").unwrap());
        let plan = build_execution_plan(flow).unwrap();
        assert!(plan.layers().is_empty());
    }
}
