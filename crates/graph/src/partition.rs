//! Graph partitioner
//!
//! Cuts a full model at a named boundary tensor (the gate) into an early
//! shard that ends by producing the gate and a late shard that starts at the
//! first node reading it. Each shard gets its own external inputs, cloned
//! weights, output declaration and version stamp.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::error::PartitionError;
use crate::model::{
    Dim, ElementType, GraphModel, OpNode, OpsetImport, ValueInfo, DEFAULT_DOMAIN,
    DEFAULT_OPSET, IR_VERSION,
};

/// Boundary tensor between layer 15 and layer 16 of the served model
pub const DEFAULT_GATE: &str = "/model/layers.16/input_layernorm/output_0";
/// Declared output of the full model
pub const DEFAULT_FINAL_OUTPUT: &str = "logits";
/// Suffix appended to the gate when the late shard's input is renamed
pub const BOUNDARY_INPUT_SUFFIX: &str = "_input";

#[derive(Debug, Clone)]
pub struct PartitionConfig {
    /// Tensor at which the graph is cut
    pub gate: String,
    /// Output of the source model the late shard declares
    pub final_output: String,
    /// Hidden width used when the gate has no recorded shape
    pub hidden_size: Option<i64>,
    /// Rename the gate to `<gate>_input` inside the late shard
    pub rename_boundary_input: bool,
    pub early_name: String,
    pub late_name: String,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self::new(DEFAULT_GATE)
    }
}

impl PartitionConfig {
    pub fn new(gate: &str) -> Self {
        Self {
            gate: gate.to_string(),
            final_output: DEFAULT_FINAL_OUTPUT.to_string(),
            hidden_size: None,
            rename_boundary_input: false,
            early_name: "early_shard".to_string(),
            late_name: "late_shard".to_string(),
        }
    }

    pub fn with_final_output(mut self, name: &str) -> Self {
        self.final_output = name.to_string();
        self
    }

    pub fn with_hidden_size(mut self, hidden_size: i64) -> Self {
        self.hidden_size = Some(hidden_size);
        self
    }

    pub fn with_boundary_rename(mut self, rename: bool) -> Self {
        self.rename_boundary_input = rename;
        self
    }

    /// Name the late shard uses for the gate tensor
    pub fn late_gate_name(&self) -> String {
        if self.rename_boundary_input {
            format!("{}{}", self.gate, BOUNDARY_INPUT_SUFFIX)
        } else {
            self.gate.clone()
        }
    }
}

/// The two halves of a partitioned model
#[derive(Debug, Clone)]
pub struct ShardPair {
    pub early: GraphModel,
    pub late: GraphModel,
}

pub struct Partitioner {
    config: PartitionConfig,
}

impl Partitioner {
    pub fn new(config: PartitionConfig) -> Self {
        Self { config }
    }

    /// Split `graph`. Initializers on `graph` are cloned into whichever shard
    /// reads them, so pass a model loaded with its data when the shards are
    /// going to be saved.
    pub fn partition(&self, graph: &GraphModel) -> Result<ShardPair, PartitionError> {
        let gate = self.config.gate.as_str();

        let early_nodes = early_slice(&graph.nodes, gate)?;
        let late_nodes = late_slice(&graph.nodes, gate);
        if late_nodes.is_empty() {
            return Err(PartitionError::GateNotConsumed(gate.to_string()));
        }
        info!(
            "✂️ Cut at '{}': {} early nodes, {} late nodes (of {})",
            gate,
            early_nodes.len(),
            late_nodes.len(),
            graph.nodes.len()
        );
        if let (Some(producer), Some(consumer)) = (graph.producer_of(gate), graph.first_consumer_of(gate)) {
            if consumer <= producer {
                warn!(
                    "⚠️ Gate '{}' is read by node #{} before node #{} produces it",
                    gate, consumer, producer
                );
            } else {
                debug!("Gate produced by node #{}, first read by node #{}", producer, consumer);
            }
        }

        let late_output = graph
            .graph_output(&self.config.final_output)
            .cloned()
            .ok_or_else(|| PartitionError::OutputNotDeclared(self.config.final_output.clone()))?;

        let early = assemble(graph, &self.config.early_name, early_nodes, vec![self.gate_output(graph)]);
        let mut late = assemble(graph, &self.config.late_name, late_nodes, vec![late_output]);

        let crossing: Vec<&str> = late
            .graph_inputs
            .iter()
            .map(|i| i.name.as_str())
            .filter(|name| *name != gate && graph.graph_input(name).is_none())
            .collect();
        if !crossing.is_empty() {
            warn!(
                "⚠️ Late shard needs {} activation(s) besides the gate: {:?}",
                crossing.len(),
                crossing
            );
        }

        if self.config.rename_boundary_input {
            rename_tensor(&mut late, gate, &self.config.late_gate_name());
        }

        Ok(ShardPair { early, late })
    }

    /// Declared output of the early shard. Uses the recorded type of the
    /// gate when there is one, otherwise `float[batch, sequence, hidden]`.
    fn gate_output(&self, graph: &GraphModel) -> ValueInfo {
        if let Some(info) = graph.value_info.iter().find(|v| v.name == self.config.gate) {
            return info.clone();
        }
        let hidden = self
            .config
            .hidden_size
            .map(Dim::Fixed)
            .unwrap_or_else(|| Dim::symbolic("hidden"));
        ValueInfo::new(
            &self.config.gate,
            ElementType::Float,
            vec![Dim::symbolic("batch"), Dim::symbolic("sequence"), hidden],
        )
    }
}

/// Cut `graph` at `gate` with default settings, returning `(early, late)`.
pub fn partition(graph: &GraphModel, gate: &str) -> Result<(GraphModel, GraphModel), PartitionError> {
    let pair = Partitioner::new(PartitionConfig::new(gate)).partition(graph)?;
    Ok((pair.early, pair.late))
}

/// Nodes up to and including the first producer of `gate`.
pub fn early_slice(nodes: &[OpNode], gate: &str) -> Result<Vec<OpNode>, PartitionError> {
    let mut slice = Vec::new();
    for node in nodes {
        slice.push(node.clone());
        if node.produces(gate) {
            return Ok(slice);
        }
    }
    Err(PartitionError::GateNotFound(gate.to_string()))
}

/// Nodes from the first consumer of `gate` to the end.
pub fn late_slice(nodes: &[OpNode], gate: &str) -> Vec<OpNode> {
    let mut found = false;
    let mut slice = Vec::new();
    for node in nodes {
        if node.consumes(gate) {
            found = true;
        }
        if found {
            slice.push(node.clone());
        }
    }
    slice
}

/// Every non-empty input read by `nodes` that none of them produces, in
/// first-reference order.
pub fn external_inputs(nodes: &[OpNode]) -> Vec<String> {
    let internal: HashSet<&str> = nodes
        .iter()
        .flat_map(|n| n.outputs.iter().map(String::as_str))
        .collect();

    let mut seen = HashSet::new();
    let mut missing = Vec::new();
    for node in nodes {
        for input in &node.inputs {
            if input.is_empty() || internal.contains(input.as_str()) {
                continue;
            }
            if seen.insert(input.as_str()) {
                missing.push(input.clone());
            }
        }
    }
    missing
}

fn assemble(source: &GraphModel, name: &str, nodes: Vec<OpNode>, outputs: Vec<ValueInfo>) -> GraphModel {
    let missing = external_inputs(&nodes);

    let mut initializers = Vec::new();
    let mut graph_inputs = Vec::new();
    for tensor in &missing {
        // A weight wins over a graph input declared under the same name
        if let Some(init) = source.initializer(tensor) {
            initializers.push(init.clone());
        } else {
            let info = source.find_value_info(tensor).cloned().unwrap_or_else(|| {
                debug!("No type record for '{}', declaring it with unknown shape", tensor);
                ValueInfo::unknown(tensor)
            });
            graph_inputs.push(info);
        }
    }

    let produced: HashSet<&str> = nodes
        .iter()
        .flat_map(|n| n.outputs.iter().map(String::as_str))
        .collect();
    let value_info = source
        .value_info
        .iter()
        .filter(|v| produced.contains(v.name.as_str()))
        .cloned()
        .collect();

    let mut opset_imports = vec![OpsetImport::new(DEFAULT_DOMAIN, DEFAULT_OPSET)];
    opset_imports.extend(source.custom_opsets().cloned());

    info!(
        "  📦 {}: {} nodes, {} weights cloned, {} graph inputs",
        name,
        nodes.len(),
        initializers.len(),
        graph_inputs.len()
    );

    GraphModel {
        name: name.to_string(),
        producer_name: source.producer_name.clone(),
        ir_version: IR_VERSION,
        opset_imports,
        nodes,
        initializers,
        graph_inputs,
        graph_outputs: outputs,
        value_info,
    }
}

fn rename_tensor(model: &mut GraphModel, from: &str, to: &str) {
    for input in model.graph_inputs.iter_mut().filter(|i| i.name == from) {
        input.name = to.to_string();
    }
    for node in model.nodes.iter_mut() {
        for input in node.inputs.iter_mut().filter(|i| i.as_str() == from) {
            *input = to.to_string();
        }
    }
}
