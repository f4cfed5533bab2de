//! Shard Executor
//!
//! The runtime that evaluates one loaded shard. The serving path only sees
//! [`ShardExecutor`]; [`GraphInterpreter`] is the built-in implementation
//! that walks the node list with candle ops.

use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

use byteorder::{ByteOrder, LittleEndian};
use candle_core::{DType, Device, Tensor, D};
use duoshard_graph::{load_model, ElementType, GraphError, GraphModel, Initializer, LoadMode, OpNode, ValueInfo};
use tracing::{debug, info};

use crate::error::ExecutorError;

/// Anything that can run a shard forward pass
pub trait ShardExecutor: Send {
    /// Declared graph inputs, in order
    fn inputs(&self) -> &[ValueInfo];

    /// Declared graph outputs, in order
    fn outputs(&self) -> &[ValueInfo];

    /// Run one forward pass
    fn run(&mut self, inputs: HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>, ExecutorError>;
}

/// Candle dtype used to hold tensors of the given element type
pub fn dtype_for(element_type: ElementType) -> Result<DType, ExecutorError> {
    let dtype = match element_type {
        ElementType::Float => DType::F32,
        ElementType::Double => DType::F64,
        ElementType::Float16 => DType::F16,
        ElementType::Bfloat16 => DType::BF16,
        ElementType::Int64 => DType::I64,
        ElementType::Int32 | ElementType::Uint32 => DType::U32,
        ElementType::Uint8 | ElementType::Bool => DType::U8,
        ElementType::Int8 | ElementType::Int16 | ElementType::Uint16 | ElementType::Uint64 => DType::I64,
        ElementType::Undefined | ElementType::String => {
            return Err(ExecutorError::UnsupportedDtype(format!("{:?}", element_type)))
        }
    };
    Ok(dtype)
}

/// Build a tensor from an initializer's raw little-endian payload
pub fn initializer_tensor(init: &Initializer, device: &Device) -> Result<Tensor, ExecutorError> {
    let bytes = init
        .inline_bytes()
        .ok_or_else(|| GraphError::MissingData(init.name.clone()))?;
    if let Some(expected) = init.expected_len() {
        if bytes.len() != expected {
            return Err(GraphError::InvalidData {
                name: init.name.clone(),
                reason: format!("expected {} bytes, found {}", expected, bytes.len()),
            }
            .into());
        }
    }

    let shape: Vec<usize> = init.dims.iter().map(|d| (*d).max(0) as usize).collect();
    let tensor = match init.element_type {
        ElementType::Int8 => widen(bytes, 1, |b| b[0] as i8 as i64, &shape, device)?,
        ElementType::Int16 => widen(bytes, 2, |b| LittleEndian::read_i16(b) as i64, &shape, device)?,
        ElementType::Uint16 => widen(bytes, 2, |b| LittleEndian::read_u16(b) as i64, &shape, device)?,
        ElementType::Uint64 => widen(bytes, 8, |b| LittleEndian::read_u64(b) as i64, &shape, device)?,
        other => Tensor::from_raw_buffer(bytes, dtype_for(other)?, &shape, device)?,
    };
    Ok(tensor)
}

fn widen(
    bytes: &[u8],
    width: usize,
    read: impl Fn(&[u8]) -> i64,
    shape: &[usize],
    device: &Device,
) -> Result<Tensor, ExecutorError> {
    let values: Vec<i64> = bytes.chunks_exact(width).map(read).collect();
    Ok(Tensor::from_vec(values, shape, device)?)
}

/// Reference executor: evaluates nodes in stored order on the CPU
pub struct GraphInterpreter {
    model: GraphModel,
    weights: HashMap<String, Tensor>,
}

impl GraphInterpreter {
    /// Load a shard descriptor together with its weights
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ExecutorError> {
        let path = path.as_ref();
        info!("🔧 Loading shard from {}", path.display());
        let model = load_model(path, LoadMode::WithData)?;
        Self::from_model(model)
    }

    pub fn from_model(model: GraphModel) -> Result<Self, ExecutorError> {
        model.validate()?;
        let mut weights = HashMap::with_capacity(model.initializers.len());
        for init in &model.initializers {
            weights.insert(init.name.clone(), initializer_tensor(init, &Device::Cpu)?);
        }

        info!(
            "✅ Shard '{}' ready: {} nodes, {} weights, {} inputs",
            model.name,
            model.nodes.len(),
            weights.len(),
            model.graph_inputs.len()
        );

        Ok(Self { model, weights })
    }

    pub fn model(&self) -> &GraphModel {
        &self.model
    }

    fn eval_node(&self, node: &OpNode, values: &HashMap<String, Tensor>) -> Result<Vec<Tensor>, ExecutorError> {
        let input = |i: usize| -> Result<&Tensor, ExecutorError> {
            let name = node
                .inputs
                .get(i)
                .ok_or_else(|| ExecutorError::MissingInput(format!("{}[{}]", node.display_name(), i)))?;
            values
                .get(name)
                .ok_or_else(|| ExecutorError::MissingInput(name.clone()))
        };

        let out = match node.op_type.as_str() {
            "Identity" => input(0)?.clone(),
            "Add" => input(0)?.broadcast_add(input(1)?)?,
            "Sub" => input(0)?.broadcast_sub(input(1)?)?,
            "Mul" => input(0)?.broadcast_mul(input(1)?)?,
            "Div" => input(0)?.broadcast_div(input(1)?)?,
            "MatMul" => input(0)?.broadcast_matmul(input(1)?)?,
            "Relu" => input(0)?.relu()?,
            "Sigmoid" => candle_nn::ops::sigmoid(input(0)?)?,
            "Tanh" => input(0)?.tanh()?,
            "Gather" => {
                if node.attr_int("axis").unwrap_or(0) != 0 {
                    return Err(invalid_attr(node, "axis"));
                }
                let data = input(0)?;
                let indices = input(1)?;
                let mut shape = indices.dims().to_vec();
                shape.extend_from_slice(&data.dims()[1..]);
                data.index_select(&indices.flatten_all()?, 0)?.reshape(shape)?
            }
            "Softmax" => {
                let x = input(0)?;
                let axis = normalize_axis(node.attr_int("axis").unwrap_or(-1), x.rank())
                    .ok_or_else(|| invalid_attr(node, "axis"))?;
                candle_nn::ops::softmax(x, axis)?
            }
            "Transpose" => {
                let x = input(0)?;
                let perm: Vec<usize> = match node.attr_ints("perm") {
                    Some(perm) => perm
                        .iter()
                        .map(|p| normalize_axis(*p, x.rank()))
                        .collect::<Option<_>>()
                        .ok_or_else(|| invalid_attr(node, "perm"))?,
                    None => (0..x.rank()).rev().collect(),
                };
                if perm.len() != x.rank() {
                    return Err(invalid_attr(node, "perm"));
                }
                x.permute(perm)?
            }
            "SimplifiedLayerNormalization" => {
                let x = input(0)?;
                let scale = input(1)?;
                let eps = node.attr_float("epsilon").unwrap_or(1e-5) as f64;
                let norm = x.sqr()?.mean_keepdim(D::Minus1)?.affine(1.0, eps)?.sqrt()?;
                x.broadcast_div(&norm)?.broadcast_mul(scale)?
            }
            "Cast" => {
                let to = node
                    .attr_int("to")
                    .and_then(ElementType::from_code)
                    .ok_or_else(|| invalid_attr(node, "to"))?;
                input(0)?.to_dtype(dtype_for(to)?)?
            }
            other => return Err(ExecutorError::UnsupportedOp(other.to_string())),
        };

        Ok(vec![out])
    }
}

fn invalid_attr(node: &OpNode, attribute: &str) -> ExecutorError {
    ExecutorError::InvalidAttribute {
        node: node.display_name(),
        attribute: attribute.to_string(),
    }
}

fn normalize_axis(axis: i64, rank: usize) -> Option<usize> {
    let axis = if axis < 0 { axis + rank as i64 } else { axis };
    (0..rank as i64).contains(&axis).then_some(axis as usize)
}

impl ShardExecutor for GraphInterpreter {
    fn inputs(&self) -> &[ValueInfo] {
        &self.model.graph_inputs
    }

    fn outputs(&self) -> &[ValueInfo] {
        &self.model.graph_outputs
    }

    fn run(&mut self, mut inputs: HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>, ExecutorError> {
        let start = Instant::now();

        let mut values = self.weights.clone();
        for info in &self.model.graph_inputs {
            // Weights shadow inputs of the same name
            if values.contains_key(&info.name) {
                continue;
            }
            let tensor = inputs
                .remove(&info.name)
                .ok_or_else(|| ExecutorError::MissingInput(info.name.clone()))?;
            values.insert(info.name.clone(), tensor);
        }

        for node in &self.model.nodes {
            let results = self.eval_node(node, &values)?;
            for (name, tensor) in node.outputs.iter().zip(results) {
                values.insert(name.clone(), tensor);
            }
        }

        let mut outputs = HashMap::with_capacity(self.model.graph_outputs.len());
        for info in &self.model.graph_outputs {
            let tensor = values
                .remove(&info.name)
                .ok_or_else(|| ExecutorError::MissingOutput(info.name.clone()))?;
            outputs.insert(info.name.clone(), tensor);
        }

        debug!(
            "⚡ Shard '{}' forward pass in {}ms",
            self.model.name,
            start.elapsed().as_millis()
        );
        Ok(outputs)
    }
}
