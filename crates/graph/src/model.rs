//! In-memory computation graph
//!
//! Mirrors the parts of an ONNX `ModelProto` the partitioner and the shard
//! executor care about: ordered nodes, initializers, declared inputs/outputs,
//! intermediate type records and opset imports.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::{GraphError, Result};

/// IR version stamped on every shard
pub const IR_VERSION: i64 = 8;
/// Default-domain opset version stamped on every shard
pub const DEFAULT_OPSET: i64 = 21;
/// The default ("ai.onnx") operator domain
pub const DEFAULT_DOMAIN: &str = "";

/// Tensor element type, numbered like ONNX `TensorProto.DataType`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    #[default]
    Undefined,
    Float,
    Uint8,
    Int8,
    Uint16,
    Int16,
    Int32,
    Int64,
    String,
    Bool,
    Float16,
    Double,
    Uint32,
    Uint64,
    Bfloat16,
}

impl ElementType {
    pub fn from_code(code: i64) -> Option<Self> {
        let ty = match code {
            0 => Self::Undefined,
            1 => Self::Float,
            2 => Self::Uint8,
            3 => Self::Int8,
            4 => Self::Uint16,
            5 => Self::Int16,
            6 => Self::Int32,
            7 => Self::Int64,
            8 => Self::String,
            9 => Self::Bool,
            10 => Self::Float16,
            11 => Self::Double,
            12 => Self::Uint32,
            13 => Self::Uint64,
            16 => Self::Bfloat16,
            _ => return None,
        };
        Some(ty)
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::Undefined => 0,
            Self::Float => 1,
            Self::Uint8 => 2,
            Self::Int8 => 3,
            Self::Uint16 => 4,
            Self::Int16 => 5,
            Self::Int32 => 6,
            Self::Int64 => 7,
            Self::String => 8,
            Self::Bool => 9,
            Self::Float16 => 10,
            Self::Double => 11,
            Self::Uint32 => 12,
            Self::Uint64 => 13,
            Self::Bfloat16 => 16,
        }
    }

    /// Width of one element in bytes, `None` for variable-size types
    pub fn size_in_bytes(&self) -> Option<usize> {
        match self {
            Self::Uint8 | Self::Int8 | Self::Bool => Some(1),
            Self::Uint16 | Self::Int16 | Self::Float16 | Self::Bfloat16 => Some(2),
            Self::Float | Self::Int32 | Self::Uint32 => Some(4),
            Self::Double | Self::Int64 | Self::Uint64 => Some(8),
            Self::Undefined | Self::String => None,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Self::Uint8
                | Self::Int8
                | Self::Uint16
                | Self::Int16
                | Self::Int32
                | Self::Int64
                | Self::Uint32
                | Self::Uint64
        )
    }
}

/// One dimension of a declared shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dim {
    Fixed(i64),
    Symbolic(String),
    Unknown,
}

impl Dim {
    pub fn symbolic(name: &str) -> Self {
        Dim::Symbolic(name.to_string())
    }

    pub fn as_fixed(&self) -> Option<i64> {
        match self {
            Dim::Fixed(n) if *n >= 0 => Some(*n),
            _ => None,
        }
    }
}

/// Name, element type and (possibly partial) shape of a tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueInfo {
    pub name: String,
    #[serde(default)]
    pub element_type: ElementType,
    /// `None` when even the rank is unknown
    #[serde(default)]
    pub shape: Option<Vec<Dim>>,
}

impl ValueInfo {
    pub fn new(name: &str, element_type: ElementType, shape: Vec<Dim>) -> Self {
        Self {
            name: name.to_string(),
            element_type,
            shape: Some(shape),
        }
    }

    /// A declaration carrying nothing but the name
    pub fn unknown(name: &str) -> Self {
        Self {
            name: name.to_string(),
            element_type: ElementType::Undefined,
            shape: None,
        }
    }

    pub fn rank(&self) -> Option<usize> {
        self.shape.as_ref().map(|s| s.len())
    }
}

/// Node attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeValue {
    Int(i64),
    Float(f32),
    String(String),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    Strings(Vec<String>),
}

/// A single operation in the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpNode {
    #[serde(default)]
    pub name: String,
    pub op_type: String,
    #[serde(default)]
    pub domain: String,
    /// Empty strings mark unused optional inputs
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl OpNode {
    pub fn new<I, O>(op_type: &str, inputs: I, outputs: O) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        Self {
            name: String::new(),
            op_type: op_type.to_string(),
            domain: DEFAULT_DOMAIN.to_string(),
            inputs: inputs.into_iter().map(Into::into).collect(),
            outputs: outputs.into_iter().map(Into::into).collect(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_domain(mut self, domain: &str) -> Self {
        self.domain = domain.to_string();
        self
    }

    pub fn with_attribute(mut self, key: &str, value: AttributeValue) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }

    pub fn consumes(&self, tensor: &str) -> bool {
        self.inputs.iter().any(|i| i == tensor)
    }

    pub fn produces(&self, tensor: &str) -> bool {
        self.outputs.iter().any(|o| o == tensor)
    }

    /// Name used in logs; falls back to op type and first output
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("{}({})", self.op_type, self.outputs.first().map(String::as_str).unwrap_or(""))
        } else {
            self.name.clone()
        }
    }

    pub fn attr_int(&self, key: &str) -> Option<i64> {
        match self.attributes.get(key) {
            Some(AttributeValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn attr_float(&self, key: &str) -> Option<f32> {
        match self.attributes.get(key) {
            Some(AttributeValue::Float(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn attr_ints(&self, key: &str) -> Option<&[i64]> {
        match self.attributes.get(key) {
            Some(AttributeValue::Ints(v)) => Some(v),
            _ => None,
        }
    }
}

/// Location of a payload inside an external weight blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalData {
    /// Blob file name, relative to the descriptor's directory
    pub location: String,
    pub offset: u64,
    pub length: u64,
    /// blake3 hex digest of the payload
    #[serde(default)]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorData {
    /// Little-endian raw bytes
    Inline(Vec<u8>),
    External(ExternalData),
}

/// A named constant tensor (trained weight)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Initializer {
    pub name: String,
    pub element_type: ElementType,
    pub dims: Vec<i64>,
    pub data: TensorData,
}

impl Initializer {
    pub fn inline(name: &str, element_type: ElementType, dims: Vec<i64>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            element_type,
            dims,
            data: TensorData::Inline(bytes),
        }
    }

    pub fn from_f32(name: &str, dims: Vec<i64>, values: &[f32]) -> Self {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::inline(name, ElementType::Float, dims, bytes)
    }

    pub fn from_i64(name: &str, dims: Vec<i64>, values: &[i64]) -> Self {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::inline(name, ElementType::Int64, dims, bytes)
    }

    pub fn num_elements(&self) -> usize {
        self.dims.iter().map(|d| (*d).max(0) as usize).product()
    }

    /// Payload size implied by type and shape
    pub fn expected_len(&self) -> Option<usize> {
        self.element_type
            .size_in_bytes()
            .map(|size| size * self.num_elements())
    }

    pub fn is_external(&self) -> bool {
        matches!(self.data, TensorData::External(_))
    }

    pub fn inline_bytes(&self) -> Option<&[u8]> {
        match &self.data {
            TensorData::Inline(bytes) => Some(bytes),
            TensorData::External(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpsetImport {
    pub domain: String,
    pub version: i64,
}

impl OpsetImport {
    pub fn new(domain: &str, version: i64) -> Self {
        Self {
            domain: domain.to_string(),
            version,
        }
    }
}

/// A directed computation graph whose node order is a valid topological order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphModel {
    pub name: String,
    #[serde(default)]
    pub producer_name: String,
    pub ir_version: i64,
    pub opset_imports: Vec<OpsetImport>,
    pub nodes: Vec<OpNode>,
    #[serde(default)]
    pub initializers: Vec<Initializer>,
    #[serde(default)]
    pub graph_inputs: Vec<ValueInfo>,
    #[serde(default)]
    pub graph_outputs: Vec<ValueInfo>,
    /// Type records for intermediate tensors
    #[serde(default)]
    pub value_info: Vec<ValueInfo>,
}

impl GraphModel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            producer_name: "duoshard".to_string(),
            ir_version: IR_VERSION,
            opset_imports: vec![OpsetImport::new(DEFAULT_DOMAIN, DEFAULT_OPSET)],
            nodes: Vec::new(),
            initializers: Vec::new(),
            graph_inputs: Vec::new(),
            graph_outputs: Vec::new(),
            value_info: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: OpNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_initializer(mut self, init: Initializer) -> Self {
        self.initializers.push(init);
        self
    }

    pub fn with_input(mut self, info: ValueInfo) -> Self {
        self.graph_inputs.push(info);
        self
    }

    pub fn with_output(mut self, info: ValueInfo) -> Self {
        self.graph_outputs.push(info);
        self
    }

    pub fn with_value_info(mut self, info: ValueInfo) -> Self {
        self.value_info.push(info);
        self
    }

    pub fn with_opset(mut self, domain: &str, version: i64) -> Self {
        self.opset_imports.retain(|o| o.domain != domain);
        self.opset_imports.push(OpsetImport::new(domain, version));
        self
    }

    pub fn initializer(&self, name: &str) -> Option<&Initializer> {
        self.initializers.iter().find(|i| i.name == name)
    }

    pub fn initializer_names(&self) -> HashSet<&str> {
        self.initializers.iter().map(|i| i.name.as_str()).collect()
    }

    pub fn graph_input(&self, name: &str) -> Option<&ValueInfo> {
        self.graph_inputs.iter().find(|i| i.name == name)
    }

    pub fn graph_output(&self, name: &str) -> Option<&ValueInfo> {
        self.graph_outputs.iter().find(|o| o.name == name)
    }

    /// Type metadata for `name`, from graph inputs first, then intermediate records
    pub fn find_value_info(&self, name: &str) -> Option<&ValueInfo> {
        self.graph_input(name)
            .or_else(|| self.value_info.iter().find(|v| v.name == name))
    }

    /// Index of the first node producing `tensor`
    pub fn producer_of(&self, tensor: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.produces(tensor))
    }

    /// Index of the first node consuming `tensor`
    pub fn first_consumer_of(&self, tensor: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.consumes(tensor))
    }

    pub fn default_opset(&self) -> Option<i64> {
        self.opset_imports
            .iter()
            .find(|o| o.domain == DEFAULT_DOMAIN)
            .map(|o| o.version)
    }

    /// Opset imports outside the default domain (custom / contrib ops)
    pub fn custom_opsets(&self) -> impl Iterator<Item = &OpsetImport> {
        self.opset_imports.iter().filter(|o| o.domain != DEFAULT_DOMAIN)
    }

    /// Checks that initializer names are unique and that every node input is
    /// produced by an earlier node, an initializer or a graph input.
    pub fn validate(&self) -> Result<()> {
        let mut available: HashSet<&str> = HashSet::new();
        for init in &self.initializers {
            if !available.insert(init.name.as_str()) {
                return Err(GraphError::DuplicateInitializer(init.name.clone()));
            }
        }
        available.extend(self.graph_inputs.iter().map(|i| i.name.as_str()));

        for node in &self.nodes {
            for input in &node.inputs {
                if !input.is_empty() && !available.contains(input.as_str()) {
                    return Err(GraphError::DanglingInput {
                        node: node.display_name(),
                        input: input.clone(),
                    });
                }
            }
            available.extend(node.outputs.iter().map(String::as_str));
        }
        Ok(())
    }
}
