//! duoshard graph layer
//!
//! Everything that happens offline, before serving:
//!
//! - **Graph model**: ordered op nodes, initializers, declared inputs/outputs
//! - **Partitioner**: cut a full model at a gate tensor into two shards
//! - **Artifacts**: JSON descriptor + external weight blob per shard
//! - **Pruning**: drop weights a shard does not need
//!
//! ```text
//! full model ──partition(gate)──┬─> early shard ("laptop")  ends with gate
//!                               └─> late shard  ("server")  starts at gate, emits logits
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use duoshard_graph::{load_model, save_model, LoadMode, PartitionConfig, Partitioner};
//!
//! let full = load_model("model.graph.json", LoadMode::WithData)?;
//! let pair = Partitioner::new(PartitionConfig::default()).partition(&full)?;
//! save_model(&pair.early, None, "laptop.graph.json")?;
//! save_model(&pair.late, None, "server.graph.json")?;
//! ```

pub mod artifact;
pub mod error;
pub mod model;
pub mod partition;
pub mod prune;

pub use artifact::{
    blob_file_name, load_model, read_initializer, relocate_external_data, save_model,
    write_descriptor, LoadMode, BLOB_ALIGNMENT,
};
pub use error::{GraphError, PartitionError, Result};
pub use model::{
    AttributeValue, Dim, ElementType, ExternalData, GraphModel, Initializer, OpNode,
    OpsetImport, TensorData, ValueInfo, DEFAULT_DOMAIN, DEFAULT_OPSET, IR_VERSION,
};
pub use partition::{
    early_slice, external_inputs, late_slice, partition, PartitionConfig, Partitioner,
    ShardPair, BOUNDARY_INPUT_SUFFIX, DEFAULT_FINAL_OUTPUT, DEFAULT_GATE,
};
pub use prune::{layer_index, prune_layer_initializers, prune_unused_initializers};
