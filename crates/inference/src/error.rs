use thiserror::Error;

use crate::tensor_transport::TensorTransportError;

/// Failure inside a shard executor. Fatal to the current request only.
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Missing input tensor: {0}")]
    MissingInput(String),

    #[error("Missing output tensor: {0}")]
    MissingOutput(String),

    #[error("Unsupported op: {0}")]
    UnsupportedOp(String),

    #[error("Invalid attribute '{attribute}' on {node}")]
    InvalidAttribute { node: String, attribute: String },

    #[error("Unsupported element type: {0}")]
    UnsupportedDtype(String),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Graph error: {0}")]
    Graph(#[from] duoshard_graph::GraphError),
}

/// Errors of the serving and decoding side.
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Tensor transport error: {0}")]
    Transport(#[from] TensorTransportError),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Tokenization error: {0}")]
    Tokenizer(String),

    #[error("Shard returned empty logits")]
    EmptyLogits,

    #[error("Forward task failed: {0}")]
    TaskFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, InferenceError>;
