use thiserror::Error;

/// Errors raised while building, validating or persisting a graph model.
#[derive(Error, Debug)]
pub enum GraphError {
    /// A node reads a tensor nothing in the graph provides
    #[error("node '{node}' reads '{input}' which is neither produced, an initializer nor a graph input")]
    DanglingInput { node: String, input: String },

    /// Two initializers share a name
    #[error("duplicate initializer: {0}")]
    DuplicateInitializer(String),

    /// An external reference points past the end of its blob file
    #[error("external data for '{name}' is out of bounds ({offset}+{length} > {file_len})")]
    ExternalDataOutOfBounds {
        name: String,
        offset: u64,
        length: u64,
        file_len: u64,
    },

    /// Payload bytes do not hash to the recorded checksum
    #[error("checksum mismatch for initializer '{0}'")]
    ChecksumMismatch(String),

    /// Weight payload requested but not available
    #[error("initializer '{0}' has no data attached")]
    MissingData(String),

    /// Payload has the wrong size for its declared type and shape
    #[error("invalid data for '{name}': {reason}")]
    InvalidData { name: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("descriptor error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while cutting a graph into two shards.
#[derive(Error, Debug)]
pub enum PartitionError {
    /// No node produces the gate tensor
    #[error("gate tensor not produced by any node: {0}")]
    GateNotFound(String),

    /// The gate is produced but nothing downstream reads it
    #[error("gate tensor is never consumed, late shard would be empty: {0}")]
    GateNotConsumed(String),

    /// The source model does not declare the requested final output
    #[error("source model declares no output named '{0}'")]
    OutputNotDeclared(String),

    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
}

pub type Result<T> = std::result::Result<T, GraphError>;
