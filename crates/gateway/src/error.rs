use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Peer not reachable: {0}")]
    UnreachablePeer(String),

    #[error("No prompt provided")]
    NoPromptProvided,

    #[error("No compute available: node is offline or not connected to a peer")]
    NoComputeAvailable,

    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("Worker error: {0}")]
    Worker(#[from] std::io::Error),

    #[error("Decode worker exited unsuccessfully: {0}")]
    WorkerFailed(String),
}

impl GatewayError {
    /// Stable machine-readable code sent in error frames
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::UnreachablePeer(_) => "unreachable_peer",
            GatewayError::NoPromptProvided => "no_prompt",
            GatewayError::NoComputeAvailable => "no_compute",
            GatewayError::ClientDisconnected => "client_disconnected",
            GatewayError::Worker(_) | GatewayError::WorkerFailed(_) => "worker_failed",
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
