//! Remote inference service
//!
//! Listens for [`ShardMessage::Forward`] requests, fills the shard's declared
//! inputs from the token ids, runs one forward pass and replies with the
//! first declared output. Executor failures go back as
//! [`ShardMessage::Error`] and the connection keeps serving.

use std::sync::Arc;
use std::time::Instant;

use candle_core::{Device, Tensor};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::error::{ExecutorError, InferenceError, Result};
use crate::executor::ShardExecutor;
use crate::input_fill::FillTable;
use crate::tensor_transport::{read_frame, write_frame, SerializedTensor, ShardMessage};

pub struct ShardServer<E: ShardExecutor + 'static> {
    executor: Arc<Mutex<E>>,
    fill: Arc<FillTable>,
}

impl<E: ShardExecutor + 'static> Clone for ShardServer<E> {
    fn clone(&self) -> Self {
        Self {
            executor: Arc::clone(&self.executor),
            fill: Arc::clone(&self.fill),
        }
    }
}

impl<E: ShardExecutor + 'static> ShardServer<E> {
    pub fn new(executor: E) -> Self {
        Self::with_fill_table(executor, FillTable::default())
    }

    pub fn with_fill_table(executor: E, fill: FillTable) -> Self {
        Self {
            executor: Arc::new(Mutex::new(executor)),
            fill: Arc::new(fill),
        }
    }

    /// Bind `addr` and serve until the process exits
    pub async fn run(self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("🎧 Inference service listening on {}", addr);
        self.serve(listener).await
    }

    /// Accept loop on an already bound listener. Accept and connection
    /// errors are logged and never stop the loop.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("📥 Incoming connection from {}", addr);
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream).await {
                            error!("❌ Connection error from {}: {}", addr, e);
                        }
                        debug!("Connection from {} closed", addr);
                    });
                }
                Err(e) => {
                    error!("❌ Accept error: {}", e);
                }
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;

        while let Some(message) = read_frame(&mut stream).await? {
            let reply = match message {
                ShardMessage::Forward { input_ids } => {
                    let start = Instant::now();
                    match self.forward(&input_ids).await {
                        Ok(logits) => {
                            debug!(
                                "⚡ Forward {:?} -> {:?} in {}ms",
                                input_ids.shape,
                                logits.shape,
                                start.elapsed().as_millis()
                            );
                            ShardMessage::Logits { logits }
                        }
                        Err(e) => {
                            warn!("⚠️ Forward failed: {}", e);
                            ShardMessage::Error { error: e.to_string() }
                        }
                    }
                }
                other => {
                    warn!("⚠️ Unexpected message type");
                    ShardMessage::Error {
                        error: format!("expected Forward, got {}", message_kind(&other)),
                    }
                }
            };
            write_frame(&mut stream, &reply).await?;
        }
        Ok(())
    }

    /// One forward pass for serialized ids
    pub async fn forward(&self, input_ids: &SerializedTensor) -> Result<SerializedTensor> {
        let ids = input_ids.to_tensor(&Device::Cpu)?;
        let executor = Arc::clone(&self.executor);
        let fill = Arc::clone(&self.fill);

        let logits = tokio::task::spawn_blocking(move || run_forward(&executor, &fill, &ids))
            .await
            .map_err(|e| InferenceError::TaskFailed(e.to_string()))??;

        Ok(SerializedTensor::from_tensor(&logits)?)
    }
}

fn run_forward<E: ShardExecutor>(
    executor: &Mutex<E>,
    fill: &FillTable,
    ids: &Tensor,
) -> std::result::Result<Tensor, ExecutorError> {
    let mut executor = executor.lock();
    let inputs = fill.fill_inputs(executor.inputs(), ids)?;
    let output_name = executor
        .outputs()
        .first()
        .map(|o| o.name.clone())
        .ok_or_else(|| ExecutorError::MissingOutput("<none declared>".to_string()))?;

    let mut outputs = executor.run(inputs)?;
    outputs
        .remove(&output_name)
        .ok_or(ExecutorError::MissingOutput(output_name))
}

fn message_kind(message: &ShardMessage) -> &'static str {
    match message {
        ShardMessage::Forward { .. } => "Forward",
        ShardMessage::Logits { .. } => "Logits",
        ShardMessage::Error { .. } => "Error",
    }
}
