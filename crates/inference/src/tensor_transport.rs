//! Tensor Transport Layer
//!
//! Serializes tensors and moves them between the two nodes. Each message on
//! the wire is an 8-byte little-endian length followed by a bincode-encoded
//! [`ShardMessage`]. One connection carries one request at a time.

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

/// Default TCP port of the remote inference service
pub const INFERENCE_PORT: u16 = 5555;
/// Frames above this size are refused
pub const MAX_FRAME_BYTES: u64 = 1 << 30;

/// Serialized tensor format for network transmission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedTensor {
    /// Shape of the tensor (e.g., [batch, seq_len, vocab])
    pub shape: Vec<usize>,
    /// Data type ("F32", "I64", ...)
    pub dtype: String,
    /// Raw little-endian tensor data
    pub data: Vec<u8>,
    /// Checksum for integrity verification
    pub checksum: [u8; 32],
}

impl SerializedTensor {
    /// Serialize a Candle tensor for network transmission
    pub fn from_tensor(tensor: &Tensor) -> Result<Self, TensorTransportError> {
        let shape = tensor.dims().to_vec();
        let dtype = format!("{:?}", tensor.dtype());
        let flat = tensor.flatten_all()?;

        let data: Vec<u8> = match tensor.dtype() {
            DType::F32 => flat.to_vec1::<f32>()?.iter().flat_map(|v| v.to_le_bytes()).collect(),
            DType::F64 => flat.to_vec1::<f64>()?.iter().flat_map(|v| v.to_le_bytes()).collect(),
            DType::F16 => flat.to_vec1::<half::f16>()?.iter().flat_map(|v| v.to_le_bytes()).collect(),
            DType::BF16 => flat.to_vec1::<half::bf16>()?.iter().flat_map(|v| v.to_le_bytes()).collect(),
            DType::I64 => flat.to_vec1::<i64>()?.iter().flat_map(|v| v.to_le_bytes()).collect(),
            DType::U32 => flat.to_vec1::<u32>()?.iter().flat_map(|v| v.to_le_bytes()).collect(),
            DType::U8 => flat.to_vec1::<u8>()?,
        };

        let checksum = *blake3::hash(&data).as_bytes();

        Ok(Self {
            shape,
            dtype,
            data,
            checksum,
        })
    }

    /// Deserialize back to a Candle tensor
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor, TensorTransportError> {
        let computed_checksum = blake3::hash(&self.data);
        if computed_checksum.as_bytes() != &self.checksum {
            return Err(TensorTransportError::ChecksumMismatch);
        }

        let shape = self.shape.as_slice();
        let tensor = match self.dtype.as_str() {
            "F32" => Tensor::from_vec(decode_le(&self.data, f32::from_le_bytes), shape, device)?,
            "F64" => Tensor::from_vec(decode_le(&self.data, f64::from_le_bytes), shape, device)?,
            "F16" => Tensor::from_vec(decode_le(&self.data, half::f16::from_le_bytes), shape, device)?,
            "BF16" => Tensor::from_vec(decode_le(&self.data, half::bf16::from_le_bytes), shape, device)?,
            "I64" => Tensor::from_vec(decode_le(&self.data, i64::from_le_bytes), shape, device)?,
            "U32" => Tensor::from_vec(decode_le(&self.data, u32::from_le_bytes), shape, device)?,
            "U8" => Tensor::from_vec(self.data.clone(), shape, device)?,
            _ => return Err(TensorTransportError::UnsupportedDtype(self.dtype.clone())),
        };

        Ok(tensor)
    }
}

fn decode_le<T, const N: usize>(data: &[u8], from_le: fn([u8; N]) -> T) -> Vec<T> {
    data.chunks_exact(N)
        .map(|chunk| {
            let mut bytes = [0u8; N];
            bytes.copy_from_slice(chunk);
            from_le(bytes)
        })
        .collect()
}

/// Messages exchanged between the decoding node and the inference service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ShardMessage {
    /// Token ids `[batch, seq]` to run through the shard
    Forward { input_ids: SerializedTensor },
    /// Raw logits produced by the shard
    Logits { logits: SerializedTensor },
    /// Request failed on the service side
    Error { error: String },
}

/// Write one length-prefixed frame
pub async fn write_frame<W>(stream: &mut W, message: &ShardMessage) -> Result<(), TensorTransportError>
where
    W: AsyncWrite + Unpin,
{
    let data = bincode::serialize(message)
        .map_err(|e| TensorTransportError::SerializationError(e.to_string()))?;

    let len = data.len() as u64;
    stream.write_all(&len.to_le_bytes()).await?;
    stream.write_all(&data).await?;
    stream.flush().await?;

    debug!("📤 Sent {} byte frame", len);
    Ok(())
}

/// Read one length-prefixed frame. `Ok(None)` means the peer closed the
/// connection cleanly between frames.
pub async fn read_frame<R>(stream: &mut R) -> Result<Option<ShardMessage>, TensorTransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 8];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u64::from_le_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(TensorTransportError::FrameTooLarge(len));
    }

    let mut data = vec![0u8; len as usize];
    stream.read_exact(&mut data).await?;

    let message: ShardMessage = bincode::deserialize(&data)
        .map_err(|e| TensorTransportError::SerializationError(e.to_string()))?;

    debug!("📥 Received {} byte frame", len);
    Ok(Some(message))
}

/// Client side of the request/reply channel. Keeps one persistent
/// connection and never has more than one request in flight.
pub struct ShardClient {
    stream: TcpStream,
    peer: String,
}

impl ShardClient {
    pub async fn connect(addr: impl ToSocketAddrs + std::fmt::Display) -> Result<Self, TensorTransportError> {
        let peer = addr.to_string();
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TensorTransportError::ConnectionError(format!("{}: {}", peer, e)))?;
        stream.set_nodelay(true)?;
        Ok(Self { stream, peer })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Send token ids and wait for the logits
    pub async fn forward_ids(&mut self, input_ids: &Tensor) -> Result<Tensor, TensorTransportError> {
        let request = ShardMessage::Forward {
            input_ids: SerializedTensor::from_tensor(input_ids)?,
        };
        write_frame(&mut self.stream, &request).await?;

        match read_frame(&mut self.stream).await? {
            Some(ShardMessage::Logits { logits }) => logits.to_tensor(&Device::Cpu),
            Some(ShardMessage::Error { error }) => Err(TensorTransportError::RemoteError(error)),
            Some(ShardMessage::Forward { .. }) => Err(TensorTransportError::UnexpectedMessage),
            None => Err(TensorTransportError::ConnectionClosed),
        }
    }
}

/// Errors that can occur during tensor transport
#[derive(Debug, thiserror::Error)]
pub enum TensorTransportError {
    #[error("Candle error: {0}")]
    CandleError(#[from] candle_core::Error),

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame of {0} bytes exceeds limit")]
    FrameTooLarge(u64),

    #[error("Checksum mismatch - data corrupted")]
    ChecksumMismatch,

    #[error("Remote error: {0}")]
    RemoteError(String),

    #[error("Unexpected message type")]
    UnexpectedMessage,

    #[error("Connection closed by peer")]
    ConnectionClosed,
}
