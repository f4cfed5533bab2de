//! duoshard inference runtime
//!
//! Split inference across two nodes:
//!
//! - **Shard executor**: runs one partitioned shard ([`GraphInterpreter`])
//! - **Inference service**: TCP request/reply server on the remote node
//! - **Decoder**: greedy token loop on the local node, streaming text deltas
//!
//! ## Architecture
//!
//! ```text
//! local node                                   remote node (:5555)
//! GreedyDecoder ── Forward{input_ids} ──────>  ShardServer
//!      ^                                          │ FillTable -> ShardExecutor
//!      └──────────── Logits{logits} <─────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use duoshard_inference::{GraphInterpreter, ShardServer, ShardClient, GreedyDecoder, HfTokenizer};
//! use futures::StreamExt;
//!
//! // Remote node
//! let executor = GraphInterpreter::load("server.graph.json")?;
//! ShardServer::new(executor).run("0.0.0.0:5555").await?;
//!
//! // Local node
//! let client = ShardClient::connect("10.0.0.2:5555").await?;
//! let tokenizer = HfTokenizer::load("microsoft/Phi-3-mini-4k-instruct", None)?;
//! let mut decoder = GreedyDecoder::new(client, tokenizer);
//! let stream = decoder.generate("Hello")?;
//! futures::pin_mut!(stream);
//! while let Some(delta) = stream.next().await {
//!     print!("{}", delta?);
//! }
//! ```

pub mod decoder;
pub mod error;
pub mod executor;
pub mod input_fill;
pub mod shard_server;
pub mod tensor_transport;
pub mod tokenizer;

pub use decoder::{
    greedy_token, render_chat_prompt, text_delta, ForwardClient, GreedyDecoder, StopReason, CHAT_TEMPLATE,
    MAX_NEW_TOKENS,
};
pub use error::{ExecutorError, InferenceError, Result};
pub use executor::{dtype_for, initializer_tensor, GraphInterpreter, ShardExecutor};
pub use input_fill::{cache_shape, FillRule, FillStrategy, FillTable, NamePattern};
pub use shard_server::ShardServer;
pub use tensor_transport::{
    read_frame, write_frame, SerializedTensor, ShardClient, ShardMessage, TensorTransportError,
    INFERENCE_PORT, MAX_FRAME_BYTES,
};
pub use tokenizer::{HfTokenizer, TextTokenizer, EOS_CANDIDATES};
