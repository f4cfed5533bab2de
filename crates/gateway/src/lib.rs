//! duoshard gateway
//!
//! The client-facing side of the local node:
//!
//! - `POST /go-online`, `POST /connect-to-swarm`, `GET /status`: node lifecycle
//! - `GET /chat` (WebSocket): prompts in, generated text out, one decode
//!   worker process per prompt
//!
//! Lifecycle state lives in an explicit [`NodeContext`]; the transport under
//! a chat session is the [`ChatChannel`] trait so sessions run the same over
//! a WebSocket or an in-memory channel.

pub mod api;
pub mod chat;
pub mod error;
pub mod probe;
pub mod state;
pub mod worker;

pub use api::{router, AppState, ConnectResponse, GatewayConfig, GoOnlineResponse, API_PORT};
pub use chat::{parse_prompt, ChatChannel, ChatSession, ErrorFrame, WsChannel, DONE_SENTINEL, NO_COMPUTE_DELAY};
pub use error::{GatewayError, Result};
pub use probe::{is_reachable, PROBE_TIMEOUT};
pub use state::{generate_node_id, NodeContext, PeerRecord, StatusSnapshot, DEFAULT_SERVER_IP};
pub use worker::{CommandLauncher, Utf8Chunker, WorkerHandle, WorkerLauncher, PEER_PLACEHOLDER};
