//! Streaming chat channel
//!
//! A long-lived bidirectional channel carrying repeated `{"prompt": ...}`
//! messages. Prompts are handled strictly one at a time in arrival order;
//! messages that arrive while a prompt is streaming are queued. Replies are
//! raw text frames, JSON error frames, and the `__DONE__` sentinel after
//! every completed prompt.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::state::NodeContext;
use crate::worker::{WorkerHandle, WorkerLauncher};

/// Sent after the last text frame of every prompt
pub const DONE_SENTINEL: &str = "__DONE__";
/// Pause before answering `no_compute`
pub const NO_COMPUTE_DELAY: Duration = Duration::from_millis(1500);

/// Transport under a chat session
#[async_trait]
pub trait ChatChannel: Send {
    /// Next client message, `None` once the client is gone
    async fn recv(&mut self) -> Option<String>;

    /// Send one text frame. Failure means the client is gone.
    async fn send_text(&mut self, text: String) -> Result<()>;
}

pub struct WsChannel {
    socket: WebSocket,
}

impl WsChannel {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl ChatChannel for WsChannel {
    async fn recv(&mut self) -> Option<String> {
        loop {
            match self.socket.recv().await? {
                Ok(Message::Text(text)) => return Some(text),
                Ok(Message::Binary(bytes)) => return Some(String::from_utf8_lossy(&bytes).into_owned()),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => return None,
                Err(e) => {
                    debug!("WebSocket receive error: {}", e);
                    return None;
                }
            }
        }
    }

    async fn send_text(&mut self, text: String) -> Result<()> {
        self.socket
            .send(Message::Text(text))
            .await
            .map_err(|_| GatewayError::ClientDisconnected)
    }
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    prompt: Option<String>,
}

/// `{"type": "error", "code": ..., "message": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub code: String,
    pub message: String,
}

impl ErrorFrame {
    pub fn from_error(error: &GatewayError) -> Self {
        Self {
            kind: "error".to_string(),
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!(r#"{{"type":"error","code":"{}"}}"#, self.code))
    }
}

/// Extract a non-empty prompt from one client message
pub fn parse_prompt(message: &str) -> Result<String> {
    match serde_json::from_str::<ChatRequest>(message) {
        Ok(ChatRequest { prompt: Some(prompt) }) if !prompt.is_empty() => Ok(prompt),
        _ => Err(GatewayError::NoPromptProvided),
    }
}

enum Event {
    Output(Result<Option<String>>),
    Client(Option<String>),
}

pub struct ChatSession {
    ctx: Arc<NodeContext>,
    launcher: Arc<dyn WorkerLauncher>,
    no_compute_delay: Duration,
}

impl ChatSession {
    pub fn new(ctx: Arc<NodeContext>, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            ctx,
            launcher,
            no_compute_delay: NO_COMPUTE_DELAY,
        }
    }

    pub fn with_no_compute_delay(mut self, delay: Duration) -> Self {
        self.no_compute_delay = delay;
        self
    }

    /// Serve one channel until the client goes away
    pub async fn run<C: ChatChannel>(&self, mut channel: C) {
        info!("🔌 Chat channel opened");
        let mut pending: VecDeque<String> = VecDeque::new();

        loop {
            let message = match pending.pop_front() {
                Some(message) => message,
                None => match channel.recv().await {
                    Some(message) => message,
                    None => break,
                },
            };

            match self.handle_message(&mut channel, &message, &mut pending).await {
                Ok(()) => {}
                Err(GatewayError::ClientDisconnected) => {
                    info!("❌ Client disconnected during streaming");
                    break;
                }
                Err(e) => {
                    warn!("⚠️ Prompt rejected: {}", e);
                    if send_error(&mut channel, &e).await.is_err() {
                        break;
                    }
                }
            }
        }

        info!("🔌 Chat channel closed");
    }

    async fn handle_message<C: ChatChannel>(
        &self,
        channel: &mut C,
        message: &str,
        pending: &mut VecDeque<String>,
    ) -> Result<()> {
        let prompt = parse_prompt(message)?;

        let peer = match self.ctx.compute_target() {
            Some(peer) => peer,
            None => {
                tokio::time::sleep(self.no_compute_delay).await;
                return Err(GatewayError::NoComputeAvailable);
            }
        };

        info!("📥 Prompt received ({} chars), routing to {}", prompt.len(), peer);
        let mut worker = self.launcher.launch(&prompt, &peer)?;

        match self.stream_worker(channel, &mut worker, pending).await {
            Err(GatewayError::ClientDisconnected) => {
                worker.kill().await;
                Err(GatewayError::ClientDisconnected)
            }
            Err(e) => {
                worker.kill().await;
                send_error(channel, &e).await?;
                channel.send_text(DONE_SENTINEL.to_string()).await
            }
            Ok(()) => {
                let status = worker.wait().await?;
                if !status.success() {
                    let failure = GatewayError::WorkerFailed(status.to_string());
                    warn!("⚠️ {}", failure);
                    send_error(channel, &failure).await?;
                }
                info!("✅ Worker finished");
                channel.send_text(DONE_SENTINEL.to_string()).await
            }
        }
    }

    /// Forward worker output until its stdout closes, queueing any client
    /// messages that arrive meanwhile.
    async fn stream_worker<C: ChatChannel>(
        &self,
        channel: &mut C,
        worker: &mut WorkerHandle,
        pending: &mut VecDeque<String>,
    ) -> Result<()> {
        loop {
            let event = tokio::select! {
                chunk = worker.next_chunk() => Event::Output(chunk),
                message = channel.recv() => Event::Client(message),
            };

            match event {
                Event::Output(Ok(Some(text))) => channel.send_text(text).await?,
                Event::Output(Ok(None)) => return Ok(()),
                Event::Output(Err(e)) => return Err(e),
                Event::Client(Some(message)) => pending.push_back(message),
                Event::Client(None) => return Err(GatewayError::ClientDisconnected),
            }
        }
    }
}

async fn send_error<C: ChatChannel>(channel: &mut C, error: &GatewayError) -> Result<()> {
    channel.send_text(ErrorFrame::from_error(error).to_json()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prompt() {
        assert_eq!(parse_prompt(r#"{"prompt":"hi"}"#).unwrap(), "hi");
        for bad in [r#"{"prompt":""}"#, r#"{}"#, "not json", r#"{"prompt":null}"#, r#"{"prompt":3}"#] {
            assert!(matches!(parse_prompt(bad), Err(GatewayError::NoPromptProvided)), "{}", bad);
        }
    }

    #[test]
    fn test_error_frame_json() {
        let json = ErrorFrame::from_error(&GatewayError::NoComputeAvailable).to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "no_compute");
        assert!(value["message"].as_str().unwrap().contains("No compute"));
        assert_eq!(value.as_object().unwrap().len(), 3);

        let frame: ErrorFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(frame, ErrorFrame::from_error(&GatewayError::NoComputeAvailable));
    }
}
