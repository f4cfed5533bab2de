use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::chat::{ChatSession, WsChannel, NO_COMPUTE_DELAY};
use crate::error::GatewayError;
use crate::probe::{is_reachable, PROBE_TIMEOUT};
use crate::state::{NodeContext, StatusSnapshot};
use crate::worker::WorkerLauncher;

/// HTTP port of the gateway
pub const API_PORT: u16 = 8000;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Port probed on a peer before connecting to it
    pub inference_port: u16,
    pub probe_timeout: Duration,
    pub no_compute_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            inference_port: 5555,
            probe_timeout: PROBE_TIMEOUT,
            no_compute_delay: NO_COMPUTE_DELAY,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<NodeContext>,
    pub session: Arc<ChatSession>,
    pub config: GatewayConfig,
}

impl AppState {
    pub fn new(ctx: Arc<NodeContext>, launcher: Arc<dyn WorkerLauncher>, config: GatewayConfig) -> Self {
        let session = ChatSession::new(Arc::clone(&ctx), launcher).with_no_compute_delay(config.no_compute_delay);
        Self {
            ctx,
            session: Arc::new(session),
            config,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GoOnlineResponse {
    pub node_id: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub ip: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/go-online", post(go_online))
        .route("/connect-to-swarm", post(connect_to_swarm))
        .route("/status", get(status))
        .route("/chat", get(chat))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn go_online(State(state): State<AppState>) -> Json<GoOnlineResponse> {
    state.ctx.go_online();
    Json(GoOnlineResponse {
        node_id: state.ctx.node_id().to_string(),
        status: "online".to_string(),
    })
}

pub async fn connect_to_swarm(
    State(state): State<AppState>,
    Json(req): Json<ConnectRequest>,
) -> Json<ConnectResponse> {
    let port = state.config.inference_port;
    if !is_reachable(&req.ip, port, state.config.probe_timeout).await {
        let err = GatewayError::UnreachablePeer(format!("{}:{}", req.ip, port));
        warn!("⚠️ {}", err);
        return Json(ConnectResponse {
            success: false,
            connected_to: None,
            error: Some("Peer not reachable".to_string()),
        });
    }

    state.ctx.connect(&req.ip);
    Json(ConnectResponse {
        success: true,
        connected_to: Some(req.ip),
        error: None,
    })
}

pub async fn status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.ctx.snapshot())
}

pub async fn chat(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    info!("🔌 WS upgrade requested");
    let session = Arc::clone(&state.session);
    ws.on_upgrade(move |socket| async move { session.run(WsChannel::new(socket)).await })
}
