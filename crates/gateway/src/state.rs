//! Node lifecycle state
//!
//! One [`NodeContext`] per gateway, shared behind an `Arc`. Only the
//! lifecycle endpoints mutate it.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Address of the compute peer in the default roster
pub const DEFAULT_SERVER_IP: &str = "192.168.0.111";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRange {
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hardware {
    #[serde(rename = "type")]
    pub kind: String,
    pub cpu: String,
    pub accelerator: String,
    #[serde(rename = "ram")]
    pub ram_gb: u32,
    #[serde(rename = "vram")]
    pub vram_gb: u32,
}

/// Roster entry reported by `/status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub status: String,
    pub layers: LayerRange,
    pub hardware: Hardware,
    /// Tokens per second
    pub throughput: f32,
    #[serde(rename = "latency")]
    pub latency_ms: u32,
}

impl PeerRecord {
    /// The home server holding the late shard
    pub fn home_server(ip: &str) -> Self {
        Self {
            id: "peer-1".to_string(),
            name: "Home Server".to_string(),
            ip: ip.to_string(),
            status: "online".to_string(),
            layers: LayerRange { start: 1, end: 32 },
            hardware: Hardware {
                kind: "server".to_string(),
                cpu: "Intel i5-7400".to_string(),
                accelerator: "CPU".to_string(),
                ram_gb: 16,
                vram_gb: 0,
            },
            throughput: 6.5,
            latency_ms: 12,
        }
    }
}

/// Read-only view returned by `/status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub node_id: String,
    pub online: bool,
    pub connected_server: Option<String>,
    pub peers: Vec<PeerRecord>,
}

pub struct NodeContext {
    node_id: String,
    online: RwLock<bool>,
    connected_peer: RwLock<Option<String>>,
    peers: RwLock<Vec<PeerRecord>>,
}

impl NodeContext {
    pub fn new(peers: Vec<PeerRecord>) -> Self {
        Self::with_node_id(generate_node_id(), peers)
    }

    pub fn with_node_id(node_id: impl Into<String>, peers: Vec<PeerRecord>) -> Self {
        Self {
            node_id: node_id.into(),
            online: RwLock::new(false),
            connected_peer: RwLock::new(None),
            peers: RwLock::new(peers),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn go_online(&self) {
        *self.online.write() = true;
        info!("🟢 Node {} is online", self.node_id);
    }

    pub fn is_online(&self) -> bool {
        *self.online.read()
    }

    /// Record a peer that passed the reachability probe
    pub fn connect(&self, ip: &str) {
        *self.connected_peer.write() = Some(ip.to_string());
        info!("🔗 Connected to compute peer {}", ip);
    }

    pub fn connected_peer(&self) -> Option<String> {
        self.connected_peer.read().clone()
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.peers.read().clone()
    }

    /// Peer to run a prompt against: only when online and connected
    pub fn compute_target(&self) -> Option<String> {
        if self.is_online() {
            self.connected_peer()
        } else {
            None
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            node_id: self.node_id.clone(),
            online: self.is_online(),
            connected_server: self.connected_peer(),
            peers: self.peers(),
        }
    }
}

impl Default for NodeContext {
    fn default() -> Self {
        Self::new(vec![PeerRecord::home_server(DEFAULT_SERVER_IP)])
    }
}

/// First 8 characters of a fresh v4 uuid
pub fn generate_node_id() -> String {
    uuid::Uuid::new_v4().to_string()[..8].to_string()
}
