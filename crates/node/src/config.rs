use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use duoshard_gateway::{CommandLauncher, GatewayConfig, DEFAULT_SERVER_IP, NO_COMPUTE_DELAY, PEER_PLACEHOLDER, PROBE_TIMEOUT};
use duoshard_graph::{PartitionConfig, DEFAULT_GATE};
use duoshard_inference::{INFERENCE_PORT, MAX_NEW_TOKENS};

pub const DEFAULT_TOKENIZER: &str = "microsoft/Phi-3-mini-4k-instruct";
pub const EARLY_SHARD_FILE: &str = "laptop.graph.json";
pub const LATE_SHARD_FILE: &str = "server.graph.json";

pub struct PartitionJob {
    pub model: PathBuf,
    pub early_out: PathBuf,
    pub late_out: PathBuf,
    pub partition: PartitionConfig,
}

impl PartitionJob {
    pub fn new(
        model: PathBuf,
        gate: Option<String>,
        out_dir: Option<PathBuf>,
        final_output: Option<String>,
        hidden_size: Option<i64>,
        rename_boundary: bool,
    ) -> Self {
        let out_dir = out_dir.unwrap_or_else(|| model_dir(&model));

        let mut partition = PartitionConfig::new(gate.as_deref().unwrap_or(DEFAULT_GATE))
            .with_boundary_rename(rename_boundary);
        if let Some(name) = final_output {
            partition = partition.with_final_output(&name);
        }
        if let Some(hidden) = hidden_size {
            partition = partition.with_hidden_size(hidden);
        }

        Self {
            model,
            early_out: out_dir.join(EARLY_SHARD_FILE),
            late_out: out_dir.join(LATE_SHARD_FILE),
            partition,
        }
    }
}

pub struct ServeConfig {
    pub model: PathBuf,
    pub listen_addr: String,
}

impl ServeConfig {
    pub fn new(model: PathBuf, host: Option<String>, port: Option<u16>) -> Self {
        let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
        Self {
            model,
            listen_addr: format!("{}:{}", host, port.unwrap_or(INFERENCE_PORT)),
        }
    }
}

pub struct WorkerConfig {
    pub server: String,
    pub tokenizer: String,
    pub max_tokens: usize,
    pub eos_token_id: Option<u32>,
}

impl WorkerConfig {
    pub fn new(
        server: Option<String>,
        tokenizer: Option<String>,
        max_tokens: Option<usize>,
        eos_token_id: Option<u32>,
    ) -> Self {
        Self {
            server: with_default_port(&server.unwrap_or_else(|| DEFAULT_SERVER_IP.to_string())),
            tokenizer: tokenizer.unwrap_or_else(|| DEFAULT_TOKENIZER.to_string()),
            max_tokens: max_tokens.unwrap_or(MAX_NEW_TOKENS),
            eos_token_id,
        }
    }
}

pub struct GatewayNodeConfig {
    pub listen_addr: String,
    pub server_ip: String,
    pub worker_program: PathBuf,
    pub tokenizer: String,
    pub max_tokens: usize,
    pub gateway: GatewayConfig,
}

impl GatewayNodeConfig {
    pub fn new(
        port: u16,
        server_ip: Option<String>,
        tokenizer: Option<String>,
        max_tokens: Option<usize>,
        no_compute_delay_ms: Option<u64>,
    ) -> Self {
        let worker_program = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("duoshard"));

        Self {
            listen_addr: format!("0.0.0.0:{}", port),
            server_ip: server_ip.unwrap_or_else(|| DEFAULT_SERVER_IP.to_string()),
            worker_program,
            tokenizer: tokenizer.unwrap_or_else(|| DEFAULT_TOKENIZER.to_string()),
            max_tokens: max_tokens.unwrap_or(MAX_NEW_TOKENS),
            gateway: GatewayConfig {
                inference_port: INFERENCE_PORT,
                probe_timeout: PROBE_TIMEOUT,
                no_compute_delay: no_compute_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(NO_COMPUTE_DELAY),
            },
        }
    }

    /// `duoshard prompt --server <peer>:5555 ... -- <prompt>`
    pub fn launcher(&self) -> CommandLauncher {
        CommandLauncher::new(&self.worker_program).with_args([
            "prompt".to_string(),
            "--server".to_string(),
            format!("{}:{}", PEER_PLACEHOLDER, self.gateway.inference_port),
            "--tokenizer".to_string(),
            self.tokenizer.clone(),
            "--max-tokens".to_string(),
            self.max_tokens.to_string(),
            "--".to_string(),
        ])
    }
}

pub fn model_dir(model: &Path) -> PathBuf {
    match model.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// `host` becomes `host:5555`; explicit ports are kept
fn with_default_port(server: &str) -> String {
    let has_port = server.parse::<SocketAddr>().is_ok()
        || matches!(server.rsplit_once(':'), Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok());
    if has_port {
        server.to_string()
    } else {
        format!("{}:{}", server, INFERENCE_PORT)
    }
}
