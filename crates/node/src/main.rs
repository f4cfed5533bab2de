use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, Level};

use duoshard_gateway::{router, AppState, NodeContext, PeerRecord, API_PORT};

mod config;
mod offline;
mod serve;
mod worker;

use config::{GatewayNodeConfig, PartitionJob, ServeConfig, WorkerConfig};

#[derive(Parser)]
#[command(name = "duoshard")]
#[command(about = "Two-node split inference for transformer graphs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Cut a full model into an early and a late shard
    Partition {
        /// Full model descriptor (*.graph.json)
        model: PathBuf,

        /// Tensor to cut at
        #[arg(short, long)]
        gate: Option<String>,

        /// Directory for laptop.graph.json / server.graph.json (defaults to the model's)
        #[arg(short, long)]
        out_dir: Option<PathBuf>,

        /// Output the late shard declares
        #[arg(long)]
        final_output: Option<String>,

        /// Hidden width for the gate when its shape is not recorded
        #[arg(long)]
        hidden_size: Option<i64>,

        /// Rename the gate to <gate>_input inside the late shard
        #[arg(long)]
        rename_boundary: bool,
    },
    /// Drop unused weights from a saved shard
    Prune {
        model: PathBuf,

        /// Write here instead of in place
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also drop weights of transformer layers below this index
        #[arg(long)]
        min_layer: Option<u32>,
    },
    /// Point a descriptor's external weights at another blob file
    Relocate {
        model: PathBuf,

        /// Blob file name, relative to the descriptor
        location: String,
    },
    /// Serve a shard on the remote node
    ServeShard {
        model: PathBuf,

        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Generate a reply for one prompt, streaming text to stdout
    Prompt {
        prompt: String,

        /// Inference service address (host or host:port)
        #[arg(short, long)]
        server: Option<String>,

        /// tokenizer.json path, directory, or hub repository id
        #[arg(short, long)]
        tokenizer: Option<String>,

        #[arg(long)]
        max_tokens: Option<usize>,

        /// Override the end-of-sequence token id
        #[arg(long)]
        eos_token_id: Option<u32>,
    },
    /// Run the client-facing API gateway
    Gateway {
        #[arg(short, long, default_value_t = API_PORT)]
        port: u16,

        /// Address of the compute peer listed in the roster
        #[arg(long)]
        server_ip: Option<String>,

        #[arg(short, long)]
        tokenizer: Option<String>,

        #[arg(long)]
        max_tokens: Option<usize>,

        /// Delay before answering prompts that have no compute, in ms
        #[arg(long)]
        no_compute_delay_ms: Option<u64>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };

    let subscriber = tracing_subscriber::fmt().with_max_level(level).with_target(false);
    if matches!(cli.command, Commands::Prompt { .. }) {
        // stdout is the text stream
        subscriber.with_writer(std::io::stderr).init();
    } else {
        subscriber.init();
    }

    match cli.command {
        Commands::Partition {
            model,
            gate,
            out_dir,
            final_output,
            hidden_size,
            rename_boundary,
        } => offline::run_partition(PartitionJob::new(
            model,
            gate,
            out_dir,
            final_output,
            hidden_size,
            rename_boundary,
        )),
        Commands::Prune {
            model,
            output,
            min_layer,
        } => offline::run_prune(&model, output, min_layer),
        Commands::Relocate { model, location } => offline::run_relocate(&model, &location),
        Commands::ServeShard { model, host, port } => {
            let config = ServeConfig::new(model, host, port);
            tokio::runtime::Runtime::new()?.block_on(serve::run_serve_shard(config))
        }
        Commands::Prompt {
            prompt,
            server,
            tokenizer,
            max_tokens,
            eos_token_id,
        } => {
            let config = WorkerConfig::new(server, tokenizer, max_tokens, eos_token_id);
            current_thread()?.block_on(worker::run_prompt(config, &prompt))
        }
        Commands::Gateway {
            port,
            server_ip,
            tokenizer,
            max_tokens,
            no_compute_delay_ms,
        } => {
            let config = GatewayNodeConfig::new(port, server_ip, tokenizer, max_tokens, no_compute_delay_ms);
            current_thread()?.block_on(run_gateway(config))
        }
    }
}

fn current_thread() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread().enable_all().build()
}

async fn run_gateway(config: GatewayNodeConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("🧠 duoshard gateway");

    let ctx = Arc::new(NodeContext::new(vec![PeerRecord::home_server(&config.server_ip)]));
    info!("📍 Node ID: {}", ctx.node_id());
    info!("   Worker: {}", config.worker_program.display());

    let state = AppState::new(ctx, Arc::new(config.launcher()), config.gateway.clone());
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!("🌐 Gateway API running on http://{}", config.listen_addr);

    axum::serve(listener, app).await?;
    Ok(())
}
