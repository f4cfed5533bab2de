use std::error::Error;

use duoshard_inference::{GraphInterpreter, ShardServer};
use tracing::info;

use crate::config::ServeConfig;

/// Remote node: load the shard once and answer forward requests forever
pub async fn run_serve_shard(config: ServeConfig) -> Result<(), Box<dyn Error>> {
    info!("🧠 duoshard inference service");

    let model = config.model.clone();
    let executor = tokio::task::spawn_blocking(move || GraphInterpreter::load(model)).await??;

    ShardServer::new(executor).run(&config.listen_addr).await?;
    Ok(())
}
