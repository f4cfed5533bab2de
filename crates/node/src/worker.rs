//! Decode worker: one prompt in, text deltas on stdout
//!
//! Spawned by the gateway for every chat prompt. Logs go to stderr so stdout
//! carries nothing but generated text.

use std::error::Error;
use std::io::Write;

use duoshard_inference::{GreedyDecoder, HfTokenizer, ShardClient, StopReason, TextTokenizer};
use futures::{pin_mut, StreamExt};
use tracing::{info, warn};

use crate::config::WorkerConfig;

pub async fn run_prompt(config: WorkerConfig, prompt: &str) -> Result<(), Box<dyn Error>> {
    let tokenizer = HfTokenizer::load(&config.tokenizer, config.eos_token_id)?;
    info!("📖 Loaded tokenizer with vocab size {}", tokenizer.vocab_size());

    let client = ShardClient::connect(config.server.as_str()).await?;
    info!("🔗 Connected to inference service at {}", client.peer());

    let mut decoder = GreedyDecoder::new(client, tokenizer).with_max_tokens(config.max_tokens);
    let mut generated = 0usize;
    {
        let stream = decoder.generate(prompt)?;
        pin_mut!(stream);

        let mut stdout = std::io::stdout().lock();
        while let Some(delta) = stream.next().await {
            let delta = delta?;
            stdout.write_all(delta.as_bytes())?;
            stdout.flush()?;
            generated += 1;
        }
    }

    match decoder.stop_reason() {
        Some(StopReason::MaxTokens) => warn!(
            "⚠️ Output truncated at {} tokens ({} deltas)",
            config.max_tokens, generated
        ),
        Some(StopReason::EndOfSequence) => info!("✅ Finished after {} deltas", generated),
        None => {}
    }
    Ok(())
}
