//! Decoding orchestrator
//!
//! Greedy generation on the local node. Every step sends the whole token
//! sequence to the remote shard, takes the argmax of the last position and
//! yields the newly decoded text.

use async_trait::async_trait;
use candle_core::{DType, Device, IndexOp, Tensor};
use futures::stream::{self, Stream};
use tracing::{debug, info};

use crate::error::{InferenceError, Result};
use crate::tensor_transport::ShardClient;
use crate::tokenizer::TextTokenizer;

pub const MAX_NEW_TOKENS: usize = 64;
pub const CHAT_TEMPLATE: &str = "<|user|>\n{prompt}<|end|>\n<|assistant|>\n";

pub fn render_chat_prompt(prompt: &str) -> String {
    CHAT_TEMPLATE.replace("{prompt}", prompt)
}

/// Remote side of a decode step: token ids in, logits out
#[async_trait]
pub trait ForwardClient: Send {
    async fn forward(&mut self, input_ids: &Tensor) -> Result<Tensor>;
}

#[async_trait]
impl ForwardClient for ShardClient {
    async fn forward(&mut self, input_ids: &Tensor) -> Result<Tensor> {
        Ok(self.forward_ids(input_ids).await?)
    }
}

/// Why the last generation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfSequence,
    MaxTokens,
}

pub struct GreedyDecoder<C, T> {
    client: C,
    tokenizer: T,
    max_new_tokens: usize,
    stop_reason: Option<StopReason>,
}

struct DecodeState<'a, C, T> {
    decoder: &'a mut GreedyDecoder<C, T>,
    ids: Vec<u32>,
    prev_text: String,
    step: usize,
}

impl<C: ForwardClient, T: TextTokenizer> GreedyDecoder<C, T> {
    pub fn new(client: C, tokenizer: T) -> Self {
        Self {
            client,
            tokenizer,
            max_new_tokens: MAX_NEW_TOKENS,
            stop_reason: None,
        }
    }

    pub fn with_max_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    /// Set once a stream returned by [`generate`](Self::generate) has ended
    /// without error.
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    /// Lazy stream of text deltas for `prompt`. The stream ends on the EOS
    /// token or after the step limit; a failed round trip yields one error
    /// and ends it.
    pub fn generate(&mut self, prompt: &str) -> Result<impl Stream<Item = Result<String>> + '_> {
        let templated = render_chat_prompt(prompt);
        let ids = self.tokenizer.encode(&templated)?;
        let prev_text = self.tokenizer.decode(&ids)?;
        self.stop_reason = None;

        info!("🧠 Generating up to {} tokens from {} prompt tokens", self.max_new_tokens, ids.len());

        let state = DecodeState {
            decoder: self,
            ids,
            prev_text,
            step: 0,
        };

        Ok(stream::try_unfold(state, |mut state| async move {
            while state.step < state.decoder.max_new_tokens {
                state.step += 1;
                let next_id = state.decoder.next_token(&state.ids).await?;

                if next_id == state.decoder.tokenizer.eos_token_id() {
                    debug!("EOS after {} steps", state.step);
                    state.decoder.stop_reason = Some(StopReason::EndOfSequence);
                    return Ok(None);
                }

                state.ids.push(next_id);
                let text = state.decoder.tokenizer.decode(&state.ids)?;
                let delta = text_delta(&state.prev_text, &text).to_string();
                state.prev_text = text;

                if !delta.is_empty() {
                    return Ok(Some((delta, state)));
                }
            }

            debug!("Step limit of {} reached", state.decoder.max_new_tokens);
            state.decoder.stop_reason = Some(StopReason::MaxTokens);
            Ok::<_, InferenceError>(None)
        }))
    }

    async fn next_token(&mut self, ids: &[u32]) -> Result<u32> {
        let input: Vec<i64> = ids.iter().map(|&id| id as i64).collect();
        let input = Tensor::from_vec(input, (1, ids.len()), &Device::Cpu)?;

        let logits = self.client.forward(&input).await?;
        let last = last_position(&logits)?;
        greedy_token(&last)
    }
}

/// Index of the largest logit; the lowest index wins a tie
pub fn greedy_token(logits: &Tensor) -> Result<u32> {
    let values = logits.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        if best.map_or(true, |(_, top)| v > top) {
            best = Some((i, v));
        }
    }
    let (index, _) = best.ok_or(InferenceError::EmptyLogits)?;
    Ok(index as u32)
}

/// Logits of the last sequence position of the first batch row
fn last_position(logits: &Tensor) -> Result<Tensor> {
    if logits.elem_count() == 0 {
        return Err(InferenceError::EmptyLogits);
    }
    let last = match logits.dims() {
        [_, seq, _] => logits.i((0, seq - 1))?,
        [seq, _] => logits.i(seq - 1)?,
        [_] => logits.clone(),
        _ => return Err(InferenceError::EmptyLogits),
    };
    Ok(last)
}

/// Suffix of `text` that was not already in `prev`. When decoding rewrote
/// earlier characters the delta starts at the first difference.
pub fn text_delta<'a>(prev: &str, text: &'a str) -> &'a str {
    if let Some(rest) = text.strip_prefix(prev) {
        return rest;
    }
    let common = prev
        .char_indices()
        .zip(text.chars())
        .find(|((_, a), b)| a != b)
        .map(|((i, _), _)| i)
        .unwrap_or_else(|| prev.len().min(text.len()));
    &text[common..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_template() {
        assert_eq!(render_chat_prompt("hi"), "<|user|>\nhi<|end|>\n<|assistant|>\n");
    }

    #[test]
    fn test_text_delta() {
        assert_eq!(text_delta("Hello", "Hello world"), " world");
        assert_eq!(text_delta("abc", "abc"), "");
        assert_eq!(text_delta("caf\u{fffd}", "café!"), "é!");
    }

    #[test]
    fn test_greedy_token_prefers_first_maximum() {
        let logits = Tensor::new(&[0.5f32, 2.0, 2.0, -1.0], &Device::Cpu).unwrap();
        assert_eq!(greedy_token(&logits).unwrap(), 1);

        let logits = Tensor::new(&[f32::NAN, -3.0, 4.0], &Device::Cpu).unwrap();
        assert_eq!(greedy_token(&logits).unwrap(), 2);
    }

    #[test]
    fn test_last_position() {
        let logits = Tensor::new(&[[[0f32, 1.], [2., 3.]]], &Device::Cpu).unwrap();
        let last = last_position(&logits).unwrap();
        assert_eq!(last.to_vec1::<f32>().unwrap(), vec![2., 3.]);

        let empty = Tensor::zeros((1, 0, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(last_position(&empty), Err(InferenceError::EmptyLogits)));
    }
}
