//! Tokenizer oracle
//!
//! Encoding, decoding and the end-of-sequence id, behind a trait so the
//! decoder can be driven by a fixed vocabulary in tests.

use std::path::{Path, PathBuf};

use tokenizers::Tokenizer;
use tracing::info;

use crate::error::{InferenceError, Result};

/// End-of-sequence markers tried in order when no override is given
pub const EOS_CANDIDATES: [&str; 3] = ["<|endoftext|>", "</s>", "<|end_of_text|>"];

pub trait TextTokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode, skipping special tokens
    fn decode(&self, ids: &[u32]) -> Result<String>;

    fn eos_token_id(&self) -> u32;

    fn vocab_size(&self) -> usize;
}

/// `tokenizer.json` backed tokenizer
pub struct HfTokenizer {
    inner: Tokenizer,
    eos_token_id: u32,
}

impl HfTokenizer {
    pub fn from_file(path: impl AsRef<Path>, eos_override: Option<u32>) -> Result<Self> {
        let path = path.as_ref();
        info!("📖 Loading tokenizer from {:?}", path);
        let inner = Tokenizer::from_file(path).map_err(|e| InferenceError::Tokenizer(e.to_string()))?;
        Self::from_tokenizer(inner, eos_override)
    }

    /// Fetch `tokenizer.json` of a hub repository (cached locally by hf-hub)
    pub fn from_pretrained(repo_id: &str, eos_override: Option<u32>) -> Result<Self> {
        info!("🌐 Fetching tokenizer for {}", repo_id);
        let api = hf_hub::api::sync::Api::new().map_err(|e| InferenceError::Tokenizer(e.to_string()))?;
        let path: PathBuf = api
            .model(repo_id.to_string())
            .get("tokenizer.json")
            .map_err(|e| InferenceError::Tokenizer(e.to_string()))?;
        Self::from_file(path, eos_override)
    }

    /// A local path (file or directory holding `tokenizer.json`) wins over a
    /// hub repository id.
    pub fn load(source: &str, eos_override: Option<u32>) -> Result<Self> {
        let path = Path::new(source);
        if path.is_dir() {
            Self::from_file(path.join("tokenizer.json"), eos_override)
        } else if path.is_file() {
            Self::from_file(path, eos_override)
        } else {
            Self::from_pretrained(source, eos_override)
        }
    }

    pub fn from_tokenizer(inner: Tokenizer, eos_override: Option<u32>) -> Result<Self> {
        let eos_token_id = match eos_override {
            Some(id) => id,
            None => EOS_CANDIDATES
                .iter()
                .find_map(|token| inner.token_to_id(token))
                .ok_or_else(|| InferenceError::Tokenizer("no end-of-sequence token in vocabulary".to_string()))?,
        };
        Ok(Self { inner, eos_token_id })
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| InferenceError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| InferenceError::Tokenizer(e.to_string()))
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}
