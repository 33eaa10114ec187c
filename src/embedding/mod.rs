//! Embedding backends and vector utilities.
//!
//! Defines the [`Embedder`] trait and concrete implementations:
//! - **[`HashEmbedder`]**: offline deterministic term-hash vectors. No network or credentials.
//! - **[`TfidfEmbedder`]**: offline TF-IDF over hashed terms, fitted on each call's batch
//!   (corpus-relative: queries must be embedded together with the texts they are compared to).
//! - **[`OpenAIEmbedder`]**: calls the OpenAI embeddings API in retried batches.
//! - **[`OllamaEmbedder`]**: calls a local Ollama instance's `/api/embed` endpoint.
//!
//! # Provider Selection
//!
//! Use [`create_embedder`] to instantiate the backend named in the configuration:
//!
//! ```rust
//! # use support_labeler::config::EmbeddingConfig;
//! # use support_labeler::embedding::create_embedder;
//! let config = EmbeddingConfig::default(); // provider = "tfidf"
//! let embedder = create_embedder(&config).unwrap();
//! assert!(embedder.is_corpus_relative());
//! ```
//!
//! # Retry Strategy
//!
//! The remote backends share [`crate::retry`]:
//! - HTTP 429 (rate limited), 5xx, network errors and malformed bodies → retry
//! - Other HTTP 4xx → fail immediately
//! - Backoff: base, 2×, 4×, … capped at 32× the configured base delay

mod local;
mod remote;

pub use local::{HashEmbedder, TfidfEmbedder};
pub use remote::{OllamaEmbedder, OpenAIEmbedder};

use anyhow::{bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::config::EmbeddingConfig;
use crate::error::LabelError;

/// Converts text to fixed-length vectors.
///
/// `embed(texts).len() == texts.len()` always, and every vector returned by
/// one instance has the same length.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Returns the embedding vector dimensionality.
    fn dims(&self) -> usize;

    /// True when vectors are only comparable within a single `embed` call.
    fn is_corpus_relative(&self) -> bool {
        false
    }

    /// Embed a batch of texts, one vector per input in the same order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LabelError>;
}

/// Embed a single query text.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>, LabelError> {
    embedder
        .embed(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| LabelError::transient("Empty embedding response"))
}

/// Create the [`Embedder`] named by `config.provider`.
///
/// | Config Value | Backend |
/// |-------------|----------|
/// | `"tfidf"` | [`TfidfEmbedder`] |
/// | `"hash"` | [`HashEmbedder`] |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "tfidf" => Ok(Arc::new(TfidfEmbedder::new(
            config.dims.unwrap_or(local::DEFAULT_TFIDF_DIMS),
        ))),
        "hash" => Ok(Arc::new(HashEmbedder::new(
            config.dims.unwrap_or(local::DEFAULT_HASH_DIMS),
        ))),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors
/// of different lengths, or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// L2-normalize a vector in place. Zero vectors are left alone.
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Lowercased word unigrams followed by adjacent-word bigrams.
///
/// Anything that is not alphanumeric separates words, so mask tokens
/// such as `***` never become terms.
pub(crate) fn terms(text: &str) -> Vec<String> {
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect();

    let mut out = words.clone();
    for pair in words.windows(2) {
        out.push(format!("{} {}", pair[0], pair[1]));
    }
    out
}

/// Stable bucket for a term. Uses SHA-256 so vectors do not change between
/// builds or platforms.
pub(crate) fn bucket(term: &str, dims: usize) -> usize {
    let digest = Sha256::digest(term.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_le_bytes(head) % dims as u64) as usize
}
