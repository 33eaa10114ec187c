//! HTTP embedding backends.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::Embedder;
use crate::config::EmbeddingConfig;
use crate::error::LabelError;
use crate::retry::{retry_with_backoff, Attempt, RetryPolicy};

type ParseFn = fn(&Value) -> std::result::Result<Vec<Vec<f32>>, String>;

/// Settings shared by both HTTP backends.
struct HttpSettings {
    client: reqwest::Client,
    model: String,
    dims: Option<usize>,
    batch_size: usize,
    policy: RetryPolicy,
}

impl HttpSettings {
    fn from_config(config: &EmbeddingConfig, provider: &str) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for {} provider", provider))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            model,
            dims: config.dims,
            batch_size: config.batch_size.max(1),
            policy: config.retry_policy(),
        })
    }

    /// Send `texts` in `batch_size` chunks and check every vector has the
    /// same length.
    async fn embed_batched(
        &self,
        url: &str,
        bearer: Option<&str>,
        what: &str,
        parse: ParseFn,
        texts: &[String],
    ) -> std::result::Result<Vec<Vec<f32>>, LabelError> {
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            let body = serde_json::json!({
                "model": self.model,
                "input": chunk,
            });
            let vectors = post_embeddings(
                &self.client,
                url,
                bearer,
                &body,
                chunk.len(),
                &self.policy,
                what,
                parse,
            )
            .await?;
            debug!(what, batch = chunk.len(), "embedded batch");
            out.extend(vectors);
        }

        let expected = self.dims.or_else(|| out.first().map(Vec::len));
        if let Some(dims) = expected {
            if let Some(bad) = out.iter().find(|v| v.len() != dims) {
                return Err(LabelError::EmbeddingExhausted {
                    attempts: 1,
                    last_cause: format!(
                        "{} returned a {}-dim vector, expected {}",
                        what,
                        bad.len(),
                        dims
                    ),
                });
            }
        }
        Ok(out)
    }
}

/// POST one batch with retry. 429, 5xx, network errors and malformed
/// responses are retried; any other 4xx fails at once.
#[allow(clippy::too_many_arguments)]
async fn post_embeddings(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &Value,
    expected: usize,
    policy: &RetryPolicy,
    what: &str,
    parse: ParseFn,
) -> std::result::Result<Vec<Vec<f32>>, LabelError> {
    retry_with_backoff(policy, what, move |_| async move {
        let mut req = client.post(url).json(body);
        if let Some(key) = bearer {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| Attempt::Retry(format!("{} request error: {}", what, e)))?;
        let status = response.status();

        if status.is_success() {
            let json: Value = response
                .json()
                .await
                .map_err(|e| Attempt::Retry(format!("{} returned invalid JSON: {}", what, e)))?;
            let vectors = parse(&json).map_err(Attempt::Retry)?;
            if vectors.len() != expected {
                return Err(Attempt::Retry(format!(
                    "{} returned {} vectors for {} inputs",
                    what,
                    vectors.len(),
                    expected
                )));
            }
            return Ok(vectors);
        }

        let body_text = response.text().await.unwrap_or_default();
        let msg = format!("{} API error {}: {}", what, status, body_text);
        if status.as_u16() == 429 || status.is_server_error() {
            Err(Attempt::Retry(msg))
        } else {
            Err(Attempt::Fatal(msg))
        }
    })
    .await
    .map_err(|failure| LabelError::EmbeddingExhausted {
        attempts: failure.attempts,
        last_cause: failure.last_error,
    })
}

fn float_array(value: &Value) -> Option<Vec<f32>> {
    value
        .as_array()
        .map(|arr| arr.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &Value) -> std::result::Result<Vec<Vec<f32>>, String> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or("Invalid OpenAI response: missing data array")?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(float_array)
            .ok_or("Invalid OpenAI response: missing embedding")?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        indexed.push((index, embedding));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_ollama_response(json: &Value) -> std::result::Result<Vec<Vec<f32>>, String> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or("Invalid Ollama response: missing embeddings array")?;

    embeddings
        .iter()
        .map(|e| float_array(e).ok_or_else(|| "Invalid Ollama response: bad vector".to_string()))
        .collect()
}

// ============ OpenAI ============

/// Embedder backed by `POST {url}/embeddings`. Reads `OPENAI_API_KEY`.
pub struct OpenAIEmbedder {
    http: HttpSettings,
    api_key: String,
    endpoint: String,
}

impl OpenAIEmbedder {
    /// # Errors
    ///
    /// Returns an error if `model` is not set in config or if
    /// `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let http = HttpSettings::from_config(config, "OpenAI")?;
        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) => key,
            Err(_) => bail!("OPENAI_API_KEY environment variable not set"),
        };
        let base = config
            .url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1")
            .trim_end_matches('/');

        Ok(Self {
            http,
            api_key,
            endpoint: format!("{}/embeddings", base),
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.http.model
    }

    fn dims(&self) -> usize {
        self.http.dims.unwrap_or(1536)
    }

    async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, LabelError> {
        self.http
            .embed_batched(
                &self.endpoint,
                Some(&self.api_key),
                "OpenAI embeddings",
                parse_openai_response,
                texts,
            )
            .await
    }
}

// ============ Ollama ============

/// Embedder backed by a local Ollama instance (`POST {url}/api/embed`,
/// default `http://localhost:11434`).
pub struct OllamaEmbedder {
    http: HttpSettings,
    endpoint: String,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let http = HttpSettings::from_config(config, "Ollama")?;
        let base = config
            .url
            .as_deref()
            .unwrap_or("http://localhost:11434")
            .trim_end_matches('/');

        Ok(Self {
            http,
            endpoint: format!("{}/api/embed", base),
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.http.model
    }

    fn dims(&self) -> usize {
        self.http.dims.unwrap_or(768)
    }

    async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, LabelError> {
        self.http
            .embed_batched(
                &self.endpoint,
                None,
                "Ollama embeddings",
                parse_ollama_response,
                texts,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_response_is_reordered_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let out = parse_openai_response(&json).unwrap();
        assert_eq!(out, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_openai_response_without_data_is_error() {
        let err = parse_openai_response(&serde_json::json!({"error": "x"})).unwrap_err();
        assert!(err.contains("missing data"));
    }

    #[test]
    fn test_ollama_response() {
        let json = serde_json::json!({"embeddings": [[0.5, 0.5], [1.0, 0.0]]});
        assert_eq!(parse_ollama_response(&json).unwrap().len(), 2);
    }

    #[test]
    fn test_ollama_requires_model() {
        let cfg = EmbeddingConfig {
            provider: "ollama".into(),
            ..EmbeddingConfig::default()
        };
        assert!(OllamaEmbedder::new(&cfg).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_backend_exhausts_attempts() {
        let cfg = EmbeddingConfig {
            provider: "ollama".into(),
            model: Some("nomic-embed-text".into()),
            url: Some("http://127.0.0.1:9".into()),
            max_attempts: 2,
            backoff_base_ms: 0,
            timeout_secs: 2,
            ..EmbeddingConfig::default()
        };
        let embedder = OllamaEmbedder::new(&cfg).unwrap();
        let err = embedder.embed(&["hello".to_string()]).await.unwrap_err();
        match err {
            LabelError::EmbeddingExhausted { attempts, last_cause } => {
                assert_eq!(attempts, 2);
                assert!(last_cause.contains("request error"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
