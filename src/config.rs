use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Process-wide settings, loaded once and passed by reference.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub labeling: LabelingConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embedding_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_attempts: default_embedding_attempts(),
            timeout_secs: default_timeout_secs(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

impl EmbeddingConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.backoff_base_ms))
    }
}

fn default_provider() -> String {
    "tfidf".to_string()
}
fn default_batch_size() -> usize {
    100
}
fn default_embedding_attempts() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_backoff_base_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_primary_model")]
    pub primary_model: String,
    #[serde(default = "default_backup_model")]
    pub backup_model: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            primary_model: default_primary_model(),
            backup_model: default_backup_model(),
            base_url: default_base_url(),
            max_attempts: default_llm_attempts(),
            timeout_secs: default_llm_timeout_secs(),
            temperature: default_temperature(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

impl LlmConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.backoff_base_ms))
    }

    /// The fallback model; an empty string in the file disables it.
    pub fn backup(&self) -> Option<&str> {
        self.backup_model.as_deref().filter(|m| !m.trim().is_empty())
    }
}

fn default_primary_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_backup_model() -> Option<String> {
    Some("gpt-4.1-mini".to_string())
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_llm_attempts() -> u32 {
    3
}
fn default_llm_timeout_secs() -> u64 {
    60
}
fn default_temperature() -> f32 {
    0.2
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub min_similarity: f32,
    #[serde(default = "default_collection")]
    pub collection: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_similarity: 0.0,
            collection: default_collection(),
        }
    }
}

fn default_top_k() -> usize {
    3
}
fn default_collection() -> String {
    "samples".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilterConfig {
    #[serde(default = "default_profanity_threshold")]
    pub profanity_threshold: usize,
    #[serde(default = "default_service_keywords")]
    pub service_keywords: Vec<String>,
    /// Overrides the built-in profanity patterns when set.
    #[serde(default)]
    pub profanity_patterns: Option<Vec<String>>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            profanity_threshold: default_profanity_threshold(),
            service_keywords: default_service_keywords(),
            profanity_patterns: None,
        }
    }
}

fn default_profanity_threshold() -> usize {
    2
}

fn default_service_keywords() -> Vec<String> {
    [
        "환불", "배송", "결제", "주문", "취소", "교환", "반품", "계정", "로그인", "오류", "쿠폰",
        "포인트", "영수증", "구독", "요금",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LabelingConfig {
    #[serde(default = "default_max_labels")]
    pub max_labels: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_summary_excerpt_chars")]
    pub summary_excerpt_chars: usize,
    #[serde(default = "default_sample_text_chars")]
    pub sample_text_chars: usize,
}

impl Default for LabelingConfig {
    fn default() -> Self {
        Self {
            max_labels: default_max_labels(),
            workers: default_workers(),
            summary_excerpt_chars: default_summary_excerpt_chars(),
            sample_text_chars: default_sample_text_chars(),
        }
    }
}

fn default_max_labels() -> usize {
    2
}
fn default_workers() -> usize {
    4
}
fn default_summary_excerpt_chars() -> usize {
    200
}
fn default_sample_text_chars() -> usize {
    400
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./out")
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }

    if !(-1.0..=1.0).contains(&config.retrieval.min_similarity) {
        anyhow::bail!("retrieval.min_similarity must be in [-1.0, 1.0]");
    }

    if config.labeling.max_labels < 1 {
        anyhow::bail!("labeling.max_labels must be >= 1");
    }

    if config.labeling.workers < 1 {
        anyhow::bail!("labeling.workers must be >= 1");
    }

    if config.filter.profanity_threshold < 1 {
        anyhow::bail!("filter.profanity_threshold must be >= 1");
    }

    if config.llm.max_attempts < 1 {
        anyhow::bail!("llm.max_attempts must be >= 1");
    }

    if config.embedding.max_attempts < 1 {
        anyhow::bail!("embedding.max_attempts must be >= 1");
    }

    if config.embedding.batch_size < 1 {
        anyhow::bail!("embedding.batch_size must be >= 1");
    }

    match config.embedding.provider.as_str() {
        "tfidf" | "hash" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be tfidf, hash, openai, or ollama.",
            other
        ),
    }

    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.embedding.provider, "tfidf");
        assert_eq!(cfg.retrieval.top_k, 3);
        assert_eq!(cfg.labeling.max_labels, 2);
        assert_eq!(cfg.labeling.workers, 4);
        assert_eq!(cfg.llm.max_attempts, 3);
        assert_eq!(cfg.embedding.max_attempts, 5);
        assert_eq!(cfg.embedding.batch_size, 100);
        assert_eq!(cfg.llm.backup_model.as_deref(), Some("gpt-4.1-mini"));
        assert!(cfg.filter.service_keywords.iter().any(|k| k == "환불"));
    }

    #[test]
    fn sections_override_defaults() {
        let cfg = parse_config(
            r#"
[retrieval]
top_k = 5
min_similarity = 0.2

[filter]
profanity_threshold = 3
service_keywords = ["배송"]

[llm]
primary_model = "gpt-4o"
"#,
        )
        .unwrap();
        assert_eq!(cfg.retrieval.top_k, 5);
        assert!((cfg.retrieval.min_similarity - 0.2).abs() < 1e-6);
        assert_eq!(cfg.filter.profanity_threshold, 3);
        assert_eq!(cfg.filter.service_keywords, vec!["배송"]);
        assert_eq!(cfg.llm.primary_model, "gpt-4o");
    }

    #[test]
    fn remote_provider_requires_model() {
        let err = parse_config("[embedding]\nprovider = \"openai\"\n").unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
    }

    #[test]
    fn rejects_unknown_provider() {
        assert!(parse_config("[embedding]\nprovider = \"magic\"\n").is_err());
    }

    #[test]
    fn example_config_parses() {
        let cfg = parse_config(include_str!("../config/labeler.example.toml")).unwrap();
        assert_eq!(cfg.llm.backup(), Some("gpt-4.1-mini"));
        assert_eq!(cfg.output.dir, PathBuf::from("./out"));
    }

    #[test]
    fn rejects_zero_profanity_threshold() {
        let err = parse_config("[filter]\nprofanity_threshold = 0\n").unwrap_err();
        assert!(err.to_string().contains("filter.profanity_threshold"));
    }

    #[test]
    fn rejects_zero_top_k() {
        assert!(parse_config("[retrieval]\ntop_k = 0\n").is_err());
    }
}
