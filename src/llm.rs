//! Chat-model client with per-model retry and backup-model fallback.
//!
//! [`LabelClient::complete_json`] tries the primary model up to
//! `max_attempts` times, then the backup model (if configured) with the
//! same policy. An attempt fails on a transport error, a non-2xx status,
//! or a reply that does not parse as a JSON object. Only when every
//! model/attempt combination has failed does the call return
//! [`LabelError::TerminalLabeling`] carrying the last cause.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::LlmConfig;
use crate::error::LabelError;
use crate::retry::{retry_with_backoff, Attempt, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A chat completion endpoint. Returns the raw assistant text.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn complete(&self, model: &str, messages: &[ChatMessage]) -> Result<String, LabelError>;
}

/// OpenAI-compatible `POST {base_url}/chat/completions` in JSON mode.
pub struct OpenAiChatBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    temperature: f32,
}

impl OpenAiChatBackend {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl LlmBackend for OpenAiChatBackend {
    async fn complete(&self, model: &str, messages: &[ChatMessage]) -> Result<String, LabelError> {
        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": self.temperature,
            "response_format": {"type": "json_object"},
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LabelError::transient(format!("{} request error: {}", model, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(LabelError::transient(format!(
                "{} API error {}: {}",
                model, status, body_text
            )));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| LabelError::transient(format!("{} returned invalid JSON: {}", model, e)))?;

        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| LabelError::transient(format!("{} response has no message content", model)))
    }
}

/// Parse a model reply as a JSON object. Tolerates a surrounding
/// ```` ```json ```` fence.
pub fn parse_json_object(text: &str) -> Result<Map<String, Value>, String> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected a JSON object, got {}", json_kind(&other))),
        Err(e) => Err(format!("reply is not valid JSON: {}", e)),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Model-call wrapper used by the orchestrator.
pub struct LabelClient {
    backend: Arc<dyn LlmBackend>,
    policy: RetryPolicy,
}

impl LabelClient {
    pub fn new(backend: Arc<dyn LlmBackend>, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    /// Complete with `primary_model`, falling back to `backup_model`.
    pub async fn complete_json(
        &self,
        messages: &[ChatMessage],
        primary_model: &str,
        backup_model: Option<&str>,
    ) -> Result<Map<String, Value>, LabelError> {
        let mut models = vec![primary_model];
        if let Some(backup) = backup_model.filter(|b| !b.is_empty() && *b != primary_model) {
            models.push(backup);
        }

        let mut total_attempts = 0;
        let mut last_cause = String::new();

        for (i, model) in models.iter().enumerate() {
            if i > 0 {
                info!(model, "falling back to backup model");
            }

            let backend = &self.backend;
            let outcome = retry_with_backoff(&self.policy, model, |_| async move {
                let text = backend
                    .complete(model, messages)
                    .await
                    .map_err(|e| Attempt::Retry(e.to_string()))?;
                parse_json_object(&text)
                    .map_err(|e| Attempt::Retry(format!("{}: {}", model, e)))
            })
            .await;

            match outcome {
                Ok(payload) => return Ok(payload),
                Err(failure) => {
                    total_attempts += failure.attempts;
                    warn!(model, attempts = failure.attempts, error = %failure.last_error, "model exhausted");
                    last_cause = failure.last_error;
                }
            }
        }

        Err(LabelError::TerminalLabeling {
            attempts: total_attempts,
            last_cause,
        })
    }
}
