//! Per-conversation labeling state machine and the batch driver.
//!
//! Each conversation moves through
//! `Pending → Redacted → (Dropped | Retrieved) → Prompted → (Labeled | Failed)`.
//! A batch runs conversations on a bounded pool of `workers` concurrent
//! tasks; every outcome is written to the slot matching its input position,
//! so the report is in input order whatever order tasks finish in.
//!
//! A failing conversation never aborts the batch. The only batch-level
//! errors are validation errors raised before any backend is called.

use futures::stream::{self, StreamExt};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::LabelError;
use crate::filter::TopicFilter;
use crate::index::VectorIndex;
use crate::llm::{LabelClient, LlmBackend};
use crate::models::{
    dedup_labels, Conversation, FailedRecord, LabelRecord, LabelResult, SampleLibrary,
    SampleMatch, SampleReference, SkippedRecord,
};
use crate::prompt::{build_messages, contains_guidance, truncate_chars};
use crate::redact::PiiRedactor;
use crate::retrieval::SimilarityRetriever;

pub const OFF_TOPIC_REASON: &str = "off-topic: abusive without service keywords";
pub const EMPTY_DIALOG_REASON: &str = "empty dialog";
const UNKNOWN_LABEL: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelState {
    Pending,
    Redacted,
    Dropped,
    Retrieved,
    Prompted,
    Labeled,
    Failed,
}

impl fmt::Display for LabelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Redacted => "redacted",
            Self::Dropped => "dropped",
            Self::Retrieved => "retrieved",
            Self::Prompted => "prompted",
            Self::Labeled => "labeled",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Final outcome for one conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded(LabelRecord),
    Failed(FailedRecord),
    Skipped(SkippedRecord),
}

impl Outcome {
    pub fn conversation_id(&self) -> &str {
        match self {
            Self::Succeeded(r) => &r.conversation_id,
            Self::Failed(r) => &r.conversation_id,
            Self::Skipped(r) => &r.conversation_id,
        }
    }
}

/// Outcomes of a batch, in input order.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub outcomes: Vec<Outcome>,
}

impl BatchReport {
    pub fn records(&self) -> impl Iterator<Item = &LabelRecord> {
        self.outcomes.iter().filter_map(|o| match o {
            Outcome::Succeeded(r) => Some(r),
            _ => None,
        })
    }

    pub fn failed(&self) -> impl Iterator<Item = &FailedRecord> {
        self.outcomes.iter().filter_map(|o| match o {
            Outcome::Failed(r) => Some(r),
            _ => None,
        })
    }

    pub fn skipped(&self) -> impl Iterator<Item = &SkippedRecord> {
        self.outcomes.iter().filter_map(|o| match o {
            Outcome::Skipped(r) => Some(r),
            _ => None,
        })
    }

    /// `(succeeded, failed, skipped)`
    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.records().count(),
            self.failed().count(),
            self.skipped().count(),
        )
    }
}

/// Settings the orchestrator reads on every conversation.
#[derive(Debug, Clone)]
pub struct LabelingSettings {
    pub top_k: usize,
    pub min_similarity: f32,
    pub max_labels: usize,
    pub workers: usize,
    pub summary_excerpt_chars: usize,
    pub sample_text_chars: usize,
    pub primary_model: String,
    pub backup_model: Option<String>,
}

impl LabelingSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            top_k: config.retrieval.top_k,
            min_similarity: config.retrieval.min_similarity,
            max_labels: config.labeling.max_labels,
            workers: config.labeling.workers,
            summary_excerpt_chars: config.labeling.summary_excerpt_chars,
            sample_text_chars: config.labeling.sample_text_chars,
            primary_model: config.llm.primary_model.clone(),
            backup_model: config.llm.backup().map(str::to_string),
        }
    }
}

pub struct LabelingOrchestrator {
    redactor: PiiRedactor,
    filter: TopicFilter,
    retriever: SimilarityRetriever,
    client: LabelClient,
    settings: LabelingSettings,
}

impl LabelingOrchestrator {
    pub fn new(
        filter: TopicFilter,
        retriever: SimilarityRetriever,
        client: LabelClient,
        settings: LabelingSettings,
    ) -> Self {
        Self {
            redactor: PiiRedactor::default(),
            filter,
            retriever,
            client,
            settings,
        }
    }

    /// Wire every component from one configuration value.
    pub fn from_config(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        backend: Arc<dyn LlmBackend>,
    ) -> anyhow::Result<Self> {
        let filter = TopicFilter::new(&config.filter)?;
        let retriever =
            SimilarityRetriever::new(embedder, index, config.retrieval.collection.clone());
        let client = LabelClient::new(backend, config.llm.retry_policy());
        Ok(Self::new(
            filter,
            retriever,
            client,
            LabelingSettings::from_config(config),
        ))
    }

    /// Label every conversation, at most `workers` at a time.
    pub async fn label_batch(
        &self,
        conversations: &[Conversation],
        library: &SampleLibrary,
    ) -> Result<BatchReport, LabelError> {
        if conversations.is_empty() {
            return Err(LabelError::validation("conversation set is empty"));
        }
        let mut seen = HashSet::new();
        for convo in conversations {
            if !seen.insert(convo.id.as_str()) {
                return Err(LabelError::validation(format!(
                    "duplicate conversation id: {}",
                    convo.id
                )));
            }
        }

        info!(
            conversations = conversations.len(),
            samples = library.len(),
            workers = self.settings.workers,
            "labeling batch"
        );

        let finished: Vec<(usize, Outcome)> = stream::iter(conversations.iter().enumerate())
            .map(|(i, convo)| async move { (i, self.label_one(convo, library).await) })
            .buffer_unordered(self.settings.workers.max(1))
            .collect()
            .await;

        let mut slots: Vec<Option<Outcome>> = vec![None; conversations.len()];
        for (i, outcome) in finished {
            slots[i] = Some(outcome);
        }

        let report = BatchReport {
            outcomes: slots.into_iter().flatten().collect(),
        };
        let (ok, failed, skipped) = report.counts();
        info!(succeeded = ok, failed, skipped, "batch complete");
        Ok(report)
    }

    /// Run one conversation through the state machine.
    pub async fn label_one(&self, conversation: &Conversation, library: &SampleLibrary) -> Outcome {
        let id = conversation.id.as_str();
        let mut state = LabelState::Pending;
        debug!(conversation = id, %state);

        let dialog = self.redactor.mask(&conversation.dialog_text());
        state = LabelState::Redacted;
        debug!(conversation = id, %state);

        if dialog.trim().is_empty() {
            return self.skip(id, EMPTY_DIALOG_REASON, dialog);
        }
        if self.filter.is_off_topic(&dialog) {
            return self.skip(id, OFF_TOPIC_REASON, dialog);
        }

        let query = self.redactor.mask(&conversation.message_text());
        let matches = self
            .retriever
            .retrieve_text(
                &query,
                library,
                self.settings.top_k,
                self.settings.min_similarity,
            )
            .await;
        state = LabelState::Retrieved;
        debug!(conversation = id, %state, matches = matches.len());

        let messages = build_messages(
            &dialog,
            &matches,
            self.settings.max_labels,
            self.settings.sample_text_chars,
        );
        state = LabelState::Prompted;
        debug!(conversation = id, %state);

        let payload = match self
            .client
            .complete_json(
                &messages,
                &self.settings.primary_model,
                self.settings.backup_model.as_deref(),
            )
            .await
        {
            Ok(payload) => payload,
            Err(e) => {
                state = LabelState::Failed;
                warn!(conversation = id, %state, error = %e);
                return Outcome::Failed(FailedRecord {
                    conversation_id: id.to_string(),
                    error: e.to_string(),
                });
            }
        };

        let result = self.build_result(&payload, &matches, &dialog);
        state = LabelState::Labeled;
        debug!(conversation = id, %state, label = %result.label_primary);

        Outcome::Succeeded(LabelRecord {
            conversation_id: id.to_string(),
            result,
            created_at: chrono::Utc::now(),
        })
    }

    fn skip(&self, id: &str, reason: &str, dialog: String) -> Outcome {
        info!(conversation = id, state = %LabelState::Dropped, reason);
        Outcome::Skipped(SkippedRecord {
            conversation_id: id.to_string(),
            reason: reason.to_string(),
            raw_dialog: dialog,
        })
    }

    fn build_result(
        &self,
        payload: &Map<String, Value>,
        matches: &[SampleMatch],
        dialog: &str,
    ) -> LabelResult {
        let model_primary = string_field(payload, "label_primary");
        let model_secondary = string_list_field(payload, "label_secondary");

        let merged = merge_labels(
            matches.iter().map(|m| m.label_primary.clone()),
            model_primary.into_iter().chain(model_secondary),
            self.settings.max_labels,
        );

        // The primary label is always one of the capped labels.
        let label_primary = merged
            .first()
            .cloned()
            .unwrap_or_else(|| UNKNOWN_LABEL.to_string());

        let summary = match string_field(payload, "summary") {
            Some(s) if !contains_guidance(&s) => s,
            Some(_) => {
                warn!("model summary echoed the prompt; using dialog excerpt");
                truncate_chars(dialog, self.settings.summary_excerpt_chars)
            }
            None => truncate_chars(dialog, self.settings.summary_excerpt_chars),
        };

        LabelResult {
            label_primary,
            label_secondary: merged,
            confidence: confidence_field(payload),
            summary: self.redactor.mask(&summary),
            reasoning: string_field(payload, "reasoning").map(|r| self.redactor.mask(&r)),
            references: matches
                .iter()
                .map(|m| SampleReference {
                    sample_id: m.sample_id.clone(),
                    score: m.score,
                })
                .collect(),
        }
    }
}

/// Sample labels first, then model labels; deduplicated in first-seen order
/// and capped at `max_labels`.
pub fn merge_labels<S, M>(sample_labels: S, model_labels: M, max_labels: usize) -> Vec<String>
where
    S: IntoIterator<Item = String>,
    M: IntoIterator<Item = String>,
{
    let mut merged = dedup_labels(sample_labels.into_iter().chain(model_labels));
    merged.truncate(max_labels);
    merged
}

fn string_field(payload: &Map<String, Value>, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Accepts an array of strings or a single `,`/`|`-separated string.
fn string_list_field(payload: &Map<String, Value>, key: &str) -> Vec<String> {
    match payload.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => s.split([',', '|']).map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

/// A number (or numeric string) in `[0, 1]`; anything else is `None`.
fn confidence_field(payload: &Map<String, Value>) -> Option<f32> {
    let value = match payload.get("confidence")? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (0.0..=1.0).contains(&value).then_some(value as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    fn labels(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn sample_labels_win_and_cap_applies() {
        let merged = merge_labels(labels(&["환불", "결제"]), labels(&["기타", "환불"]), 2);
        assert_eq!(merged, labels(&["환불", "결제"]));
    }

    #[test]
    fn model_labels_fill_remaining_slots() {
        let merged = merge_labels(labels(&["환불", "환불"]), labels(&["배송", "기타"]), 2);
        assert_eq!(merged, labels(&["환불", "배송"]));
    }

    #[test]
    fn no_labels_at_all() {
        assert!(merge_labels(Vec::new(), Vec::new(), 2).is_empty());
    }

    #[test]
    fn confidence_outside_range_is_null() {
        assert_eq!(confidence_field(&map(json!({"confidence": 0.4}))), Some(0.4));
        assert_eq!(confidence_field(&map(json!({"confidence": "0.9"}))), Some(0.9));
        assert_eq!(confidence_field(&map(json!({"confidence": 1.5}))), None);
        assert_eq!(confidence_field(&map(json!({"confidence": -0.1}))), None);
        assert_eq!(confidence_field(&map(json!({"confidence": "high"}))), None);
        assert_eq!(confidence_field(&map(json!({}))), None);
    }

    #[test]
    fn secondary_labels_accept_delimited_string() {
        let payload = map(json!({"label_secondary": "배송, 교환|반품"}));
        assert_eq!(
            dedup_labels(string_list_field(&payload, "label_secondary")),
            labels(&["배송", "교환", "반품"])
        );
    }

    #[test]
    fn blank_strings_are_absent() {
        let payload = map(json!({"label_primary": "  ", "summary": 3}));
        assert_eq!(string_field(&payload, "label_primary"), None);
        assert_eq!(string_field(&payload, "summary"), None);
    }
}
