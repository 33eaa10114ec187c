//! Core data models used throughout the labeler.
//!
//! These types represent the sample library, the conversations being
//! labeled, and the label records that flow out of a batch run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A human-labeled reference conversation summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub id: String,
    pub label_primary: String,
    /// Ordered and deduplicated.
    #[serde(default)]
    pub label_secondary: Vec<String>,
    /// Text used for vectorization.
    pub summary_for_embedding: String,
    #[serde(default)]
    pub raw_text: Option<String>,
    #[serde(default)]
    pub source_conversation_id: Option<String>,
    pub origin: String,
    pub created_at: DateTime<Utc>,
    pub vector_id: String,
}

impl SampleRecord {
    /// Create a record whose `vector_id` defaults to its `id`.
    pub fn new(
        id: impl Into<String>,
        label_primary: impl Into<String>,
        summary_for_embedding: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            vector_id: id.clone(),
            id,
            label_primary: label_primary.into(),
            label_secondary: Vec::new(),
            summary_for_embedding: summary_for_embedding.into(),
            raw_text: None,
            source_conversation_id: None,
            origin: "manual".to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn with_secondary<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.label_secondary = dedup_labels(labels.into_iter().map(Into::into));
        self
    }

    pub fn with_raw_text(mut self, raw_text: impl Into<String>) -> Self {
        self.raw_text = Some(raw_text.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }
}

/// Collection of sample records keyed by id.
///
/// Iteration order is by id, which keeps retrieval deterministic when
/// two samples score the same.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleLibrary {
    records: BTreeMap<String, SampleRecord>,
    pub origin: String,
    pub created_at: DateTime<Utc>,
}

impl SampleLibrary {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            records: BTreeMap::new(),
            origin: origin.into(),
            created_at: Utc::now(),
        }
    }

    /// Build a library; a later record with the same id replaces an earlier one.
    pub fn from_records<I>(records: I, origin: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = SampleRecord>,
    {
        let mut library = Self::new(origin);
        for record in records {
            library.insert(record);
        }
        library
    }

    pub fn insert(&mut self, record: SampleRecord) -> Option<SampleRecord> {
        self.records.insert(record.id.clone(), record)
    }

    pub fn get(&self, id: &str) -> Option<&SampleRecord> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SampleRecord> {
        self.records.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    /// Merge `other` into a copy of `self`. Records in `other` win on id collisions.
    pub fn merge(&self, other: &SampleLibrary) -> SampleLibrary {
        let mut merged = self.clone();
        for record in other.iter() {
            merged.insert(record.clone());
        }
        merged.created_at = Utc::now();
        merged
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    #[serde(alias = "customer")]
    User,
    Manager,
    Bot,
    System,
}

impl SenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Manager => "manager",
            Self::Bot => "bot",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
}

/// A single utterance inside a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_type: SenderType,
    pub created_at: DateTime<Utc>,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// An ordered set of messages about one support issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    /// Build a conversation, sorting messages ascending by `created_at`.
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>, messages: Vec<Message>) -> Self {
        let mut convo = Self {
            id: id.into(),
            channel_id: None,
            created_at,
            closed_at: None,
            messages,
        };
        convo.sort_messages();
        convo
    }

    /// Restore the chronological ordering invariant. The sort is stable, so
    /// messages sharing a timestamp keep their input order.
    pub fn sort_messages(&mut self) {
        self.messages.sort_by_key(|m| m.created_at);
    }

    /// Message texts in chronological order separated by newlines, without
    /// sender prefixes. Used as the retrieval query.
    pub fn message_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Message texts in chronological order, one `sender: text` line each.
    pub fn dialog_text(&self) -> String {
        self.messages
            .iter()
            .filter(|m| !m.text.trim().is_empty())
            .map(|m| format!("{}: {}", m.sender_type.as_str(), m.text.trim()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Result item returned by the similarity retriever.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleMatch {
    pub sample_id: String,
    pub label_primary: String,
    pub label_secondary: Vec<String>,
    /// Cosine similarity; higher is closer.
    pub score: f32,
    pub summary: String,
    pub snippet: Option<String>,
}

/// A sample consulted while labeling, with its similarity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleReference {
    pub sample_id: String,
    pub score: f32,
}

/// Structured label for one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelResult {
    pub label_primary: String,
    pub label_secondary: Vec<String>,
    /// In `[0, 1]` when present.
    pub confidence: Option<f32>,
    pub summary: String,
    pub reasoning: Option<String>,
    pub references: Vec<SampleReference>,
}

/// Label outcome for a conversation; never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelRecord {
    pub conversation_id: String,
    pub result: LabelResult,
    pub created_at: DateTime<Utc>,
}

/// A conversation routed away from the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedRecord {
    pub conversation_id: String,
    pub reason: String,
    pub raw_dialog: String,
}

/// A conversation whose labeling failed terminally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedRecord {
    pub conversation_id: String,
    pub error: String,
}

/// Trim, drop blanks, and deduplicate labels keeping first-seen order.
pub fn dedup_labels<I>(labels: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut out: Vec<String> = Vec::new();
    for label in labels {
        let label = label.trim();
        if label.is_empty() || out.iter().any(|l| l == label) {
            continue;
        }
        out.push(label.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn msg(id: &str, minute: u32, sender: SenderType, text: &str) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            sender_type: sender,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap(),
            text: text.to_string(),
            attachments: Vec::new(),
        }
    }

    #[test]
    fn merge_is_last_write_wins() {
        let a = SampleLibrary::from_records(
            vec![
                SampleRecord::new("s1", "배송", "배송 지연 문의"),
                SampleRecord::new("s2", "결제", "카드 결제 오류"),
            ],
            "a",
        );
        let b = SampleLibrary::from_records(
            vec![
                SampleRecord::new("s1", "환불", "환불 요청"),
                SampleRecord::new("s3", "계정", "로그인 불가"),
            ],
            "b",
        );

        let merged = a.merge(&b);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.get("s1"), b.get("s1"));
        assert_eq!(merged.get("s2"), a.get("s2"));
    }

    #[test]
    fn vector_id_defaults_to_id() {
        let record = SampleRecord::new("s9", "환불", "환불 요청");
        assert_eq!(record.vector_id, "s9");
    }

    #[test]
    fn secondary_labels_are_deduplicated_in_order() {
        let record = SampleRecord::new("s1", "환불", "x").with_secondary(["결제", " 환불 ", "결제", ""]);
        assert_eq!(record.label_secondary, vec!["결제", "환불"]);
    }

    #[test]
    fn conversation_sorts_messages_on_construction() {
        let convo = Conversation::new(
            "c1",
            Utc::now(),
            vec![
                msg("m2", 5, SenderType::Manager, "확인해 드릴게요"),
                msg("m1", 1, SenderType::User, "환불 요청합니다"),
            ],
        );
        assert_eq!(convo.messages[0].id, "m1");
        assert_eq!(
            convo.dialog_text(),
            "user: 환불 요청합니다\nmanager: 확인해 드릴게요"
        );
        assert_eq!(convo.message_text(), "환불 요청합니다\n확인해 드릴게요");
    }

    #[test]
    fn sender_type_accepts_customer_alias() {
        let parsed: SenderType = serde_json::from_str("\"customer\"").unwrap();
        assert_eq!(parsed, SenderType::User);
    }
}
