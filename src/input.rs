//! Conversation datasets.
//!
//! Files are a JSON array of objects or JSON Lines (one object per line).
//! Two record shapes are accepted:
//!
//! - **structured**: `id`, optional `channel_id`/`created_at`/`closed_at`,
//!   and a `messages` array of `{id, sender_type, created_at, text}`
//! - **flat**: `thread_id` plus `message_concat`, or `message_first` and
//!   `message_last` when the concatenation is missing
//!
//! Required fields are checked for the whole dataset before anything is
//! embedded or sent to a model.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;

use crate::error::LabelError;
use crate::models::{Attachment, Conversation, Message, SenderType};

pub type Row = Map<String, Value>;

const ID_KEYS: &[&str] = &["thread_id", "id", "conversation_id", "chat_id"];
const CONCAT_KEYS: &[&str] = &["message_concat", "text", "dialog"];
const FIRST_KEY: &str = "message_first";
const LAST_KEY: &str = "message_last";
const FALLBACK_SEPARATOR: &str = " || ";

/// Read a JSON array or JSON Lines file into row objects.
pub fn load_rows(path: &Path) -> Result<Vec<Row>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_rows(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn parse_rows(content: &str) -> Result<Vec<Row>> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('[') {
        let values: Vec<Value> = serde_json::from_str(trimmed)?;
        return values
            .into_iter()
            .enumerate()
            .map(|(i, v)| into_row(v).with_context(|| format!("record {}", i + 1)))
            .collect();
    }

    let mut rows = Vec::new();
    for (i, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let value: Value =
            serde_json::from_str(line).with_context(|| format!("line {}", i + 1))?;
        rows.push(into_row(value).with_context(|| format!("line {}", i + 1))?);
    }
    Ok(rows)
}

fn into_row(value: Value) -> Result<Row> {
    match value {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("expected a JSON object"),
    }
}

/// First non-blank value among `keys`, rendered as a trimmed string.
pub(crate) fn cell_str(row: &Row, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match row.get(*k)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

/// RFC 3339, `YYYY-MM-DD HH:MM:SS` (taken as UTC), or epoch seconds /
/// milliseconds.
pub(crate) fn parse_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| Utc.from_utc_datetime(&naive))
        }
        Value::Number(n) => {
            let raw = n.as_i64()?;
            if raw > 100_000_000_000 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        _ => None,
    }
}

fn datetime_field(row: &Row, key: &str) -> Option<DateTime<Utc>> {
    row.get(key).and_then(parse_datetime)
}

/// Which required fields a row lacks.
fn missing_fields(row: &Row) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if cell_str(row, ID_KEYS).is_none() {
        missing.push("thread_id");
    }
    let has_messages = row
        .get("messages")
        .and_then(Value::as_array)
        .is_some_and(|m| !m.is_empty());
    let has_text = cell_str(row, CONCAT_KEYS).is_some()
        || cell_str(row, &[FIRST_KEY]).is_some()
        || cell_str(row, &[LAST_KEY]).is_some();
    if !has_messages && !has_text {
        missing.push("message_concat");
    }
    missing
}

/// Validate rows and turn them into conversations with sorted messages.
pub fn conversations_from_rows(rows: &[Row]) -> Result<Vec<Conversation>, LabelError> {
    if rows.is_empty() {
        return Err(LabelError::validation("conversation set is empty"));
    }

    let mut missing: Vec<String> = Vec::new();
    for field in ["thread_id", "message_concat"] {
        let lacking: Vec<usize> = rows
            .iter()
            .enumerate()
            .filter(|(_, row)| missing_fields(row).contains(&field))
            .map(|(i, _)| i + 1)
            .collect();
        if lacking.len() == rows.len() {
            missing.push(field.to_string());
        } else if !lacking.is_empty() {
            let records: Vec<String> = lacking.iter().map(usize::to_string).collect();
            missing.push(format!("{} (records {})", field, records.join(", ")));
        }
    }
    if !missing.is_empty() {
        return Err(LabelError::MissingFields(missing));
    }

    let conversations: Vec<Conversation> = rows
        .iter()
        .map(conversation_from_row)
        .collect::<Result<_, _>>()?;

    let mut seen = HashSet::new();
    for convo in &conversations {
        if !seen.insert(convo.id.as_str()) {
            return Err(LabelError::validation(format!(
                "duplicate conversation id: {}",
                convo.id
            )));
        }
    }
    Ok(conversations)
}

pub fn load_conversations(path: &Path) -> Result<Vec<Conversation>> {
    let rows = load_rows(path)?;
    Ok(conversations_from_rows(&rows)?)
}

fn conversation_from_row(row: &Row) -> Result<Conversation, LabelError> {
    let id = cell_str(row, ID_KEYS)
        .ok_or_else(|| LabelError::MissingFields(vec!["thread_id".into()]))?;
    let created_at = datetime_field(row, "created_at").unwrap_or_else(Utc::now);

    let messages = match row.get("messages").and_then(Value::as_array) {
        Some(items) if !items.is_empty() => items
            .iter()
            .enumerate()
            .map(|(i, item)| message_from_value(&id, i, item, created_at))
            .collect::<Result<Vec<_>, _>>()?,
        _ => vec![Message {
            id: format!("{}-0", id),
            conversation_id: id.clone(),
            sender_type: SenderType::User,
            created_at,
            text: flat_text(row),
            attachments: Vec::new(),
        }],
    };

    let mut convo = Conversation::new(id, created_at, messages);
    convo.channel_id = cell_str(row, &["channel_id", "channel"]);
    convo.closed_at = datetime_field(row, "closed_at");
    Ok(convo)
}

/// `message_concat`, else `message_first || message_last`.
fn flat_text(row: &Row) -> String {
    if let Some(text) = cell_str(row, CONCAT_KEYS) {
        return text;
    }
    [cell_str(row, &[FIRST_KEY]), cell_str(row, &[LAST_KEY])]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(FALLBACK_SEPARATOR)
}

fn message_from_value(
    conversation_id: &str,
    position: usize,
    value: &Value,
    default_time: DateTime<Utc>,
) -> Result<Message, LabelError> {
    let Value::Object(obj) = value else {
        return Err(LabelError::validation(format!(
            "conversation {}: message {} is not an object",
            conversation_id,
            position + 1
        )));
    };

    let sender_type = match obj.get("sender_type").or_else(|| obj.get("personType")) {
        Some(v) => serde_json::from_value(v.clone()).map_err(|_| {
            LabelError::validation(format!(
                "conversation {}: message {} has unknown sender_type {}",
                conversation_id,
                position + 1,
                v
            ))
        })?,
        None => SenderType::User,
    };

    let attachments = obj
        .get("attachments")
        .cloned()
        .map(serde_json::from_value::<Vec<Attachment>>)
        .transpose()
        .map_err(|e| {
            LabelError::validation(format!(
                "conversation {}: message {} has malformed attachments: {}",
                conversation_id,
                position + 1,
                e
            ))
        })?
        .unwrap_or_default();

    Ok(Message {
        id: cell_str(obj, &["id"]).unwrap_or_else(|| format!("{}-{}", conversation_id, position)),
        conversation_id: conversation_id.to_string(),
        sender_type,
        created_at: datetime_field(obj, "created_at").unwrap_or(default_time),
        text: cell_str(obj, &["text", "plain_text", "plainText"]).unwrap_or_default(),
        attachments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_array_and_jsonl() {
        let array = parse_rows(r#"[{"thread_id": "t1"}, {"thread_id": "t2"}]"#).unwrap();
        assert_eq!(array.len(), 2);
        let lines = parse_rows("{\"thread_id\": \"t1\"}\n\n{\"thread_id\": 2}\n").unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(cell_str(&lines[1], &["thread_id"]).as_deref(), Some("2"));
    }

    #[test]
    fn jsonl_error_names_the_line() {
        let err = parse_rows("{\"a\": 1}\nnot json\n").unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
    }

    #[test]
    fn missing_columns_are_listed_before_any_work() {
        let rows = parse_rows(r#"[{"foo": 1}, {"bar": 2}]"#).unwrap();
        match conversations_from_rows(&rows).unwrap_err() {
            LabelError::MissingFields(fields) => {
                assert_eq!(fields, vec!["thread_id", "message_concat"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn partially_missing_field_names_records() {
        let rows = parse_rows(
            r#"[{"thread_id": "a", "message_concat": "환불"}, {"thread_id": "b"}]"#,
        )
        .unwrap();
        match conversations_from_rows(&rows).unwrap_err() {
            LabelError::MissingFields(fields) => {
                assert_eq!(fields, vec!["message_concat (records 2)"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn flat_record_falls_back_to_first_and_last() {
        let rows = parse_rows(
            r#"[{"thread_id": "a", "message_first": "환불 문의", "message_last": "감사합니다"}]"#,
        )
        .unwrap();
        let convos = conversations_from_rows(&rows).unwrap();
        assert_eq!(convos[0].messages[0].text, "환불 문의 || 감사합니다");
    }

    #[test]
    fn structured_messages_are_sorted() {
        let rows = parse_rows(
            r#"[{
                "id": "c1",
                "channel_id": "web",
                "messages": [
                    {"id": "m2", "sender_type": "manager", "created_at": "2024-05-01T10:05:00Z", "text": "확인할게요"},
                    {"id": "m1", "sender_type": "user", "created_at": "2024-05-01T10:00:00Z", "text": "환불 요청"}
                ]
            }]"#,
        )
        .unwrap();
        let convo = &conversations_from_rows(&rows).unwrap()[0];
        assert_eq!(convo.messages[0].id, "m1");
        assert_eq!(convo.messages[1].sender_type, SenderType::Manager);
        assert_eq!(convo.channel_id.as_deref(), Some("web"));
    }

    #[test]
    fn duplicate_ids_and_empty_sets_are_rejected() {
        let rows = parse_rows(
            r#"[{"thread_id": "a", "message_concat": "x"}, {"thread_id": "a", "message_concat": "y"}]"#,
        )
        .unwrap();
        assert!(conversations_from_rows(&rows).unwrap_err().is_validation());
        assert!(conversations_from_rows(&[]).unwrap_err().is_validation());
    }

    #[test]
    fn datetime_formats() {
        assert!(parse_datetime(&Value::from("2024-05-01T10:00:00+09:00")).is_some());
        assert!(parse_datetime(&Value::from("2024-05-01 10:00:00")).is_some());
        let ms = parse_datetime(&Value::from(1_714_557_600_000i64)).unwrap();
        let s = parse_datetime(&Value::from(1_714_557_600i64)).unwrap();
        assert_eq!(ms, s);
        assert!(parse_datetime(&Value::from("yesterday")).is_none());
    }
}
