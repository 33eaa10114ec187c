//! Sample ingestion: rows → validated [`SampleRecord`]s → library → vector index.
//!
//! Every ingestion resets the target collection before upserting, so
//! samples removed from the file cannot linger as stale neighbors.
//! Rows with blank required cells are skipped and reported; a required
//! column missing from the whole file rejects the dataset.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::embedding::Embedder;
use crate::error::LabelError;
use crate::index::{InMemoryIndex, VectorIndex};
use crate::input::{cell_str, parse_datetime, Row};
use crate::models::{dedup_labels, SampleLibrary, SampleRecord};

const ID_KEYS: &[&str] = &["sample_id", "id", "thread_id"];
const LABEL_KEYS: &[&str] = &["label_primary", "labels"];
const SUMMARY_KEYS: &[&str] = &["summary", "summary_for_embedding", "text"];

/// Result of turning rows into records.
#[derive(Debug, Default)]
pub struct ParsedSamples {
    pub records: Vec<SampleRecord>,
    pub errors: Vec<String>,
}

/// Outcome of an ingestion run.
#[derive(Debug)]
pub struct IngestReport {
    pub library: SampleLibrary,
    pub embedded: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

/// Split a `,`/`|`-delimited cell (or a JSON array) into trimmed labels.
pub fn split_labels(value: Option<&Value>) -> Vec<String> {
    let raw: Vec<String> = match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        Some(Value::String(s)) => s.split([',', '|']).map(str::to_string).collect(),
        _ => Vec::new(),
    };
    dedup_labels(raw)
}

/// Validate rows and convert them to sample records.
pub fn parse_samples(rows: &[Row], origin: &str) -> Result<ParsedSamples, LabelError> {
    if rows.is_empty() {
        return Err(LabelError::validation("sample file is empty"));
    }

    let mut missing = Vec::new();
    if !rows.iter().any(|r| LABEL_KEYS.iter().any(|k| r.contains_key(*k))) {
        missing.push("label_primary".to_string());
    }
    if !rows.iter().any(|r| SUMMARY_KEYS.iter().any(|k| r.contains_key(*k))) {
        missing.push("summary".to_string());
    }
    if !missing.is_empty() {
        return Err(LabelError::MissingFields(missing));
    }

    let mut parsed = ParsedSamples::default();
    for (i, row) in rows.iter().enumerate() {
        match record_from_row(row, origin) {
            Ok(record) => parsed.records.push(record),
            Err(reason) => parsed.errors.push(format!("row {}: {}", i + 1, reason)),
        }
    }
    Ok(parsed)
}

fn record_from_row(row: &Row, origin: &str) -> std::result::Result<SampleRecord, String> {
    // `labels` may carry the whole list: first entry is primary.
    let (label_primary, mut secondary) = match cell_str(row, &["label_primary"]) {
        Some(label) => (label, Vec::new()),
        None => {
            let mut all = split_labels(row.get("labels"));
            if all.is_empty() {
                return Err("label_primary is empty".to_string());
            }
            let first = all.remove(0);
            (first, all)
        }
    };

    let summary = cell_str(row, SUMMARY_KEYS).ok_or_else(|| "summary is empty".to_string())?;
    secondary.extend(split_labels(row.get("label_secondary")));

    let id = cell_str(row, ID_KEYS).unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut record = SampleRecord::new(id, label_primary, summary)
        .with_secondary(secondary)
        .with_origin(origin);

    if let Some(raw) = cell_str(row, &["raw_text", "message_concat"]) {
        record = record.with_raw_text(raw);
    }
    record.source_conversation_id = cell_str(row, &["source_conversation_id"]);

    if let Some(value) = row.get("created_at").filter(|v| !v.is_null()) {
        record.created_at = parse_datetime(value)
            .ok_or_else(|| format!("created_at is not a valid datetime: {}", value))?;
    }
    Ok(record)
}

/// Reset `collection`, embed every summary and upsert it. Returns the
/// number of vectors written.
pub async fn index_library(
    embedder: &dyn Embedder,
    index: &dyn VectorIndex,
    collection: &str,
    library: &SampleLibrary,
) -> Result<usize, LabelError> {
    index.reset(collection);
    if library.is_empty() {
        return Ok(0);
    }

    let records: Vec<&SampleRecord> = library.iter().collect();
    let texts: Vec<String> = records
        .iter()
        .map(|r| r.summary_for_embedding.clone())
        .collect();
    let vectors = embedder.embed(&texts).await?;
    if vectors.len() != texts.len() {
        return Err(LabelError::transient(format!(
            "embedder returned {} vectors for {} samples",
            vectors.len(),
            texts.len()
        )));
    }

    let ids: Vec<String> = records.iter().map(|r| r.vector_id.clone()).collect();
    let metadata: Vec<Value> = records
        .iter()
        .map(|r| {
            json!({
                "sample_id": r.id,
                "label_primary": r.label_primary,
                "label_secondary": r.label_secondary,
                "summary": r.summary_for_embedding,
                "model": embedder.model_name(),
            })
        })
        .collect();
    index.upsert(collection, &ids, &vectors, &metadata)?;
    Ok(ids.len())
}

/// True when the stored vectors for `library` were not produced by
/// `embedder`: an entry is missing, its length differs from
/// `embedder.dims()`, or it records another model name.
pub fn index_is_stale(
    embedder: &dyn Embedder,
    index: &InMemoryIndex,
    collection: &str,
    library: &SampleLibrary,
) -> bool {
    library.iter().any(|record| match index.get(collection, &record.vector_id) {
        Some(entry) => {
            entry.vector.len() != embedder.dims()
                || entry.metadata.get("model").and_then(Value::as_str)
                    != Some(embedder.model_name())
        }
        None => true,
    })
}

/// Builds a library from rows and indexes it.
pub struct SampleIngestor {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    collection: String,
}

impl SampleIngestor {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            embedder,
            index,
            collection: collection.into(),
        }
    }

    /// Ingest `rows`, merging over `base` when given (same id: new row wins).
    pub async fn ingest(
        &self,
        rows: &[Row],
        origin: &str,
        base: Option<&SampleLibrary>,
    ) -> Result<IngestReport, LabelError> {
        let parsed = parse_samples(rows, origin)?;
        for error in &parsed.errors {
            warn!(origin, "{}", error);
        }

        let fresh = SampleLibrary::from_records(parsed.records, origin);
        let library = match base {
            Some(base) => base.merge(&fresh),
            None => fresh,
        };

        let embedded = index_library(
            self.embedder.as_ref(),
            self.index.as_ref(),
            &self.collection,
            &library,
        )
        .await?;

        info!(
            origin,
            samples = library.len(),
            embedded,
            skipped = parsed.errors.len(),
            "sample ingestion complete"
        );

        Ok(IngestReport {
            library,
            embedded,
            skipped: parsed.errors.len(),
            errors: parsed.errors,
        })
    }
}

pub fn save_library(path: &Path, library: &SampleLibrary) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(library)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write sample library: {}", path.display()))?;
    Ok(())
}

pub fn load_library(path: &Path) -> Result<SampleLibrary> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read sample library: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse sample library: {}", path.display()))
}
