//! Output sinks for a labeling batch.
//!
//! Writes four JSON Lines files into the output directory:
//!
//! | File | One row per |
//! |------|-------------|
//! | `labels.jsonl` | succeeded conversation |
//! | `labels_flat.jsonl` | (conversation, label) pair |
//! | `skipped.jsonl` | skipped conversation, with reason and redacted dialog |
//! | `failed.jsonl` | failed conversation, with error text |
//!
//! Rows follow input order.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::models::{LabelRecord, SampleReference};
use crate::orchestrator::BatchReport;

pub const LABELS_FILE: &str = "labels.jsonl";
pub const LABELS_FLAT_FILE: &str = "labels_flat.jsonl";
pub const SKIPPED_FILE: &str = "skipped.jsonl";
pub const FAILED_FILE: &str = "failed.jsonl";

#[derive(Debug, Serialize)]
struct LabelRow<'a> {
    conversation_id: &'a str,
    label_primary: &'a str,
    label_secondary: &'a [String],
    confidence: Option<f32>,
    summary: &'a str,
    reasoning: Option<&'a str>,
    nearest_sample_ids_with_scores: &'a [SampleReference],
    created_at: DateTime<Utc>,
}

impl<'a> From<&'a LabelRecord> for LabelRow<'a> {
    fn from(record: &'a LabelRecord) -> Self {
        Self {
            conversation_id: &record.conversation_id,
            label_primary: &record.result.label_primary,
            label_secondary: &record.result.label_secondary,
            confidence: record.result.confidence,
            summary: &record.result.summary,
            reasoning: record.result.reasoning.as_deref(),
            nearest_sample_ids_with_scores: &record.result.references,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct FlatRow<'a> {
    conversation_id: &'a str,
    label: &'a str,
    is_primary: bool,
}

/// Paths of the files written by [`write_outputs`].
#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub labels: PathBuf,
    pub labels_flat: PathBuf,
    pub skipped: PathBuf,
    pub failed: PathBuf,
}

fn write_jsonl<T, I>(path: &Path, rows: I) -> Result<usize>
where
    T: Serialize,
    I: IntoIterator<Item = T>,
{
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    let mut count = 0;
    for row in rows {
        serde_json::to_writer(&mut out, &row)?;
        out.write_all(b"\n")?;
        count += 1;
    }
    out.flush()?;
    Ok(count)
}

/// Primary label first, then secondary labels not equal to it.
fn flat_rows(record: &LabelRecord) -> Vec<FlatRow<'_>> {
    let primary = record.result.label_primary.as_str();
    std::iter::once(FlatRow {
        conversation_id: &record.conversation_id,
        label: primary,
        is_primary: true,
    })
    .chain(
        record
            .result
            .label_secondary
            .iter()
            .filter(|l| l.as_str() != primary)
            .map(|l| FlatRow {
                conversation_id: &record.conversation_id,
                label: l,
                is_primary: false,
            }),
    )
    .collect()
}

/// Write every sink for `report` under `dir`, creating it if needed.
pub fn write_outputs(dir: &Path, report: &BatchReport) -> Result<OutputPaths> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output dir: {}", dir.display()))?;

    let paths = OutputPaths {
        labels: dir.join(LABELS_FILE),
        labels_flat: dir.join(LABELS_FLAT_FILE),
        skipped: dir.join(SKIPPED_FILE),
        failed: dir.join(FAILED_FILE),
    };

    write_jsonl(&paths.labels, report.records().map(LabelRow::from))?;
    write_jsonl(&paths.labels_flat, report.records().flat_map(flat_rows))?;
    write_jsonl(&paths.skipped, report.skipped())?;
    write_jsonl(&paths.failed, report.failed())?;

    Ok(paths)
}

/// Human-readable end-of-run summary. Lists every failed and skipped id.
pub fn format_summary(report: &BatchReport) -> String {
    let (ok, failed, skipped) = report.counts();
    let mut s = String::new();
    let _ = writeln!(s, "Labeling complete");
    let _ = writeln!(s, "  succeeded: {}", ok);
    let _ = writeln!(s, "  failed:    {}", failed);
    let _ = writeln!(s, "  skipped:   {}", skipped);

    if failed > 0 {
        let _ = writeln!(s);
        let _ = writeln!(s, "Failed:");
        for f in report.failed() {
            let _ = writeln!(s, "  {}  {}", f.conversation_id, f.error);
        }
    }
    if skipped > 0 {
        let _ = writeln!(s);
        let _ = writeln!(s, "Skipped:");
        for r in report.skipped() {
            let _ = writeln!(s, "  {}  {}", r.conversation_id, r.reason);
        }
    }
    s
}
