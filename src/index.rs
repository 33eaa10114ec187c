//! In-memory vector index keyed by collection and id.
//!
//! Entries live in a `BTreeMap` behind `std::sync::RwLock`; queries are
//! brute-force cosine similarity over every vector in the collection.
//! The whole index can be written to and read back from a JSON snapshot so
//! an ingestion run can be reused by later labeling runs.
//!
//! Mutation (`upsert`/`reset`) and querying are expected to happen in
//! separate phases: ingest fully, then query.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use crate::embedding::cosine_similarity;
use crate::error::LabelError;

/// A stored vector with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub vector: Vec<f32>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// One ranked result of [`VectorIndex::query`].
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMatch {
    pub id: String,
    pub score: f32,
    pub metadata: serde_json::Value,
}

/// Storage for embeddings, scoped by collection name.
pub trait VectorIndex: Send + Sync {
    /// Insert or overwrite entries by id. Re-upserting an id replaces it.
    fn upsert(
        &self,
        collection: &str,
        ids: &[String],
        vectors: &[Vec<f32>],
        metadata: &[serde_json::Value],
    ) -> Result<(), LabelError>;

    /// Drop every entry in `collection`.
    fn reset(&self, collection: &str);

    /// Up to `k` entries ranked by descending cosine similarity. A missing
    /// or empty collection yields an empty list.
    fn query(&self, collection: &str, vector: &[f32], k: usize) -> Vec<IndexMatch>;

    /// Number of entries in `collection`.
    fn count(&self, collection: &str) -> usize;
}

#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    collections: HashMap<String, BTreeMap<String, IndexEntry>>,
}

/// In-process [`VectorIndex`].
#[derive(Default)]
pub struct InMemoryIndex {
    collections: RwLock<HashMap<String, BTreeMap<String, IndexEntry>>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a snapshot written by [`InMemoryIndex::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read index snapshot: {}", path.display()))?;
        let snapshot: Snapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse index snapshot: {}", path.display()))?;
        Ok(Self {
            collections: RwLock::new(snapshot.collections),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot = Snapshot {
            collections: self
                .collections
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(&snapshot)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write index snapshot: {}", path.display()))?;
        Ok(())
    }

    /// The stored vector for `id`, if any.
    pub fn get(&self, collection: &str, id: &str) -> Option<IndexEntry> {
        self.collections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .and_then(|c| c.get(id).cloned())
    }
}

impl VectorIndex for InMemoryIndex {
    fn upsert(
        &self,
        collection: &str,
        ids: &[String],
        vectors: &[Vec<f32>],
        metadata: &[serde_json::Value],
    ) -> Result<(), LabelError> {
        if ids.len() != vectors.len() {
            return Err(LabelError::validation(format!(
                "upsert got {} ids but {} vectors",
                ids.len(),
                vectors.len()
            )));
        }
        if !metadata.is_empty() && metadata.len() != ids.len() {
            return Err(LabelError::validation(format!(
                "upsert got {} ids but {} metadata entries",
                ids.len(),
                metadata.len()
            )));
        }

        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entries = collections.entry(collection.to_string()).or_default();
        for (i, (id, vector)) in ids.iter().zip(vectors).enumerate() {
            entries.insert(
                id.clone(),
                IndexEntry {
                    vector: vector.clone(),
                    metadata: metadata.get(i).cloned().unwrap_or(serde_json::Value::Null),
                },
            );
        }
        Ok(())
    }

    fn reset(&self, collection: &str) {
        self.collections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(collection);
    }

    fn query(&self, collection: &str, vector: &[f32], k: usize) -> Vec<IndexMatch> {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = collections.get(collection) else {
            return Vec::new();
        };

        let mut scored: Vec<IndexMatch> = entries
            .iter()
            .map(|(id, entry)| IndexMatch {
                id: id.clone(),
                score: cosine_similarity(vector, &entry.vector),
                metadata: entry.metadata.clone(),
            })
            .collect();

        // Stable sort over id-ordered entries keeps ties deterministic.
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        scored
    }

    fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .map_or(0, BTreeMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_upsert_overwrites_by_id() {
        let index = InMemoryIndex::new();
        index
            .upsert("s", &ids(&["a"]), &[vec![1.0, 0.0]], &[json!({"v": 1})])
            .unwrap();
        index
            .upsert("s", &ids(&["a"]), &[vec![0.0, 1.0]], &[json!({"v": 2})])
            .unwrap();
        assert_eq!(index.count("s"), 1);
        let entry = index.get("s", "a").unwrap();
        assert_eq!(entry.vector, vec![0.0, 1.0]);
        assert_eq!(entry.metadata["v"], 2);
    }

    #[test]
    fn test_query_ranks_and_truncates() {
        let index = InMemoryIndex::new();
        index
            .upsert(
                "s",
                &ids(&["far", "near", "mid"]),
                &[vec![0.0, 1.0], vec![1.0, 0.0], vec![1.0, 1.0]],
                &[],
            )
            .unwrap();
        let hits = index.query("s", &[1.0, 0.0], 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "near");
        assert_eq!(hits[1].id, "mid");
        assert!(hits[0].score >= hits[1].score);
    }

    #[test]
    fn test_missing_collection_is_empty() {
        let index = InMemoryIndex::new();
        assert!(index.query("nope", &[1.0], 5).is_empty());
        assert_eq!(index.count("nope"), 0);
    }

    #[test]
    fn test_reset_drops_stale_entries() {
        let index = InMemoryIndex::new();
        index.upsert("s", &ids(&["old"]), &[vec![1.0]], &[]).unwrap();
        index.upsert("other", &ids(&["keep"]), &[vec![1.0]], &[]).unwrap();
        index.reset("s");
        assert!(index.query("s", &[1.0], 5).is_empty());
        assert_eq!(index.count("other"), 1);
    }

    #[test]
    fn test_length_mismatch_is_validation_error() {
        let index = InMemoryIndex::new();
        let err = index.upsert("s", &ids(&["a", "b"]), &[vec![1.0]], &[]).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        let index = InMemoryIndex::new();
        index
            .upsert("s", &ids(&["a"]), &[vec![0.6, 0.8]], &[json!({"label": "환불"})])
            .unwrap();
        index.save(&path).unwrap();

        let loaded = InMemoryIndex::load(&path).unwrap();
        assert_eq!(loaded.get("s", "a"), index.get("s", "a"));
    }
}
