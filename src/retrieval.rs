//! Nearest-sample lookup for a conversation.
//!
//! Two scoring paths:
//!
//! - **Joint**: the query is embedded in the same call as every sample
//!   summary. Required for corpus-relative embedders (TF-IDF), whose
//!   vocabulary and weights only line up within one call. Also used when
//!   the vector index holds nothing for the collection yet.
//! - **Indexed**: the query alone is embedded and ranked against the
//!   vectors stored at ingestion time.
//!
//! Either way the result is filtered by `min_similarity`, sorted by
//! descending score, and cut to `top_k`. Retrieval never fails: an empty
//! library, an empty conversation or an embedding error yields `[]`, and
//! labeling proceeds zero-shot.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::embedding::{cosine_similarity, embed_query, Embedder};
use crate::error::LabelError;
use crate::index::VectorIndex;
use crate::models::{Conversation, SampleLibrary, SampleMatch, SampleRecord};
use crate::prompt::truncate_chars;

const SNIPPET_CHARS: usize = 200;

pub struct SimilarityRetriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    collection: String,
}

impl SimilarityRetriever {
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

    /// Rank samples against the conversation's messages in chronological order.
    pub async fn retrieve(
        &self,
        conversation: &Conversation,
        library: &SampleLibrary,
        top_k: usize,
        min_similarity: f32,
    ) -> Vec<SampleMatch> {
        if conversation.messages.is_empty() {
            return Vec::new();
        }
        self.retrieve_text(&conversation.message_text(), library, top_k, min_similarity)
            .await
    }

    /// Rank samples against an already-assembled query text.
    pub async fn retrieve_text(
        &self,
        query: &str,
        library: &SampleLibrary,
        top_k: usize,
        min_similarity: f32,
    ) -> Vec<SampleMatch> {
        if library.is_empty() || query.trim().is_empty() || top_k == 0 {
            return Vec::new();
        }

        let scored = if self.embedder.is_corpus_relative()
            || self.index.count(&self.collection) == 0
        {
            self.score_jointly(query, library).await
        } else {
            self.score_indexed(query, library).await
        };

        let scored = match scored {
            Ok(scored) => scored,
            Err(e) => {
                warn!(error = %e, "retrieval degraded to zero matches");
                return Vec::new();
            }
        };

        let matches = rank(scored, top_k, min_similarity);
        debug!(
            matches = matches.len(),
            top = matches.first().map(|m| m.score),
            "retrieved samples"
        );
        matches
    }

    async fn score_jointly<'a>(
        &self,
        query: &str,
        library: &'a SampleLibrary,
    ) -> Result<Vec<(&'a SampleRecord, f32)>, LabelError> {
        let records: Vec<&SampleRecord> = library.iter().collect();
        let mut texts: Vec<String> = records
            .iter()
            .map(|r| r.summary_for_embedding.clone())
            .collect();
        texts.push(query.to_string());

        let mut vectors = self.embedder.embed(&texts).await?;
        let query_vec = vectors
            .pop()
            .ok_or_else(|| LabelError::transient("Empty embedding response"))?;

        Ok(records
            .into_iter()
            .zip(vectors.iter())
            .map(|(record, v)| (record, cosine_similarity(&query_vec, v)))
            .collect())
    }

    async fn score_indexed<'a>(
        &self,
        query: &str,
        library: &'a SampleLibrary,
    ) -> Result<Vec<(&'a SampleRecord, f32)>, LabelError> {
        let query_vec = embed_query(self.embedder.as_ref(), query).await?;
        let hits = self
            .index
            .query(&self.collection, &query_vec, self.index.count(&self.collection));

        // Index entries without a library record are stale and ignored.
        Ok(hits
            .into_iter()
            .filter_map(|hit| library.get(&hit.id).map(|record| (record, hit.score)))
            .collect())
    }
}

/// Filter by `min_similarity`, sort descending, keep `top_k`.
fn rank(scored: Vec<(&SampleRecord, f32)>, top_k: usize, min_similarity: f32) -> Vec<SampleMatch> {
    let mut kept: Vec<(&SampleRecord, f32)> = scored
        .into_iter()
        .filter(|(_, score)| *score >= min_similarity)
        .collect();
    kept.sort_by(|a, b| b.1.total_cmp(&a.1));
    kept.truncate(top_k);

    kept.into_iter()
        .map(|(record, score)| SampleMatch {
            sample_id: record.id.clone(),
            label_primary: record.label_primary.clone(),
            label_secondary: record.label_secondary.clone(),
            score,
            summary: record.summary_for_embedding.clone(),
            snippet: record
                .raw_text
                .as_deref()
                .map(|t| truncate_chars(t, SNIPPET_CHARS)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{HashEmbedder, TfidfEmbedder};
    use crate::index::InMemoryIndex;
    use crate::models::{Message, SenderType};
    use async_trait::async_trait;
    use chrono::Utc;

    fn library() -> SampleLibrary {
        SampleLibrary::from_records(
            vec![
                SampleRecord::new("s1", "환불", "환불 요청 카드 결제 취소"),
                SampleRecord::new("s2", "배송", "배송 지연 언제 도착"),
                SampleRecord::new("s3", "계정", "로그인 오류 비밀번호 재설정"),
                SampleRecord::new("s4", "쿠폰", "쿠폰 적용 안됨 할인"),
            ],
            "test",
        )
    }

    fn conversation(texts: &[&str]) -> Conversation {
        let messages = texts
            .iter()
            .enumerate()
            .map(|(i, t)| Message {
                id: format!("m{i}"),
                conversation_id: "c1".into(),
                sender_type: SenderType::User,
                created_at: Utc::now(),
                text: t.to_string(),
                attachments: Vec::new(),
            })
            .collect();
        Conversation::new("c1", Utc::now(), messages)
    }

    fn tfidf_retriever() -> SimilarityRetriever {
        SimilarityRetriever::new(
            Arc::new(TfidfEmbedder::new(1024)),
            Arc::new(InMemoryIndex::new()),
            "samples",
        )
    }

    #[tokio::test]
    async fn test_empty_conversation_returns_nothing() {
        let r = tfidf_retriever();
        assert!(r.retrieve(&conversation(&[]), &library(), 3, 0.0).await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_library_returns_nothing() {
        let r = tfidf_retriever();
        let empty = SampleLibrary::new("none");
        assert!(r.retrieve(&conversation(&["환불"]), &empty, 3, 0.0).await.is_empty());
    }

    #[tokio::test]
    async fn test_results_bounded_filtered_and_sorted() {
        let r = tfidf_retriever();
        let lib = library();
        for (top_k, min_sim) in [(1, 0.0), (3, 0.0), (10, 0.0), (10, 0.1), (2, -1.0)] {
            let out = r
                .retrieve(&conversation(&["환불 요청", "카드 결제 취소"]), &lib, top_k, min_sim)
                .await;
            assert!(out.len() <= top_k.min(lib.len()));
            assert!(out.iter().all(|m| m.score >= min_sim));
            assert!(out.windows(2).all(|w| w[0].score >= w[1].score));
        }
    }

    #[tokio::test]
    async fn test_best_match_is_the_refund_sample() {
        let r = tfidf_retriever();
        let out = r
            .retrieve(&conversation(&["환불 요청합니다"]), &library(), 3, 0.0)
            .await;
        assert_eq!(out[0].sample_id, "s1");
        assert!(out[0].score > 0.0);
    }

    #[tokio::test]
    async fn test_indexed_path_ignores_stale_ids() {
        let embedder = Arc::new(HashEmbedder::new(256));
        let index = Arc::new(InMemoryIndex::new());
        let lib = library();
        let texts: Vec<String> = lib.iter().map(|r| r.summary_for_embedding.clone()).collect();
        let mut ids: Vec<String> = lib.ids().map(String::from).collect();
        let mut vectors = embedder.embed(&texts).await.unwrap();
        ids.push("gone".into());
        vectors.push(embedder.embed(&["환불 요청".to_string()]).await.unwrap().remove(0));
        index.upsert("samples", &ids, &vectors, &[]).unwrap();

        let r = SimilarityRetriever::new(embedder, index, "samples");
        let out = r.retrieve_text("환불 요청", &lib, 3, 0.0).await;
        assert!(!out.is_empty());
        assert!(out.iter().all(|m| m.sample_id != "gone"));
        assert_eq!(out[0].sample_id, "s1");
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        fn model_name(&self) -> &str {
            "failing"
        }
        fn dims(&self) -> usize {
            4
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, LabelError> {
            Err(LabelError::EmbeddingExhausted {
                attempts: 5,
                last_cause: "HTTP 503".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_embedding_failure_degrades_to_zero_shot() {
        let r = SimilarityRetriever::new(
            Arc::new(FailingEmbedder),
            Arc::new(InMemoryIndex::new()),
            "samples",
        );
        assert!(r.retrieve_text("환불", &library(), 3, 0.0).await.is_empty());
    }
}
