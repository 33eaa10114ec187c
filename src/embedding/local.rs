//! Offline embedders. Neither needs network access or credentials.

use async_trait::async_trait;
use std::collections::HashMap;

use super::{bucket, normalize, terms, Embedder};
use crate::error::LabelError;

pub(crate) const DEFAULT_HASH_DIMS: usize = 384;
pub(crate) const DEFAULT_TFIDF_DIMS: usize = 1024;

/// Term-count vectors folded into a fixed number of buckets and
/// L2-normalized. Vectors from separate calls are comparable.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for term in terms(text) {
            v[bucket(&term, self.dims)] += 1.0;
        }
        normalize(&mut v);
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LabelError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// TF-IDF over unigrams and bigrams, fitted on the texts of each call.
///
/// Inverse document frequency uses the smoothed form
/// `ln((1 + n) / (1 + df)) + 1`, so a term present in every document still
/// carries weight. Callers must embed a query together with the texts it is
/// ranked against.
pub struct TfidfEmbedder {
    dims: usize,
}

impl TfidfEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }
}

#[async_trait]
impl Embedder for TfidfEmbedder {
    fn model_name(&self) -> &str {
        "tfidf"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn is_corpus_relative(&self) -> bool {
        true
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LabelError> {
        let docs: Vec<HashMap<String, f32>> = texts
            .iter()
            .map(|t| {
                let mut counts = HashMap::new();
                for term in terms(t) {
                    *counts.entry(term).or_insert(0.0) += 1.0;
                }
                counts
            })
            .collect();

        let mut df: HashMap<&str, f32> = HashMap::new();
        for doc in &docs {
            for term in doc.keys() {
                *df.entry(term.as_str()).or_insert(0.0) += 1.0;
            }
        }

        let n = docs.len() as f32;
        let vectors = docs
            .iter()
            .map(|doc| {
                let mut v = vec![0.0f32; self.dims];
                for (term, tf) in doc {
                    let doc_freq = df.get(term.as_str()).copied().unwrap_or(0.0);
                    let idf = ((1.0 + n) / (1.0 + doc_freq)).ln() + 1.0;
                    v[bucket(term, self.dims)] += tf * idf;
                }
                normalize(&mut v);
                v
            })
            .collect();

        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_hash_is_deterministic_and_normalized() {
        let e = HashEmbedder::new(384);
        let a = e.embed(&strings(&["환불 요청드립니다"])).await.unwrap();
        let b = e.embed(&strings(&["환불 요청드립니다"])).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 384);
        let norm: f32 = a[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_hash_empty_text_is_zero_vector() {
        let e = HashEmbedder::new(16);
        let out = e.embed(&strings(&[""])).await.unwrap();
        assert_eq!(out[0], vec![0.0; 16]);
    }

    #[tokio::test]
    async fn test_embed_preserves_length() {
        let e = TfidfEmbedder::new(64);
        assert!(e.embed(&[]).await.unwrap().is_empty());
        let out = e.embed(&strings(&["a", "b c", ""])).await.unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|v| v.len() == 64));
    }

    #[tokio::test]
    async fn test_tfidf_ranks_shared_rare_terms_highest() {
        let e = TfidfEmbedder::new(1024);
        let out = e
            .embed(&strings(&[
                "환불 요청 카드 취소",
                "배송 지연 문의",
                "로그인 오류 계정 잠김",
                "환불 하고 싶어요 카드 결제 취소",
            ]))
            .await
            .unwrap();
        let query = &out[3];
        let refund = cosine_similarity(query, &out[0]);
        let shipping = cosine_similarity(query, &out[1]);
        let login = cosine_similarity(query, &out[2]);
        assert!(refund > shipping);
        assert!(refund > login);
    }
}
