//! Deterministic character-trigram embedder.
//!
//! Each lowercase character trigram is hashed into a bucket and the bucket counts are normalised.
//! The vectors carry no semantics beyond surface overlap, but they are stable across runs and
//! machines, need no model download, and make retrieval testable offline.

use crate::capability::Capability;
use crate::error::Result;
use crate::provider::{EmbeddingResult, ModelClient, ProbeReport, normalize_to_f16};
use async_trait::async_trait;
use fnv::FnvHasher;
use std::hash::Hasher;

pub const DEFAULT_HASHING_DIMENSION: usize = 256;

#[derive(Debug, Clone)]
pub struct HashingEmbedClient {
    model_id: String,
    dimension: usize,
}

impl HashingEmbedClient {
    pub fn new(model_id: impl Into<String>, dimension: usize) -> Self {
        Self {
            model_id: model_id.into(),
            dimension: dimension.max(1),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimension];
        let chars: Vec<char> = text.to_lowercase().chars().collect();

        // Texts shorter than a trigram still get a vector
        let windows: Vec<&[char]> = if chars.len() < 3 {
            vec![&chars[..]]
        } else {
            chars.windows(3).collect()
        };

        for window in windows {
            if window.is_empty() || window.iter().all(|c| c.is_whitespace()) {
                continue;
            }
            let mut hasher = FnvHasher::default();
            for ch in window {
                hasher.write_u32(*ch as u32);
            }
            let bucket = (hasher.finish() % self.dimension as u64) as usize;
            vector[bucket] += 1.0;
        }
        vector
    }
}

const CAPABILITIES: &[Capability] = &[Capability::Embedding];

#[async_trait]
impl ModelClient for HashingEmbedClient {
    fn provider_name(&self) -> &str {
        "hashing"
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        tracing::debug!("Hashing {} text(s) into {} buckets", texts.len(), self.dimension);
        let raw = texts.iter().map(|t| self.embed_one(t)).collect();
        let mut result = EmbeddingResult::new(normalize_to_f16(raw));
        result.dimension = self.dimension;
        Ok(result)
    }

    async fn probe(&self) -> Result<ProbeReport> {
        Ok(ProbeReport {
            provider: "hashing".to_string(),
            model_id: self.model_id.clone(),
            latency_ms: 0,
            detail: format!("in-process, dimension {}", self.dimension),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn cosine(a: &[half::f16], b: &[half::f16]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x.to_f32() * y.to_f32()).sum()
    }

    #[traced_test]
    #[tokio::test]
    async fn test_embedder_is_deterministic() {
        let client = HashingEmbedClient::new("trigram", 64);
        let first = client.embed_text("Hydraulic pressure and flow").await.unwrap();
        let second = client.embed_text("Hydraulic pressure and flow").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(logs_contain("Hashing 1 text(s) into 64 buckets"));
    }

    #[tokio::test]
    async fn test_similar_texts_score_higher() {
        let client = HashingEmbedClient::new("trigram", 256);
        let texts = vec![
            "vector index reconciliation".to_string(),
            "reconciling the vector index".to_string(),
            "banana bread recipe".to_string(),
        ];
        let result = client.embed_texts(&texts).await.unwrap();
        let close = cosine(&result.embeddings[0], &result.embeddings[1]);
        let far = cosine(&result.embeddings[0], &result.embeddings[2]);
        assert!(close > far);
    }

    #[tokio::test]
    async fn test_empty_batch_keeps_dimension() {
        let client = HashingEmbedClient::new("trigram", 32);
        let result = client.embed_texts(&[]).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(result.dimension, 32);
    }
}
