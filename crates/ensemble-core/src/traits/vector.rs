//! Embedding and nearest-neighbor interfaces
//!
//! The production vector store and sentence-embedding model live outside
//! the core; these traits are the typed seam the MemoryStore and the
//! context subsystem consume. `HashingEmbedder` is the dependency-free
//! fallback used in tests and when no model is configured.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Text to fixed-dimension vector. Implementations are loaded once per
/// process, single-threaded, and shared via `Arc` so the memory store and
/// the vector index never load a model twice.
pub trait Embedder: Send + Sync {
    fn encode(&self, text: &str) -> Vec<f32>;
    fn dimension(&self) -> usize;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorHit {
    /// Stable document index within the backing store.
    pub index: usize,
    pub text: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn add(&self, documents: Vec<String>) -> Result<()>;

    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<VectorHit>>;

    /// Search with the backend's reranking pass when it has one.
    async fn search_reranked(&self, query: &str, top_k: usize) -> Result<Vec<VectorHit>> {
        self.search(query, top_k).await
    }

    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Deterministic feature-hashing embedder. Tokenizes on non-alphanumerics,
/// hashes each token into a fixed number of buckets, L2-normalizes.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
        }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Embedder for HashingEmbedder {
    fn encode(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let bucket = fnv1a(token) as usize % self.dimension;
            vector[bucket] += 1.0;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

fn fnv1a(token: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in token.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.5, 0.5, 0.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_handles_degenerate_input() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn hashing_embedder_is_deterministic() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.encode("sort a list in python");
        let b = embedder.encode("sort a list in python");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn similar_texts_score_higher_than_unrelated() {
        let embedder = HashingEmbedder::default();
        let query = embedder.encode("sort a list of numbers");
        let close = embedder.encode("sort numbers in a list quickly");
        let far = embedder.encode("deploy a kubernetes cluster");
        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }

    #[test]
    fn vectors_are_normalized() {
        let embedder = HashingEmbedder::new(32);
        let v = embedder.encode("alpha beta gamma");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
