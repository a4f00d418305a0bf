//! In-process vector index
//!
//! The production deployment backs `VectorIndex` with an external
//! FAISS-style store; this implementation serves tests and small
//! installations from a cosine scan over in-memory embeddings.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use ensemble_core::{Embedder, Result, VectorHit, VectorIndex, cosine_similarity};

pub struct InMemoryVectorIndex {
    embedder: Arc<dyn Embedder>,
    documents: RwLock<Vec<(String, Vec<f32>)>>,
}

impl InMemoryVectorIndex {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            documents: RwLock::new(Vec::new()),
        }
    }

    pub fn embedder(&self) -> Arc<dyn Embedder> {
        Arc::clone(&self.embedder)
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn add(&self, documents: Vec<String>) -> Result<()> {
        let mut store = self.documents.write();
        for doc in documents {
            let embedding = self.embedder.encode(&doc);
            store.push((doc, embedding));
        }
        Ok(())
    }

    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<VectorHit>> {
        let query_embedding = self.embedder.encode(query);
        let store = self.documents.read();

        let mut hits: Vec<VectorHit> = store
            .iter()
            .enumerate()
            .map(|(index, (text, embedding))| VectorHit {
                index,
                text: text.clone(),
                score: cosine_similarity(&query_embedding, embedding),
                metadata: Default::default(),
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);
        Ok(hits)
    }

    /// Rerank by boosting hits that share literal query tokens, which the
    /// bag-of-features embedding can underweight for rare identifiers.
    async fn search_reranked(&self, query: &str, top_k: usize) -> Result<Vec<VectorHit>> {
        let mut hits = self.search(query, top_k * 2).await?;
        let query_tokens: HashSet<String> = tokenize(query);

        for hit in &mut hits {
            let doc_tokens = tokenize(&hit.text);
            let shared = query_tokens.intersection(&doc_tokens).count();
            if !query_tokens.is_empty() {
                hit.score += 0.1 * (shared as f32 / query_tokens.len() as f32);
            }
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn len(&self) -> usize {
        self.documents.read().len()
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}
