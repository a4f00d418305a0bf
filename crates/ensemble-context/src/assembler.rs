//! Query to bounded-token context string

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use ensemble_core::types::estimate_tokens;
use ensemble_core::{ChatMessage, GenerationConfig, Result, VectorHit, VectorIndex};
use ensemble_llm::{GenerateRequest, LlmGateway};

use crate::cache::{ContextCache, fingerprint};
use crate::summarizer::ContextSummarizer;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblerSettings {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_true")]
    pub query_expansion: bool,
    #[serde(default = "default_true")]
    pub multi_query: bool,
    #[serde(default = "default_true")]
    pub summarization_enabled: bool,
    #[serde(default = "default_summarization_threshold")]
    pub summarization_threshold: usize,
}

fn default_max_tokens() -> usize {
    4000
}

fn default_true() -> bool {
    true
}

fn default_summarization_threshold() -> usize {
    8000
}

impl Default for AssemblerSettings {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            query_expansion: true,
            multi_query: true,
            summarization_enabled: true,
            summarization_threshold: default_summarization_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

pub struct ContextAssembler {
    settings: RwLock<AssemblerSettings>,
    index: Option<Arc<dyn VectorIndex>>,
    gateway: Option<Arc<LlmGateway>>,
    cache: Arc<ContextCache>,
    summarizer: ContextSummarizer,
    history: Mutex<Vec<HistoryEntry>>,
}

impl ContextAssembler {
    pub fn new(
        settings: AssemblerSettings,
        index: Option<Arc<dyn VectorIndex>>,
        gateway: Option<Arc<LlmGateway>>,
        cache: Arc<ContextCache>,
        summarizer: ContextSummarizer,
    ) -> Self {
        Self {
            settings: RwLock::new(settings),
            index,
            gateway,
            cache,
            summarizer,
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn update_settings(&self, settings: AssemblerSettings) {
        *self.settings.write() = settings;
    }

    /// Assemble a context string for `query`, at most `max_tokens`
    /// estimated tokens. Results are cached by the fingerprint of the
    /// whole request tuple.
    pub async fn get_context(
        &self,
        query: &str,
        max_tokens: Option<usize>,
        use_expansion: Option<bool>,
        use_multi_query: Option<bool>,
    ) -> Result<String> {
        let settings = self.settings.read().clone();
        let max_tokens = max_tokens.unwrap_or(settings.max_tokens);
        let expansion = use_expansion.unwrap_or(settings.query_expansion);
        let multi_query = use_multi_query.unwrap_or(settings.multi_query);

        let key = fingerprint(&[
            query,
            &max_tokens.to_string(),
            &expansion.to_string(),
            &multi_query.to_string(),
        ]);

        if let Some(Value::String(cached)) = self.cache.get(&key).await {
            debug!(query = %truncate(query, 50), "context cache hit");
            return Ok(cached);
        }
        debug!(query = %truncate(query, 50), "context cache miss");

        let phrasings = if expansion && self.gateway.is_some() {
            self.expand_query(query).await
        } else {
            vec![query.to_string()]
        };

        let hits = self.retrieve(&phrasings, multi_query).await?;

        let full_text = hits
            .iter()
            .map(|h| h.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let estimated = estimate_tokens(&full_text);

        // Over the threshold, the whole retrieval set is summarized down to
        // the budget so declarations in later snippets survive. Otherwise
        // snippets are concatenated in rank order up to the budget.
        let context = if settings.summarization_enabled
            && estimated > settings.summarization_threshold
        {
            info!(
                estimated,
                target = max_tokens,
                "context over threshold, summarizing"
            );
            match self.summarizer.summarize(&full_text, query, max_tokens).await {
                Ok(summary) => summary,
                Err(err) => {
                    warn!(error = %err, "summarization failed, truncating instead");
                    budget_cut(&hits, max_tokens)
                }
            }
        } else {
            budget_cut(&hits, max_tokens)
        };

        self.cache
            .set(&key, Value::String(context.clone()), None)
            .await;
        Ok(context)
    }

    async fn retrieve(&self, phrasings: &[String], multi_query: bool) -> Result<Vec<VectorHit>> {
        let Some(index) = self.index.as_ref() else {
            return Ok(Vec::new());
        };

        if multi_query && phrasings.len() > 1 {
            // Small top-k per phrasing, unioned by document index with the
            // first-seen order preserved.
            let mut seen = std::collections::HashSet::new();
            let mut unique = Vec::new();
            for phrasing in phrasings {
                for hit in index.search(phrasing, 5).await? {
                    if seen.insert(hit.index) {
                        unique.push(hit);
                    }
                }
            }
            unique.truncate(10);
            Ok(unique)
        } else {
            index.search_reranked(&phrasings[0], 10).await
        }
    }

    /// Ask the LLM for 2-3 alternative phrasings; the original query always
    /// comes first. Failures fall back to the original alone.
    async fn expand_query(&self, query: &str) -> Vec<String> {
        let Some(gateway) = self.gateway.as_ref() else {
            return vec![query.to_string()];
        };

        let prompt = format!(
            "Given the following query, generate 2-3 alternative phrasings or related \
             queries that would help find relevant information.\n\n\
             Original query: {query}\n\n\
             Generate alternative queries (one per line, no numbering):"
        );
        let request = GenerateRequest::new(vec![ChatMessage::user(prompt)]).with_config(
            GenerationConfig::default()
                .with_temperature(0.7)
                .with_max_tokens(200),
        );

        match gateway.generate(request).await {
            Ok(response) => {
                let mut phrasings = vec![query.to_string()];
                phrasings.extend(
                    response
                        .content
                        .lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty())
                        .take(3)
                        .map(str::to_string),
                );
                phrasings
            }
            Err(err) => {
                warn!(error = %err, "query expansion failed");
                vec![query.to_string()]
            }
        }
    }

    // ---- conversational slot ----

    pub fn add_to_history(
        &self,
        role: impl Into<String>,
        content: impl Into<String>,
        metadata: Option<Map<String, Value>>,
    ) {
        self.history.lock().push(HistoryEntry {
            role: role.into(),
            content: content.into(),
            metadata: metadata.unwrap_or_default(),
        });
    }

    pub fn get_history(&self, max_entries: Option<usize>) -> Vec<HistoryEntry> {
        let history = self.history.lock();
        match max_entries {
            Some(n) => history[history.len().saturating_sub(n)..].to_vec(),
            None => history.clone(),
        }
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Concatenate snippets in rank order, stopping before the snippet that
/// would cross the budget.
fn budget_cut(hits: &[VectorHit], max_tokens: usize) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let mut used_tokens = 0usize;
    for hit in hits {
        let cost = estimate_tokens(&hit.text);
        if used_tokens + cost > max_tokens {
            break;
        }
        parts.push(&hit.text);
        used_tokens += cost;
    }
    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheSettings;
    use crate::summarizer::SummarizationStrategy;
    use crate::vector::InMemoryVectorIndex;
    use ensemble_core::HashingEmbedder;
    use ensemble_llm::MockProvider;

    struct Fixture {
        assembler: ContextAssembler,
        _dir: tempfile::TempDir,
    }

    async fn fixture(
        docs: Vec<String>,
        gateway: Option<Arc<LlmGateway>>,
        settings: AssemblerSettings,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let index = InMemoryVectorIndex::new(Arc::new(HashingEmbedder::default()));
        index.add(docs).await.unwrap();
        let cache = Arc::new(ContextCache::new(CacheSettings {
            disk_dir: dir.path().to_path_buf(),
            ..CacheSettings::default()
        }));
        let summarizer =
            ContextSummarizer::new(gateway.clone(), SummarizationStrategy::Hybrid);
        Fixture {
            assembler: ContextAssembler::new(
                settings,
                Some(Arc::new(index)),
                gateway,
                cache,
                summarizer,
            ),
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn context_respects_token_budget() {
        let docs: Vec<String> = (0..20)
            .map(|i| format!("document {i} with enough words to cost some tokens in the budget"))
            .collect();
        let f = fixture(docs, None, AssemblerSettings::default()).await;

        let context = f
            .assembler
            .get_context("document words", Some(30), Some(false), Some(false))
            .await
            .unwrap();
        assert!(estimate_tokens(&context) <= 30);
        assert!(!context.is_empty());
    }

    #[tokio::test]
    async fn repeated_requests_hit_the_cache() {
        let f = fixture(
            vec!["retrieval target document".to_string()],
            None,
            AssemblerSettings::default(),
        )
        .await;

        let first = f
            .assembler
            .get_context("retrieval target", None, Some(false), Some(false))
            .await
            .unwrap();
        let second = f
            .assembler
            .get_context("retrieval target", None, Some(false), Some(false))
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn expansion_unions_results_across_phrasings() {
        let gateway = Arc::new(LlmGateway::new());
        gateway.register(
            "mock",
            Arc::new(MockProvider::new().with_response("sorting numbers\nordering integers")),
        );
        let f = fixture(
            vec![
                "sorting numbers efficiently".to_string(),
                "ordering integers with quicksort".to_string(),
                "unrelated networking guide".to_string(),
            ],
            Some(gateway),
            AssemblerSettings::default(),
        )
        .await;

        let context = f
            .assembler
            .get_context("sorting numbers", None, Some(true), Some(true))
            .await
            .unwrap();
        assert!(context.contains("sorting numbers efficiently"));
        assert!(context.contains("ordering integers"));
    }

    #[tokio::test]
    async fn oversized_retrieval_is_summarized_under_budget() {
        let docs: Vec<String> = (0..120)
            .map(|i| {
                format!(
                    "def endpoint_{i}(request):\n{}",
                    "    processing detail line with many words of explanation\n".repeat(20)
                )
            })
            .collect();
        let settings = AssemblerSettings {
            max_tokens: 4000,
            summarization_threshold: 2000,
            query_expansion: false,
            multi_query: false,
            ..AssemblerSettings::default()
        };
        let f = fixture(docs, None, settings).await;

        let context = f
            .assembler
            .get_context("endpoint request processing", Some(4000), None, None)
            .await
            .unwrap();
        assert!(estimate_tokens(&context) <= 4000);
        assert!(context.contains("def endpoint_"));
    }

    #[tokio::test]
    async fn history_slot_is_bounded_by_caller() {
        let f = fixture(vec![], None, AssemblerSettings::default()).await;
        for i in 0..5 {
            f.assembler.add_to_history("user", format!("message {i}"), None);
        }
        assert_eq!(f.assembler.get_history(Some(2)).len(), 2);
        assert_eq!(f.assembler.get_history(None).len(), 5);
        f.assembler.clear_history();
        assert!(f.assembler.get_history(None).is_empty());
    }
}
