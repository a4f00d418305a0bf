//! Context summarization down to a token budget
//!
//! Declarations, API endpoints, and upper-case constants survive every
//! strategy: droppable prose goes first, structure goes last.

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use ensemble_core::types::estimate_tokens;
use ensemble_core::{ChatMessage, GenerationConfig, Result};
use ensemble_llm::{GenerateRequest, LlmGateway};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummarizationStrategy {
    Hierarchical,
    Extractive,
    Abstractive,
    StructurePreserving,
    Hybrid,
}

impl Default for SummarizationStrategy {
    fn default() -> Self {
        SummarizationStrategy::Hybrid
    }
}

pub struct ContextSummarizer {
    gateway: Option<Arc<LlmGateway>>,
    strategy: SummarizationStrategy,
    structure_patterns: Vec<Regex>,
}

impl ContextSummarizer {
    pub fn new(gateway: Option<Arc<LlmGateway>>, strategy: SummarizationStrategy) -> Self {
        let structure_patterns = [
            // top-level declarations
            r"^\s*(async\s+)?def\s+\w+",
            r"^\s*class\s+\w+",
            r"^\s*(pub\s+)?(async\s+)?fn\s+\w+",
            r"^\s*(export\s+)?(async\s+)?function\s+\w+",
            // API endpoints
            r"\b(GET|POST|PUT|DELETE|PATCH)\s+/\S*",
            // important constants
            r"^\s*[A-Z][A-Z0-9_]{2,}\s*=",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect();

        Self {
            gateway,
            strategy,
            structure_patterns,
        }
    }

    pub fn strategy(&self) -> SummarizationStrategy {
        self.strategy
    }

    /// Reduce `context` to at most `max_tokens` estimated tokens while
    /// keeping it useful for `query`.
    pub async fn summarize(&self, context: &str, query: &str, max_tokens: usize) -> Result<String> {
        if estimate_tokens(context) <= max_tokens {
            return Ok(context.to_string());
        }

        let summarized = match self.strategy {
            SummarizationStrategy::Extractive | SummarizationStrategy::StructurePreserving => {
                self.extractive(context, query, max_tokens)
            }
            SummarizationStrategy::Abstractive => {
                self.abstractive(context, query, max_tokens).await
            }
            SummarizationStrategy::Hierarchical => {
                self.hierarchical(context, query, max_tokens).await
            }
            SummarizationStrategy::Hybrid => {
                let extracted = self.extractive(context, query, max_tokens);
                if estimate_tokens(&extracted) <= max_tokens {
                    extracted
                } else {
                    self.abstractive(&extracted, query, max_tokens).await
                }
            }
        };

        // The budget is strict no matter what the strategy produced.
        Ok(self.enforce_budget(&summarized, max_tokens))
    }

    fn is_structural(&self, line: &str) -> bool {
        self.structure_patterns.iter().any(|p| p.is_match(line))
    }

    /// Keep structural lines first, then the most query-relevant prose, in
    /// original order.
    fn extractive(&self, context: &str, query: &str, max_tokens: usize) -> String {
        let lines: Vec<&str> = context.lines().collect();
        let query_tokens: Vec<String> = query
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 2)
            .map(str::to_string)
            .collect();

        let mut keep = vec![false; lines.len()];
        let mut budget = max_tokens;

        for (i, line) in lines.iter().enumerate() {
            if self.is_structural(line) {
                let cost = estimate_tokens(line) + 1;
                if cost <= budget {
                    keep[i] = true;
                    budget -= cost;
                }
            }
        }

        // Remaining lines by relevance, greedily.
        let mut scored: Vec<(usize, usize)> = lines
            .iter()
            .enumerate()
            .filter(|(i, _)| !keep[*i])
            .map(|(i, line)| {
                let lower = line.to_lowercase();
                let score = query_tokens.iter().filter(|t| lower.contains(*t)).count();
                (i, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1));

        for (i, score) in scored {
            if score == 0 && budget < max_tokens / 2 {
                break;
            }
            let cost = estimate_tokens(lines[i]) + 1;
            if cost <= budget {
                keep[i] = true;
                budget -= cost;
            }
        }

        lines
            .iter()
            .enumerate()
            .filter(|(i, _)| keep[*i])
            .map(|(_, line)| *line)
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn abstractive(&self, context: &str, query: &str, max_tokens: usize) -> String {
        let Some(gateway) = self.gateway.as_ref() else {
            debug!("no gateway for abstractive summarization, extracting instead");
            return self.extractive(context, query, max_tokens);
        };

        let prompt = format!(
            "Summarize the following context so it stays useful for answering: {query}\n\n\
             Preserve ALL function and class declarations, API endpoints, and important \
             constants verbatim. Target at most {max_tokens} tokens.\n\nCONTEXT:\n{context}\n\nSUMMARY:",
        );
        let request = GenerateRequest::new(vec![ChatMessage::user(prompt)]).with_config(
            GenerationConfig::default()
                .with_temperature(0.2)
                .with_max_tokens((max_tokens as u32).saturating_mul(2)),
        );

        match gateway.generate(request).await {
            Ok(response) => response.content.trim().to_string(),
            Err(err) => {
                warn!(error = %err, "abstractive summarization failed, extracting instead");
                self.extractive(context, query, max_tokens)
            }
        }
    }

    async fn hierarchical(&self, context: &str, query: &str, max_tokens: usize) -> String {
        let chunks = chunk_by_tokens(context, max_tokens.max(1));
        if chunks.len() <= 1 {
            return self.abstractive(context, query, max_tokens).await;
        }

        let per_chunk_budget = (max_tokens / chunks.len()).max(64);
        let mut partials = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            partials.push(self.abstractive(chunk, query, per_chunk_budget).await);
        }
        let merged = partials.join("\n\n");
        if estimate_tokens(&merged) > max_tokens {
            self.abstractive(&merged, query, max_tokens).await
        } else {
            merged
        }
    }

    fn enforce_budget(&self, text: &str, max_tokens: usize) -> String {
        if estimate_tokens(text) <= max_tokens {
            return text.to_string();
        }
        // Cut whole lines from the bottom, sparing structural ones until
        // nothing else is left to drop.
        let lines: Vec<&str> = text.lines().collect();
        let mut keep: Vec<bool> = vec![true; lines.len()];
        let mut total: usize = lines.iter().map(|l| estimate_tokens(l) + 1).sum();

        for (i, line) in lines.iter().enumerate().rev() {
            if total <= max_tokens {
                break;
            }
            if !self.is_structural(line) {
                keep[i] = false;
                total -= estimate_tokens(line) + 1;
            }
        }
        for (i, line) in lines.iter().enumerate().rev() {
            if total <= max_tokens {
                break;
            }
            if keep[i] {
                keep[i] = false;
                total -= estimate_tokens(line) + 1;
            }
        }

        lines
            .iter()
            .enumerate()
            .filter(|(i, _)| keep[*i])
            .map(|(_, line)| *line)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn chunk_by_tokens(text: &str, chunk_tokens: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if estimate_tokens(&current) + estimate_tokens(line) > chunk_tokens && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_llm::MockProvider;

    fn big_context() -> String {
        let mut context = String::new();
        for i in 0..200 {
            context.push_str(&format!("def handler_{i}(request):\n"));
            context.push_str(&"    # filler prose that pads this function with detail words\n".repeat(10));
        }
        context
    }

    #[tokio::test]
    async fn within_budget_is_untouched() {
        let summarizer = ContextSummarizer::new(None, SummarizationStrategy::Hybrid);
        let text = "short context";
        assert_eq!(summarizer.summarize(text, "q", 1000).await.unwrap(), text);
    }

    #[tokio::test]
    async fn extractive_fits_budget_and_keeps_declarations() {
        let summarizer = ContextSummarizer::new(None, SummarizationStrategy::StructurePreserving);
        let context = big_context();
        assert!(estimate_tokens(&context) > 8000);

        let summary = summarizer.summarize(&context, "handler", 4000).await.unwrap();
        assert!(estimate_tokens(&summary) <= 4000);
        // all declarations that fit the budget are kept, in order
        assert!(summary.contains("def handler_0(request):"));
        assert!(summary.lines().filter(|l| l.starts_with("def ")).count() > 100);
    }

    #[tokio::test]
    async fn hybrid_without_gateway_degrades_to_extraction() {
        let summarizer = ContextSummarizer::new(None, SummarizationStrategy::Hybrid);
        let summary = summarizer.summarize(&big_context(), "handler", 2000).await.unwrap();
        assert!(estimate_tokens(&summary) <= 2000);
    }

    #[tokio::test]
    async fn abstractive_uses_gateway_but_budget_still_binds() {
        let gateway = Arc::new(LlmGateway::new());
        gateway.register(
            "mock",
            Arc::new(MockProvider::new().with_response("class Kept:\nshort summary")),
        );
        let summarizer =
            ContextSummarizer::new(Some(gateway), SummarizationStrategy::Abstractive);

        let summary = summarizer.summarize(&big_context(), "handlers", 500).await.unwrap();
        assert!(summary.contains("short summary"));
        assert!(estimate_tokens(&summary) <= 500);
    }

    #[test]
    fn structural_lines_are_recognized() {
        let summarizer = ContextSummarizer::new(None, SummarizationStrategy::Extractive);
        assert!(summarizer.is_structural("def main():"));
        assert!(summarizer.is_structural("class Config:"));
        assert!(summarizer.is_structural("pub fn run() {"));
        assert!(summarizer.is_structural("GET /api/tasks"));
        assert!(summarizer.is_structural("MAX_RETRIES = 3"));
        assert!(!summarizer.is_structural("plain prose here"));
    }
}
