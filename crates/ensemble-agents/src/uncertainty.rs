//! Uncertainty-driven search: detect hedging, fill the gap from the web
//!
//! A pipeline stage over an agent's text output. When the model hedges
//! ("I'm not sure", "might be", ...) or the task needs current
//! information, the stage runs a web search and asks the model to fold
//! the findings back into the answer. Search results are cached per
//! query for the stage's lifetime.

use std::collections::HashMap;

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use ensemble_core::{ChatMessage, TaskContext};

use crate::agent::{AgentCore, LlmCallOptions};

const WEB_SEARCH_TOOL: &str = "web_search";
/// Each detected hedge lowers confidence by this much.
const CONFIDENCE_PENALTY: f64 = 0.15;
const CONFIDENT: f64 = 0.95;
const CONFIDENCE_FLOOR: f64 = 0.1;

const UNCERTAINTY_PATTERNS: [&str; 12] = [
    r"i'?m not sure",
    r"i don'?t know",
    r"\bmight be\b",
    r"\bcould be\b",
    r"\bpossibly\b",
    r"\bprobably\b",
    r"\buncertain\b",
    r"\bnot certain\b",
    r"\bhard to say\b",
    r"\bneed to verify\b",
    r"knowledge.{0,20}cutoff",
    r"as of my.{0,20}training",
];

/// Task phrasings that date quickly.
const CURRENT_INFO_PATTERNS: [&str; 4] = [
    r"\b(latest|current|today|recent|newest)\b",
    r"\b(price|pricing|cost|rates?)\b",
    r"\b(version|release|changelog)\b",
    r"\b(news|updates?)\b",
];

/// Technical topics where staleness hurts most.
const TECHNICAL_PATTERNS: [&str; 6] = [
    r"\b(api|sdk|library|framework)\b",
    r"\bdocumentation\b",
    r"\binstall(ation)?\b",
    r"\bdependenc(y|ies)\b",
    r"\b(bug|issue)\b",
    r"\bvulnerabilit(y|ies)\b",
];

const STOP_WORDS: [&str; 17] = [
    "the", "a", "an", "is", "are", "was", "were", "how", "what", "where", "when", "why", "which",
    "to", "of", "for", "in",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncertaintySearchConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Confidence below this triggers a search.
    #[serde(default = "default_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_threshold() -> f64 {
    0.6
}

fn default_max_results() -> usize {
    5
}

impl Default for UncertaintySearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: default_threshold(),
            max_results: default_max_results(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancementOutcome {
    pub response: String,
    pub enhanced: bool,
    pub confidence: f64,
    pub search_performed: bool,
}

impl EnhancementOutcome {
    fn passthrough(response: &str) -> Self {
        Self {
            response: response.to_string(),
            enhanced: false,
            confidence: CONFIDENT,
            search_performed: false,
        }
    }
}

pub struct UncertaintySearch {
    config: UncertaintySearchConfig,
    uncertainty: Vec<Regex>,
    current_info: Vec<Regex>,
    technical: Vec<Regex>,
    cache: Mutex<HashMap<String, String>>,
}

impl UncertaintySearch {
    pub fn new(config: UncertaintySearchConfig) -> Self {
        let compile = |patterns: &[&str]| -> Vec<Regex> {
            patterns
                .iter()
                .map(|p| Regex::new(p).expect("static pattern"))
                .collect()
        };
        Self {
            config,
            uncertainty: compile(&UNCERTAINTY_PATTERNS),
            current_info: compile(&CURRENT_INFO_PATTERNS),
            technical: compile(&TECHNICAL_PATTERNS),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Confidence in a response and the hedging phrases that lowered it.
    pub fn detect_uncertainty(&self, response: &str) -> (bool, f64, Vec<String>) {
        let lower = response.to_lowercase();
        let detected: Vec<String> = self
            .uncertainty
            .iter()
            .filter(|p| p.is_match(&lower))
            .map(|p| p.as_str().to_string())
            .collect();

        let confidence = if detected.is_empty() {
            CONFIDENT
        } else {
            (1.0 - detected.len() as f64 * CONFIDENCE_PENALTY).max(CONFIDENCE_FLOOR)
        };
        let is_uncertain = confidence < self.config.confidence_threshold;

        if is_uncertain {
            info!(
                confidence = format!("{:.2}", confidence),
                hedges = detected.len(),
                "detected uncertainty in response"
            );
        }
        (is_uncertain, confidence, detected)
    }

    /// Whether the task phrasing asks for information that dates quickly.
    pub fn task_requires_current_info(&self, task: &str) -> bool {
        let lower = task.to_lowercase();
        self.current_info
            .iter()
            .chain(self.technical.iter())
            .any(|p| p.is_match(&lower))
    }

    /// Keyword query from the task: stop words dropped, first ten kept.
    fn search_query(&self, task: &str) -> String {
        task.to_lowercase()
            .split_whitespace()
            .filter(|w| w.len() > 2 && !STOP_WORDS.contains(w))
            .take(10)
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn search_for_missing_info(&self, core: &AgentCore, query: &str) -> Option<String> {
        let cache_key: String = query.trim().to_lowercase().chars().take(100).collect();
        if let Some(cached) = self.cache.lock().get(&cache_key) {
            debug!(query = %query, "using cached uncertainty search results");
            return Some(cached.clone());
        }

        let tools = core.tools()?;
        if !tools.has(WEB_SEARCH_TOOL) {
            return None;
        }

        info!(query = %query, "performing uncertainty-triggered web search");
        let output = tools
            .execute(
                WEB_SEARCH_TOOL,
                json!({"query": query, "max_results": self.config.max_results}),
            )
            .await;
        if !output.success {
            warn!(
                error = output.error.as_deref().unwrap_or(""),
                "uncertainty web search failed"
            );
            return None;
        }

        let results = output
            .output
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if results.is_empty() {
            return None;
        }

        let mut block = String::from("\n\nADDITIONAL CURRENT INFORMATION FROM THE WEB:\n");
        for (i, result) in results.iter().take(self.config.max_results).enumerate() {
            let title = result.get("title").and_then(Value::as_str).unwrap_or("");
            let url = result.get("url").and_then(Value::as_str).unwrap_or("");
            let snippet = result.get("snippet").and_then(Value::as_str).unwrap_or("");
            block.push_str(&format!("\n[{}] {}\n", i + 1, title));
            if !snippet.is_empty() {
                block.push_str(&format!("{}\n", snippet));
            }
            block.push_str(&format!("{}\n", url));
        }
        block.push_str("\nUse this information to complete the answer.\n");

        self.cache.lock().insert(cache_key, block.clone());
        Some(block)
    }

    /// Check a response for hedging and supplement it from the web when
    /// warranted. The rewrite keeps the original's structure and cites
    /// URLs; if the rewrite call fails the raw results are appended
    /// instead.
    pub async fn enhance(
        &self,
        core: &AgentCore,
        task: &str,
        response: &str,
        context: &TaskContext,
        force_search: bool,
    ) -> EnhancementOutcome {
        if !self.config.enabled {
            return EnhancementOutcome::passthrough(response);
        }

        let (is_uncertain, confidence, _hedges) = self.detect_uncertainty(response);
        let requires_current = self.task_requires_current_info(task);

        let mut outcome = EnhancementOutcome {
            response: response.to_string(),
            enhanced: false,
            confidence,
            search_performed: false,
        };
        if !(force_search || is_uncertain || requires_current) {
            return outcome;
        }

        let query = self.search_query(task);
        let Some(search_block) = self.search_for_missing_info(core, &query).await else {
            return outcome;
        };
        outcome.search_performed = true;

        let rewrite_prompt = format!(
            "TASK: {task}\n\n\
             ORIGINAL ANSWER:\n{response}\n\n\
             WEB SEARCH RESULTS:\n{search_block}\n\
             Improve the original answer using the search results. Do not invent \
             facts beyond them, cite source URLs for key claims, and keep the \
             original structure. If the results are irrelevant, return the \
             original answer unchanged."
        );

        match core
            .llm_respond(
                vec![
                    ChatMessage::system(
                        "You improve answers with current information from web search results.",
                    ),
                    ChatMessage::user(rewrite_prompt),
                ],
                context,
                LlmCallOptions::plain()
                    .with_temperature(0.3)
                    .with_max_tokens(1500),
            )
            .await
        {
            Ok(rewritten) => {
                outcome.response = rewritten.content;
                outcome.enhanced = true;
                info!("response enhanced with web search results");
            }
            Err(err) => {
                warn!(error = %err, "rewrite failed, appending raw search results");
                outcome.response = format!("{}\n{}", response, search_block);
                outcome.enhanced = true;
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use ensemble_core::{AgentDescriptor, Capability, LlmError, Tool, ToolResult};
    use ensemble_llm::{LlmGateway, MockProvider};
    use ensemble_tools::ToolRegistry;

    struct CountingSearchTool {
        calls: Arc<AtomicU64>,
    }

    #[async_trait]
    impl Tool for CountingSearchTool {
        fn id(&self) -> &str {
            WEB_SEARCH_TOOL
        }
        fn name(&self) -> &str {
            "Web Search"
        }
        fn description(&self) -> &str {
            "Searches the web"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: Value) -> ToolResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ToolResult::ok(json!({
                "results": [
                    {"title": "v3 release notes", "url": "https://example.com/v3", "snippet": "v3 shipped"},
                ]
            }))
        }
    }

    fn stage() -> UncertaintySearch {
        UncertaintySearch::new(UncertaintySearchConfig::default())
    }

    fn core_with(provider: MockProvider, calls: Option<Arc<AtomicU64>>) -> AgentCore {
        let gateway = Arc::new(LlmGateway::new());
        gateway.register("mock", Arc::new(provider));
        let mut descriptor = AgentDescriptor::new("react", vec![Capability::Reasoning]);
        descriptor.reflection.enabled = false;
        let mut core = AgentCore::new(descriptor, gateway);
        if let Some(calls) = calls {
            let registry = Arc::new(ToolRegistry::new());
            registry.register(Arc::new(CountingSearchTool { calls }));
            core = core.with_tools(registry);
        }
        core
    }

    #[test]
    fn hedging_lowers_confidence() {
        let stage = stage();
        let (uncertain, confidence, hedges) =
            stage.detect_uncertainty("I'm not sure, it might be v2, possibly v3.");
        assert!(uncertain);
        assert_eq!(hedges.len(), 3);
        assert!((confidence - 0.55).abs() < 1e-9);
    }

    #[test]
    fn confident_answers_pass() {
        let stage = stage();
        let (uncertain, confidence, hedges) = stage.detect_uncertainty("The answer is 42.");
        assert!(!uncertain);
        assert_eq!(confidence, CONFIDENT);
        assert!(hedges.is_empty());
    }

    #[test]
    fn one_hedge_stays_above_the_threshold() {
        let stage = stage();
        let (uncertain, confidence, _) =
            stage.detect_uncertainty("It could be related to the cache.");
        assert!(!uncertain);
        assert!((confidence - 0.85).abs() < 1e-9);
    }

    #[test]
    fn current_info_detection_respects_word_boundaries() {
        let stage = stage();
        assert!(stage.task_requires_current_info("what is the latest stable version"));
        assert!(stage.task_requires_current_info("install the sdk dependencies"));
        // "crates" must not trip the price/rate pattern
        assert!(!stage.task_requires_current_info("compare the fastest sorting crates"));
        assert!(!stage.task_requires_current_info("explain the parser module"));
    }

    #[test]
    fn query_drops_stop_words() {
        let stage = stage();
        let query = stage.search_query("What is the latest version of the tokio library");
        assert_eq!(query, "latest version tokio library");
    }

    #[tokio::test]
    async fn confident_static_responses_skip_the_search() {
        let calls = Arc::new(AtomicU64::new(0));
        let core = core_with(MockProvider::new(), Some(Arc::clone(&calls)));
        let stage = stage();

        let outcome = stage
            .enhance(&core, "sum two numbers", "The sum is 5.", &TaskContext::new(), false)
            .await;
        assert!(!outcome.enhanced);
        assert!(!outcome.search_performed);
        assert_eq!(outcome.response, "The sum is 5.");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn uncertain_responses_are_rewritten_from_search() {
        let calls = Arc::new(AtomicU64::new(0));
        let provider = MockProvider::new().with_response("v3 is current, per https://example.com/v3");
        let core = core_with(provider, Some(Arc::clone(&calls)));
        let stage = stage();

        let outcome = stage
            .enhance(
                &core,
                "which tokio version should we use",
                "I'm not sure, it might be v2, possibly v3.",
                &TaskContext::new(),
                false,
            )
            .await;
        assert!(outcome.enhanced);
        assert!(outcome.search_performed);
        assert!(outcome.confidence < 0.6);
        assert!(outcome.response.contains("https://example.com/v3"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn search_results_are_cached_per_query() {
        let calls = Arc::new(AtomicU64::new(0));
        let provider = MockProvider::new().with_response("rewritten");
        let core = core_with(provider, Some(Arc::clone(&calls)));
        let stage = stage();

        for _ in 0..2 {
            stage
                .enhance(
                    &core,
                    "latest tokio release",
                    "I'm not sure, might be old, possibly wrong.",
                    &TaskContext::new(),
                    false,
                )
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rewrite_failure_appends_the_raw_results() {
        let calls = Arc::new(AtomicU64::new(0));
        let provider = MockProvider::new().with_error(LlmError::Config("no provider".into()));
        let core = core_with(provider, Some(Arc::clone(&calls)));
        let stage = stage();

        let outcome = stage
            .enhance(
                &core,
                "latest benchmarks",
                "I'm not sure, might be stale, possibly off.",
                &TaskContext::new(),
                false,
            )
            .await;
        assert!(outcome.enhanced);
        assert!(outcome.response.starts_with("I'm not sure"));
        assert!(outcome.response.contains("ADDITIONAL CURRENT INFORMATION"));
    }

    #[tokio::test]
    async fn missing_search_tool_leaves_the_response_alone() {
        let core = core_with(MockProvider::new(), None);
        let stage = stage();

        let outcome = stage
            .enhance(
                &core,
                "latest release",
                "I'm not sure, might be v2, possibly v3.",
                &TaskContext::new(),
                false,
            )
            .await;
        assert!(!outcome.enhanced);
        assert!(!outcome.search_performed);
    }

    #[tokio::test]
    async fn disabled_stage_is_a_passthrough() {
        let core = core_with(MockProvider::new(), None);
        let stage = UncertaintySearch::new(UncertaintySearchConfig {
            enabled: false,
            ..Default::default()
        });

        let outcome = stage
            .enhance(&core, "latest release", "I'm not sure at all.", &TaskContext::new(), true)
            .await;
        assert!(!outcome.enhanced);
        assert_eq!(outcome.response, "I'm not sure at all.");
    }
}
