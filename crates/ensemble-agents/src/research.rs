//! Research agent: retrieval plus live web search when freshness matters

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{info, warn};

use ensemble_core::{AgentDescriptor, Capability, ChatMessage, Result, TaskContext, TaskResult};

use crate::agent::{Agent, AgentCore, LlmCallOptions};
use crate::uncertainty::{UncertaintySearch, UncertaintySearchConfig};

const WEB_SEARCH_TOOL: &str = "web_search";
const CURRENCY_KEYWORDS: [&str; 10] = [
    "find", "search", "latest", "news", "current", "recent", "version", "release", "today",
    "modern",
];

pub fn capabilities() -> Vec<Capability> {
    vec![Capability::WebSearch, Capability::Research]
}

pub fn default_descriptor() -> AgentDescriptor {
    AgentDescriptor::new("research", capabilities())
}

pub struct ResearchAgent {
    core: AgentCore,
    uncertainty: UncertaintySearch,
}

impl ResearchAgent {
    pub fn new(core: AgentCore) -> Self {
        Self {
            core,
            uncertainty: UncertaintySearch::new(UncertaintySearchConfig::default()),
        }
    }

    pub fn with_uncertainty(mut self, config: UncertaintySearchConfig) -> Self {
        self.uncertainty = UncertaintySearch::new(config);
        self
    }

    fn needs_web_search(task: &str) -> bool {
        let lower = task.to_lowercase();
        CURRENCY_KEYWORDS.iter().any(|k| lower.contains(k))
    }

    async fn run_web_search(&self, task: &str) -> Option<String> {
        let tools = self.core.tools()?;
        if !tools.has(WEB_SEARCH_TOOL) {
            return None;
        }

        info!(agent = "research", "performing web search");
        let output = tools
            .execute(WEB_SEARCH_TOOL, json!({"query": task, "max_results": 10}))
            .await;
        if !output.success {
            warn!(
                agent = "research",
                error = output.error.as_deref().unwrap_or(""),
                "web search failed"
            );
            return Some("\n\nWeb search failed; answer from existing knowledge.\n".to_string());
        }

        let results = output
            .output
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if results.is_empty() {
            return Some("\n\nWeb search returned no results.\n".to_string());
        }

        let mut block = String::from(
            "\n\n=== WEB SEARCH RESULTS (you MUST use this information) ===\n",
        );
        for (i, result) in results.iter().take(5).enumerate() {
            let title = result.get("title").and_then(Value::as_str).unwrap_or("");
            let url = result.get("url").and_then(Value::as_str).unwrap_or("");
            let snippet = result.get("snippet").and_then(Value::as_str).unwrap_or("");
            block.push_str(&format!("\n[Source {}]\nTitle: {}\nURL: {}\n", i + 1, title, url));
            if !snippet.is_empty() {
                block.push_str(&format!("Summary: {}\n", snippet));
            }
        }
        block.push_str("=== END OF SEARCH RESULTS ===\n");
        Some(block)
    }
}

#[async_trait]
impl Agent for ResearchAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn execute(&self, task: &str, context: TaskContext) -> Result<TaskResult> {
        self.core.run_pipeline(self, task, context).await
    }

    async fn execute_impl(&self, task: &str, context: &TaskContext) -> Result<TaskResult> {
        let search_block = if Self::needs_web_search(task) {
            self.run_web_search(task).await
        } else {
            None
        };
        let web_search_used = search_block
            .as_deref()
            .is_some_and(|b| b.contains("WEB SEARCH RESULTS"));

        let retrieval = self.core.context_for(task).await;

        let system_prompt = "You are an expert researcher and analyst. You study codebases, \
             requirements, and external sources, and produce thorough reports.\n\
             Provide: structure and architecture analysis, patterns and conventions, \
             dependencies, potential problems, and recommendations.\n\
             RULES:\n\
             1. When web search results are provided you MUST use them.\n\
             2. Cite source URLs for every claim taken from search results.\n\
             3. Do not invent facts: use only the provided context and results.";

        let mut user_prompt = format!("Research task: {}\n", task);
        if let Some(block) = &search_block {
            user_prompt.push_str(block);
        }
        if !retrieval.is_empty() {
            user_prompt.push_str(&format!("\nRelevant codebase context:\n{}\n", retrieval));
        }

        let report = self
            .core
            .llm_respond(
                vec![ChatMessage::system(system_prompt), ChatMessage::user(user_prompt)],
                context,
                LlmCallOptions::enriched(),
            )
            .await?
            .content;

        let mut result = TaskResult::ok()
            .with("agent", json!("research"))
            .with("task", json!(task))
            .with("report", json!(report.clone()))
            .with("web_search_used", json!(web_search_used));

        // A hedged report gets one supplementary search pass, unless a
        // search already fed this answer.
        if !web_search_used {
            let outcome = self
                .uncertainty
                .enhance(&self.core, task, &report, context, false)
                .await;
            result.insert("uncertainty_confidence", json!(outcome.confidence));
            if outcome.enhanced {
                result.insert("report", json!(outcome.response));
                result.insert("web_search_used", json!(outcome.search_performed));
            }
        }
        Ok(result)
    }
}
