//! Top-level task entrypoint: route, bound parallelism, execute

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use ensemble_agents::AgentRegistry;
use ensemble_core::{
    AgentDirectory, BusMessage, ChatMessage, EnsembleError, GenerationConfig, MessageKind, Result,
    TaskContext, TaskResult,
};
use ensemble_llm::{GenerateRequest, LlmGateway};

use crate::config::OrchestratorSection;

pub const ORCHESTRATOR_SENDER: &str = "orchestrator";

pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    gateway: Arc<LlmGateway>,
    limiter: Arc<Semaphore>,
    classifier_enabled: bool,
    task_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        gateway: Arc<LlmGateway>,
        section: &OrchestratorSection,
    ) -> Self {
        Self {
            registry,
            gateway,
            limiter: Arc::new(Semaphore::new(section.max_parallel_tasks.max(1))),
            classifier_enabled: section.classifier_enabled,
            task_timeout: Duration::from_secs(section.task_timeout_secs),
        }
    }

    /// Execute one task. An explicit agent name wins; otherwise the
    /// router picks one (multi-step tasks go to the workflow agent).
    /// Concurrency across callers is bounded by `max_parallel_tasks`.
    pub async fn execute_task(
        &self,
        task: &str,
        agent: Option<&str>,
        context: TaskContext,
    ) -> Result<TaskResult> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| EnsembleError::Internal("orchestrator is shut down".into()))?;

        let agent_name = match agent {
            Some(name) => {
                if !self.registry.has_agent(name) {
                    return Err(EnsembleError::Validation(format!("agent {} not found", name)));
                }
                name.to_string()
            }
            None => self.route(task).await,
        };

        info!(agent = %agent_name, task = %truncate(task, 80), "dispatching task");

        // The call goes through the mediator so delegation stats and
        // history cover orchestrated work too.
        let message = BusMessage::new(ORCHESTRATOR_SENDER, &agent_name, MessageKind::Request)
            .with_content("task", json!(task))
            .with_context(context.into_map())
            .with_timeout(self.task_timeout);

        let response = self
            .registry
            .mediator()
            .send(message)
            .await?
            .ok_or_else(|| EnsembleError::Internal("request produced no response".into()))?;

        if !response.success() {
            return Err(EnsembleError::Agent(
                response.error().unwrap_or("task execution failed").to_string(),
            ));
        }
        let inner = response
            .get("result")
            .and_then(|v| v.as_object())
            .cloned()
            .map(TaskResult::from)
            .unwrap_or_else(|| response.clone());
        Ok(inner)
    }

    /// Pick an agent for an unrouted task: LLM classification when
    /// enabled, keyword heuristics as the fallback.
    async fn route(&self, task: &str) -> String {
        if self.classifier_enabled {
            if let Some(choice) = self.classify_with_llm(task).await {
                debug!(agent = %choice, "classifier routed task");
                return choice;
            }
        }
        let choice = fallback_route(task);
        debug!(agent = %choice, "heuristics routed task");
        choice.to_string()
    }

    async fn classify_with_llm(&self, task: &str) -> Option<String> {
        let agents = self.registry.list();
        if agents.is_empty() {
            return None;
        }
        let listing = agents.join(", ");

        let prompt = format!(
            "Route this task to exactly one agent.\n\n\
             Agents: {listing}\n\
             - code_writer: writes and refactors code\n\
             - react: step-by-step reasoning with tools\n\
             - research: investigates, searches, reports\n\
             - data_analysis: datasets, statistics, ML\n\
             - workflow: multi-step plans with several stages\n\
             - integration: external APIs and services\n\
             - monitoring: system health and metrics\n\n\
             TASK: {task}\n\n\
             Answer with ONLY the agent name."
        );

        let request = GenerateRequest::new(vec![ChatMessage::user(prompt)]).with_config(
            GenerationConfig::default()
                .with_temperature(0.0)
                .with_max_tokens(16),
        );

        match self.gateway.generate(request).await {
            Ok(response) => {
                let name = response.content.trim().to_lowercase();
                let name = name.split_whitespace().next().unwrap_or("").to_string();
                if self.registry.has_agent(&name) {
                    Some(name)
                } else {
                    warn!(choice = %name, "classifier picked an unknown agent");
                    None
                }
            }
            Err(err) => {
                warn!(error = %err, "classification failed, using heuristics");
                None
            }
        }
    }
}

/// Keyword routing used when the classifier is disabled or fails.
pub fn fallback_route(task: &str) -> &'static str {
    let lower = task.to_lowercase();
    let any = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));

    if any(&["first", "then", "after that", "steps", "pipeline", "workflow"]) {
        "workflow"
    } else if any(&["write code", "implement", "function", "refactor", "bug", "script"]) {
        "code_writer"
    } else if any(&["analyze data", "dataset", "csv", "statistics", "classify", "predict"]) {
        "data_analysis"
    } else if any(&["search", "find", "research", "investigate", "compare"]) {
        "research"
    } else if any(&["api", "integrate", "webhook", "endpoint"]) {
        "integration"
    } else if any(&["monitor", "health", "metrics", "cpu", "memory usage"]) {
        "monitoring"
    } else {
        "react"
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
