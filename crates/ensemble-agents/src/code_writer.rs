//! Code-writer agent: specialized prompts, validation, self-consistency

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use ensemble_core::{AgentDescriptor, Capability, ChatMessage, Result, TaskContext, TaskResult};
use ensemble_validator::{CodeValidator, detect_language, extract_code};

use crate::agent::{Agent, AgentCore, LlmCallOptions};
use crate::consistency::{SelfConsistency, SelfConsistencyConfig, consensus_fields};
use crate::two_stage::{TwoStageConfig, TwoStageProcessor};

const COMPLEX_TASK_CHARS: usize = 200;
const COMPLEX_KEYWORDS: [&str; 5] = ["architecture", "refactor", "optimize", "design", "system"];
const CRITICAL_KEYWORDS: [&str; 4] = ["critical", "production", "security", "must not fail"];

pub fn capabilities() -> Vec<Capability> {
    vec![Capability::CodeGeneration, Capability::CodeRefactoring]
}

pub struct CodeWriterAgent {
    core: AgentCore,
    validator: Arc<CodeValidator>,
    consistency: SelfConsistency,
    two_stage: TwoStageProcessor,
}

impl CodeWriterAgent {
    pub fn new(core: AgentCore, validator: Arc<CodeValidator>) -> Self {
        Self {
            core,
            validator,
            consistency: SelfConsistency::new(SelfConsistencyConfig::default()),
            two_stage: TwoStageProcessor::new(TwoStageConfig::default()),
        }
    }

    pub fn with_consistency(mut self, config: SelfConsistencyConfig) -> Self {
        self.consistency = SelfConsistency::new(config);
        self
    }

    pub fn with_two_stage(mut self, config: TwoStageConfig) -> Self {
        self.two_stage = TwoStageProcessor::new(config);
        self
    }

    fn system_prompt() -> &'static str {
        "You are an expert software engineer. Write clean, working, idiomatic code.\n\
         - Solve exactly the task given\n\
         - Include necessary imports\n\
         - Handle edge cases and errors\n\
         - Return the solution in a fenced code block"
    }

    fn is_complex(task: &str) -> bool {
        let lower = task.to_lowercase();
        task.chars().count() > COMPLEX_TASK_CHARS
            || COMPLEX_KEYWORDS.iter().any(|k| lower.contains(k))
    }

    fn is_critical(task: &str, context: &TaskContext) -> bool {
        let lower = task.to_lowercase();
        context.get("critical").and_then(|v| v.as_bool()).unwrap_or(false)
            || CRITICAL_KEYWORDS.iter().any(|k| lower.contains(k))
    }

    fn preferred_language(task: &str, context: &TaskContext) -> Option<String> {
        if let Some(lang) = context.get_str("language") {
            return Some(lang.to_lowercase());
        }
        let lower = task.to_lowercase();
        for lang in ["python", "javascript", "typescript", "rust", "go"] {
            if lower.contains(lang) {
                return Some(lang.to_string());
            }
        }
        None
    }
}

#[async_trait]
impl Agent for CodeWriterAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn execute(&self, task: &str, context: TaskContext) -> Result<TaskResult> {
        self.core.run_pipeline(self, task, context).await
    }

    async fn execute_impl(&self, task: &str, context: &TaskContext) -> Result<TaskResult> {
        info!(agent = "code_writer", task = %crate::agent::slice(task, 80), "generating code");

        let retrieval = self.core.context_for(task).await;
        let user_prompt = if retrieval.is_empty() {
            format!("Task: {}", task)
        } else {
            format!("Task: {}\n\nRelevant codebase context:\n{}", task, retrieval)
        };
        let messages = vec![
            ChatMessage::system(Self::system_prompt()),
            ChatMessage::user(user_prompt),
        ];

        let mut result = TaskResult::new();
        let raw_content;

        if self.consistency.enabled() && Self::is_critical(task, context) {
            let outcome = self.consistency.generate(&self.core, &messages, context).await?;
            for (key, value) in consensus_fields(&outcome) {
                result.insert(key, value);
            }
            raw_content = outcome.content;
        } else if self.two_stage.enabled() && Self::is_complex(task) {
            let outcome = self
                .two_stage
                .process(&self.core, task, Self::system_prompt(), context)
                .await?;
            result.insert("analysis", json!(outcome.analysis));
            raw_content = outcome.content;
        } else {
            raw_content = self
                .core
                .llm_respond(messages, context, LlmCallOptions::enriched())
                .await?
                .content;
        }

        let preferred = Self::preferred_language(task, context);
        let code = extract_code(&raw_content, preferred.as_deref());
        let language = preferred.unwrap_or_else(|| detect_language(&code).to_string());

        let validation = self
            .validator
            .validate(&code, Some(&language), true, Some(task))
            .await;

        // A repaired body replaces the extraction when the repair holds up.
        let final_code = match (&validation.fixed_code, validation.is_valid) {
            (Some(fixed), true) => fixed.clone(),
            _ => code,
        };

        debug!(
            agent = "code_writer",
            valid = validation.is_valid,
            errors = validation.errors_count,
            "validation finished"
        );

        result.insert("success", json!(validation.is_valid));
        result.insert("code", json!(final_code));
        result.insert("language", json!(language));
        result.insert("validation", serde_json::to_value(&validation)?);
        result.insert("agent", json!("code_writer"));
        result.insert("task", json!(task));
        if !validation.is_valid {
            result.insert(
                "error",
                json!(format!(
                    "generated code failed validation with {} error(s)",
                    validation.errors_count
                )),
            );
        }
        Ok(result)
    }
}

pub fn default_descriptor() -> AgentDescriptor {
    AgentDescriptor::new("code_writer", capabilities())
}
