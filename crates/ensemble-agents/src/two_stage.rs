//! Two-stage generation: a fast model analyzes, a strong model produces
//!
//! Complex code requests first go through a cheap structural analysis;
//! the strong generation pass then works from that plan instead of the
//! raw request.

use serde::{Deserialize, Serialize};
use tracing::debug;

use ensemble_core::{ChatMessage, Result, TaskContext};

use crate::agent::{AgentCore, LlmCallOptions};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TwoStageConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Provider alias for the fast analysis pass; gateway default when
    /// unset.
    #[serde(default)]
    pub fast_provider: Option<String>,
    /// Provider alias for the strong generation pass.
    #[serde(default)]
    pub strong_provider: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwoStageOutcome {
    pub analysis: String,
    pub content: String,
}

pub struct TwoStageProcessor {
    config: TwoStageConfig,
}

impl TwoStageProcessor {
    pub fn new(config: TwoStageConfig) -> Self {
        Self { config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub async fn process(
        &self,
        core: &AgentCore,
        task: &str,
        system_prompt: &str,
        context: &TaskContext,
    ) -> Result<TwoStageOutcome> {
        debug!(agent = core.name(), "two-stage: fast analysis pass");

        let analysis_prompt = format!(
            "Analyze this programming task before any code is written.\n\n\
             TASK:\n{task}\n\n\
             Produce a short plan: required components, data structures, edge cases, \
             and the order of implementation. No code."
        );
        let mut analysis_options = LlmCallOptions::plain()
            .with_temperature(0.3)
            .with_max_tokens(500);
        analysis_options.provider = self.config.fast_provider.clone();

        let analysis = core
            .llm_respond(
                vec![
                    ChatMessage::system("You are a senior engineer planning an implementation."),
                    ChatMessage::user(analysis_prompt),
                ],
                context,
                analysis_options,
            )
            .await?
            .content;

        debug!(agent = core.name(), "two-stage: strong generation pass");

        let generation_prompt = format!(
            "TASK:\n{task}\n\nIMPLEMENTATION PLAN (from prior analysis):\n{analysis}\n\n\
             Implement the task following the plan. Return the code in a fenced block."
        );
        let mut generation_options = LlmCallOptions::enriched();
        generation_options.provider = self.config.strong_provider.clone();

        let content = core
            .llm_respond(
                vec![
                    ChatMessage::system(system_prompt),
                    ChatMessage::user(generation_prompt),
                ],
                context,
                generation_options,
            )
            .await?
            .content;

        Ok(TwoStageOutcome { analysis, content })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use ensemble_core::{AgentDescriptor, Capability};
    use ensemble_llm::{LlmGateway, MockProvider};

    #[tokio::test]
    async fn both_stages_run_in_order() {
        let provider = MockProvider::new()
            .with_responses(vec![
                "plan: write a function".into(),
                "```python\ndef run():\n    pass\n```".into(),
            ])
            .once();
        let gateway = Arc::new(LlmGateway::new());
        gateway.register("mock", Arc::new(provider.clone()));
        let mut descriptor = AgentDescriptor::new("code_writer", vec![Capability::CodeGeneration]);
        descriptor.reflection.enabled = false;
        let core = AgentCore::new(descriptor, gateway);

        let processor = TwoStageProcessor::new(TwoStageConfig {
            enabled: true,
            ..Default::default()
        });
        let outcome = processor
            .process(&core, "build run()", "You write code.", &TaskContext::new())
            .await
            .unwrap();

        assert_eq!(outcome.analysis, "plan: write a function");
        assert!(outcome.content.contains("def run()"));
        // the generation prompt carried the analysis forward
        let second_call = provider.calls()[1].clone();
        let user = second_call
            .messages
            .iter()
            .find(|m| matches!(m.role, ensemble_core::Role::User))
            .unwrap();
        assert!(user.content.contains("plan: write a function"));
    }
}
