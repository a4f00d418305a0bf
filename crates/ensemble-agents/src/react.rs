//! ReAct agent: a Thought/Action/Action Input/Observation interpreter

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use ensemble_core::{
    AgentDescriptor, Capability, ChatMessage, EnsembleError, Result, TaskContext, TaskResult,
};

use crate::agent::{Agent, AgentCore, LlmCallOptions};
use crate::uncertainty::{UncertaintySearch, UncertaintySearchConfig};

const THINKING_TASK_CHARS: usize = 100;
const THINKING_KEYWORDS: [&str; 5] = ["complex", "analyze", "plan", "design", "optimize"];

pub fn capabilities() -> Vec<Capability> {
    vec![Capability::Reasoning, Capability::ToolUsage]
}

pub fn default_descriptor() -> AgentDescriptor {
    AgentDescriptor::new("react", capabilities())
}

pub struct ReactAgent {
    core: AgentCore,
    uncertainty: UncertaintySearch,
    final_answer: Regex,
    action: Regex,
    action_input: Regex,
}

impl ReactAgent {
    pub fn new(core: AgentCore) -> Self {
        Self {
            core,
            uncertainty: UncertaintySearch::new(UncertaintySearchConfig::default()),
            final_answer: Regex::new(r"(?s)Final Answer:\s*(.+)$").expect("static pattern"),
            action: Regex::new(r"Action:\s*(\w+)").expect("static pattern"),
            action_input: Regex::new(r"(?s)Action Input:\s*(.+?)(?:Observation:|$)")
                .expect("static pattern"),
        }
    }

    pub fn with_uncertainty(mut self, config: UncertaintySearchConfig) -> Self {
        self.uncertainty = UncertaintySearch::new(config);
        self
    }

    fn system_prompt(&self, tool_descriptions: &str) -> String {
        format!(
            "You are a helpful AI assistant that can use tools to solve problems. \
             You excel at step-by-step reasoning.\n\n\
             Available tools:\n{tool_descriptions}\n\n\
             Use the following format:\n\
             Thought: [your reasoning - think step by step]\n\
             Action: [tool_name]\n\
             Action Input: [tool input as JSON]\n\
             Observation: [result from tool]\n\
             ... (repeat Thought/Action/Action Input/Observation as needed)\n\
             Final Answer: [your final answer]\n\n\
             GUIDELINES:\n\
             - Always think before acting and consider edge cases.\n\
             - Break complex problems into smaller steps.\n\
             - Reflect on tool results and adjust your approach when needed.\n\
             You can use tools multiple times."
        )
    }

    fn wants_thinking(&self, task: &str) -> bool {
        let lower = task.to_lowercase();
        self.core.descriptor().thinking_mode
            || task.chars().count() > THINKING_TASK_CHARS
            || THINKING_KEYWORDS.iter().any(|k| lower.contains(k))
    }
}

#[async_trait]
impl Agent for ReactAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn execute(&self, task: &str, context: TaskContext) -> Result<TaskResult> {
        self.core.run_pipeline(self, task, context).await
    }

    async fn execute_impl(&self, task: &str, context: &TaskContext) -> Result<TaskResult> {
        let tools = self
            .core
            .tools()
            .ok_or_else(|| EnsembleError::Agent("tool registry required for react agent".into()))?;

        let tool_descriptions = tools
            .list()
            .iter()
            .map(|t| format!("- {}: {}", t.id, t.description))
            .collect::<Vec<_>>()
            .join("\n");

        let mut messages = vec![
            ChatMessage::system(self.system_prompt(&tool_descriptions)),
            ChatMessage::user(format!("Task: {}", task)),
        ];

        let max_iterations = self.core.descriptor().max_iterations;
        let use_thinking = self.wants_thinking(task);

        for iteration in 1..=max_iterations {
            let response = self
                .core
                .llm_respond(
                    messages.clone(),
                    context,
                    LlmCallOptions::enriched().with_thinking(use_thinking),
                )
                .await?
                .content;
            messages.push(ChatMessage::assistant(&response));

            if let Some(capture) = self.final_answer.captures(&response) {
                let final_answer = capture[1].trim().to_string();
                info!(agent = "react", iterations = iteration, "final answer reached");

                // A hedged answer gets one supplementary web search pass.
                let outcome = self
                    .uncertainty
                    .enhance(&self.core, task, &final_answer, context, false)
                    .await;
                return Ok(TaskResult::ok()
                    .with("agent", json!("react"))
                    .with("task", json!(task))
                    .with("final_answer", json!(outcome.response))
                    .with("iterations", json!(iteration))
                    .with("uncertainty_confidence", json!(outcome.confidence))
                    .with("search_performed", json!(outcome.search_performed)));
            }

            let action = self.action.captures(&response);
            let action_input = self.action_input.captures(&response);

            match (action, action_input) {
                (Some(action), Some(input)) => {
                    let tool_name = action[1].trim().to_string();
                    let raw_input = input[1].trim().to_string();
                    // JSON input when it parses, a bare string otherwise.
                    let args: Value = serde_json::from_str(&raw_input)
                        .unwrap_or_else(|_| Value::String(raw_input));

                    debug!(agent = "react", tool = %tool_name, "invoking tool");
                    let output = tools.execute(&tool_name, args).await;
                    let observation = if output.success {
                        format!(
                            "Tool '{}' executed successfully. Result: {}",
                            tool_name,
                            output.output_text()
                        )
                    } else {
                        format!(
                            "Tool '{}' execution failed. Error: {}",
                            tool_name,
                            output.error.as_deref().unwrap_or("unknown error")
                        )
                    };
                    messages.push(ChatMessage::user(format!("Observation: {}", observation)));
                }
                _ => {
                    warn!(agent = "react", "response had no parseable action");
                    messages.push(ChatMessage::user(
                        "Please provide a Thought, Action, and Action Input, or a Final Answer.",
                    ));
                }
            }
        }

        warn!(agent = "react", max_iterations, "iteration budget exhausted");
        Ok(TaskResult::fail("max iterations reached")
            .with("agent", json!("react"))
            .with("task", json!(task))
            .with("iterations", json!(max_iterations)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use ensemble_core::{Tool, ToolResult};
    use ensemble_llm::{LlmGateway, MockProvider};
    use ensemble_tools::ToolRegistry;

    struct CalculatorTool;

    #[async_trait]
    impl Tool for CalculatorTool {
        fn id(&self) -> &str {
            "calculator"
        }
        fn name(&self) -> &str {
            "Calculator"
        }
        fn description(&self) -> &str {
            "Evaluates additions of two integers"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, args: Value) -> ToolResult {
            let a = args.get("a").and_then(Value::as_i64);
            let b = args.get("b").and_then(Value::as_i64);
            match (a, b) {
                (Some(a), Some(b)) => ToolResult::text((a + b).to_string()),
                _ => ToolResult::error("need integer fields a and b"),
            }
        }
    }

    struct StubSearchTool;

    #[async_trait]
    impl Tool for StubSearchTool {
        fn id(&self) -> &str {
            "web_search"
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
            ToolResult::ok(json!({
                "results": [
                    {"title": "v3 notes", "url": "https://example.com/v3", "snippet": "v3 is out"},
                ]
            }))
        }
    }

    fn agent_with(provider: MockProvider, max_iterations: u32) -> ReactAgent {
        let gateway = Arc::new(LlmGateway::new());
        gateway.register("mock", Arc::new(provider));
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(CalculatorTool));
        let mut descriptor = default_descriptor().with_max_iterations(max_iterations);
        descriptor.reflection.enabled = false;
        ReactAgent::new(AgentCore::new(descriptor, gateway).with_tools(registry))
    }

    #[tokio::test]
    async fn tool_loop_reaches_a_final_answer() {
        let provider = MockProvider::new()
            .with_responses(vec![
                "Thought: I should add the numbers.\nAction: calculator\nAction Input: {\"a\": 2, \"b\": 3}"
                    .into(),
                "Thought: The tool returned 5.\nFinal Answer: 2 + 3 = 5".into(),
            ])
            .once();
        let agent = agent_with(provider.clone(), 5);

        let result = agent.execute("add 2 and 3", TaskContext::new()).await.unwrap();
        assert!(result.success());
        assert_eq!(result.get_str("final_answer"), Some("2 + 3 = 5"));
        assert_eq!(result.get("iterations"), Some(&json!(2)));

        // the observation fed back into the conversation
        let calls = provider.calls();
        let last = &calls[1];
        let observation = last
            .messages
            .iter()
            .rev()
            .find(|m| m.content.starts_with("Observation:"))
            .unwrap();
        assert!(observation.content.contains("5"));
    }

    #[tokio::test]
    async fn failed_tools_become_observations() {
        let provider = MockProvider::new()
            .with_responses(vec![
                "Action: calculator\nAction Input: {\"a\": 1}".into(),
                "Final Answer: could not compute".into(),
            ])
            .once();
        let agent = agent_with(provider.clone(), 5);

        let result = agent.execute("add", TaskContext::new()).await.unwrap();
        assert!(result.success());

        let calls = provider.calls();
        let observation = calls[1]
            .messages
            .iter()
            .rev()
            .find(|m| m.content.starts_with("Observation:"))
            .unwrap();
        assert!(observation.content.contains("execution failed"));
    }

    #[tokio::test]
    async fn unknown_tools_do_not_abort_the_loop() {
        let provider = MockProvider::new()
            .with_responses(vec![
                "Action: teleport\nAction Input: {}".into(),
                "Final Answer: done without the tool".into(),
            ])
            .once();
        let agent = agent_with(provider, 5);

        let result = agent.execute("do it", TaskContext::new()).await.unwrap();
        assert!(result.success());
    }

    #[tokio::test]
    async fn iteration_budget_exhaustion_fails() {
        let provider = MockProvider::new().with_response("Thought: still thinking, no action yet.");
        let agent = agent_with(provider, 3);

        let result = agent.execute("loop forever", TaskContext::new()).await.unwrap();
        assert!(!result.success());
        assert_eq!(result.get("iterations"), Some(&json!(3)));
        assert!(result.error().unwrap().contains("max iterations"));
    }

    #[tokio::test]
    async fn hedged_final_answers_trigger_a_supplementary_search() {
        let provider = MockProvider::new()
            .with_responses(vec![
                "Final Answer: I'm not sure, it might be v2, possibly v3.".into(),
                "It is v3, per https://example.com/v3.".into(),
            ])
            .once();
        let gateway = Arc::new(LlmGateway::new());
        gateway.register("mock", Arc::new(provider));
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(StubSearchTool));
        let mut descriptor = default_descriptor().with_max_iterations(3);
        descriptor.reflection.enabled = false;
        let agent = ReactAgent::new(AgentCore::new(descriptor, gateway).with_tools(registry));

        let result = agent
            .execute("which runtime version do we target", TaskContext::new())
            .await
            .unwrap();
        assert!(result.success());
        assert_eq!(result.get("search_performed"), Some(&json!(true)));
        assert!(result.get_str("final_answer").unwrap().contains("https://example.com/v3"));
        assert!(result.get("uncertainty_confidence").unwrap().as_f64().unwrap() < 0.6);
    }

    #[tokio::test]
    async fn confident_final_answers_skip_the_search_pass() {
        let provider = MockProvider::new()
            .with_responses(vec!["Final Answer: the total is 12".into()])
            .once();
        let agent = agent_with(provider, 3);

        let result = agent.execute("total the order", TaskContext::new()).await.unwrap();
        assert_eq!(result.get("search_performed"), Some(&json!(false)));
        assert_eq!(result.get_str("final_answer"), Some("the total is 12"));
    }

    #[tokio::test]
    async fn long_tasks_enable_thinking_mode() {
        let provider = MockProvider::new().with_response("Final Answer: ok");
        let agent = agent_with(provider.clone(), 3);

        let long_task = format!("analyze this in depth: {}", "detail ".repeat(30));
        agent.execute(&long_task, TaskContext::new()).await.unwrap();
        assert!(provider.last_call().unwrap().config.thinking);

        let short = "sum 1 and 2";
        agent.execute(short, TaskContext::new()).await.unwrap();
        assert!(!provider.last_call().unwrap().config.thinking);
    }
}
