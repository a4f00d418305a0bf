//! Integration agent: external API probing and integration snippets

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use ensemble_core::{AgentDescriptor, Capability, ChatMessage, Result, TaskContext, TaskResult};
use ensemble_validator::extract_code;

use crate::agent::{Agent, AgentCore, LlmCallOptions};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub fn capabilities() -> Vec<Capability> {
    vec![Capability::ApiIntegration]
}

pub fn default_descriptor() -> AgentDescriptor {
    AgentDescriptor::new("integration", capabilities())
}

pub struct IntegrationAgent {
    core: AgentCore,
    client: reqwest::Client,
}

impl IntegrationAgent {
    pub fn new(core: AgentCore) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { core, client }
    }

    /// Probe a configured endpoint so the generated integration code can
    /// reference its observed behavior.
    async fn probe_endpoint(&self, endpoint: &str) -> serde_json::Value {
        info!(agent = "integration", endpoint, "probing endpoint");
        match self.client.get(endpoint).send().await {
            Ok(response) => json!({
                "reachable": true,
                "status": response.status().as_u16(),
            }),
            Err(err) => {
                warn!(agent = "integration", error = %err, "endpoint probe failed");
                json!({
                    "reachable": false,
                    "error": if err.is_timeout() { "request timed out".to_string() } else { err.to_string() },
                })
            }
        }
    }
}

#[async_trait]
impl Agent for IntegrationAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn execute(&self, task: &str, context: TaskContext) -> Result<TaskResult> {
        self.core.run_pipeline(self, task, context).await
    }

    async fn execute_impl(&self, task: &str, context: &TaskContext) -> Result<TaskResult> {
        let endpoint_check = match context.get_str("api_endpoint") {
            Some(endpoint) => Some(self.probe_endpoint(endpoint).await),
            None => None,
        };

        let system_prompt = "You are an integration specialist. You connect systems to \
             external services and APIs.\n\
             Cover: REST and GraphQL integration, authentication, data transformation, \
             error handling with retries, and rate limiting.\n\
             Provide working integration code in a fenced block plus configuration notes.";

        let mut user_prompt = format!("Integration task: {}\n", task);
        if let Some(endpoint) = context.get_str("api_endpoint") {
            user_prompt.push_str(&format!("API endpoint: {}\n", endpoint));
        }
        if let Some(api_type) = context.get_str("api_type") {
            user_prompt.push_str(&format!("API type: {}\n", api_type));
        }
        if let Some(auth) = context.get_str("authentication") {
            user_prompt.push_str(&format!("Authentication: {}\n", auth));
        }
        if let Some(check) = &endpoint_check {
            user_prompt.push_str(&format!("Endpoint probe result: {}\n", check));
        }
        user_prompt.push_str("\nProvide the integration code and configuration.");

        let content = self
            .core
            .llm_respond(
                vec![ChatMessage::system(system_prompt), ChatMessage::user(user_prompt)],
                context,
                LlmCallOptions::enriched(),
            )
            .await?
            .content;

        let mut result = TaskResult::ok()
            .with("agent", json!("integration"))
            .with("task", json!(task))
            .with("report", json!(content.clone()));

        // Surface the snippet separately when the response carries one.
        let snippet = extract_code(&content, None);
        if snippet != content.trim() {
            result.insert("code", json!(snippet));
        }
        if let Some(check) = endpoint_check {
            result.insert("endpoint_check", check);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use ensemble_llm::{LlmGateway, MockProvider};

    fn agent_with(provider: MockProvider) -> IntegrationAgent {
        let gateway = Arc::new(LlmGateway::new());
        gateway.register("mock", Arc::new(provider));
        let mut descriptor = default_descriptor();
        descriptor.reflection.enabled = false;
        IntegrationAgent::new(AgentCore::new(descriptor, gateway))
    }

    #[tokio::test]
    async fn snippet_is_extracted_from_the_report() {
        let response = "Use this client:\n```python\nimport httpx_stub\n\nclient = make()\n```\nConfigure retries.";
        let agent = agent_with(MockProvider::new().with_response(response));

        let result = agent
            .execute("integrate with the billing API", TaskContext::new())
            .await
            .unwrap();
        assert!(result.success());
        assert!(result.get_str("report").unwrap().contains("Configure retries"));
        assert!(result.get_str("code").unwrap().contains("client = make()"));
    }

    #[tokio::test]
    async fn prose_only_responses_have_no_code_field() {
        let agent = agent_with(MockProvider::new().with_response("Just configuration advice."));
        let result = agent
            .execute("describe the auth flow", TaskContext::new())
            .await
            .unwrap();
        assert!(result.get("code").is_none());
    }

    #[tokio::test]
    async fn unreachable_endpoints_are_reported_not_fatal() {
        let agent = agent_with(MockProvider::new().with_response("report"));
        let context = TaskContext::new().with(
            "api_endpoint",
            json!("http://127.0.0.1:1/unreachable"),
        );

        let result = agent.execute("probe the API", context).await.unwrap();
        assert!(result.success());
        let check = result.get("endpoint_check").unwrap();
        assert_eq!(check["reachable"], json!(false));
    }
}
