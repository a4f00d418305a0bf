//! Monitoring agent: resource sampling with a bounded history

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sysinfo::System;
use tracing::info;

use ensemble_core::{AgentDescriptor, Capability, ChatMessage, Result, TaskContext, TaskResult};

use crate::agent::{Agent, AgentCore, LlmCallOptions};

const HISTORY_LIMIT: usize = 100;

pub fn capabilities() -> Vec<Capability> {
    vec![Capability::Monitoring]
}

pub fn default_descriptor() -> AgentDescriptor {
    AgentDescriptor::new("monitoring", capabilities())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_usage_percent: f32,
    pub total_memory_bytes: u64,
    pub used_memory_bytes: u64,
    pub process_count: usize,
    pub own_memory_bytes: Option<u64>,
}

pub struct MonitoringAgent {
    core: AgentCore,
    system: Mutex<System>,
    history: Mutex<VecDeque<ResourceSample>>,
}

impl MonitoringAgent {
    pub fn new(core: AgentCore) -> Self {
        Self {
            core,
            system: Mutex::new(System::new_all()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn sample(&self) -> ResourceSample {
        let mut system = self.system.lock();
        system.refresh_all();

        let own_memory_bytes = sysinfo::get_current_pid()
            .ok()
            .and_then(|pid| system.process(pid))
            .map(|process| process.memory());

        let sample = ResourceSample {
            timestamp: Utc::now(),
            cpu_usage_percent: system.global_cpu_info().cpu_usage(),
            total_memory_bytes: system.total_memory(),
            used_memory_bytes: system.used_memory(),
            process_count: system.processes().len(),
            own_memory_bytes,
        };

        let mut history = self.history.lock();
        history.push_back(sample.clone());
        while history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
        sample
    }

    pub fn history(&self) -> Vec<ResourceSample> {
        self.history.lock().iter().cloned().collect()
    }
}

#[async_trait]
impl Agent for MonitoringAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn execute(&self, task: &str, context: TaskContext) -> Result<TaskResult> {
        self.core.run_pipeline(self, task, context).await
    }

    async fn execute_impl(&self, task: &str, context: &TaskContext) -> Result<TaskResult> {
        let sample = self.sample();
        info!(
            agent = "monitoring",
            cpu = sample.cpu_usage_percent,
            used_memory = sample.used_memory_bytes,
            "collected resource sample"
        );

        let system_prompt = "You are a monitoring and observability expert. You analyze \
             metrics, spot trends and anomalies, and recommend actions.\n\
             Cover: performance monitoring, alerting thresholds, trend analysis, \
             and resource usage.";

        let mut user_prompt = format!("Monitoring task: {}\n\nCurrent metrics:\n", task);
        user_prompt.push_str(&format!(
            "- cpu: {:.1}%\n- memory: {} / {} bytes\n- processes: {}\n",
            sample.cpu_usage_percent,
            sample.used_memory_bytes,
            sample.total_memory_bytes,
            sample.process_count
        ));
        if let Some(metrics) = context.get("metrics") {
            user_prompt.push_str(&format!("Watched metrics: {}\n", metrics));
        }
        if let Some(thresholds) = context.get("thresholds") {
            user_prompt.push_str(&format!("Thresholds: {}\n", thresholds));
        }
        user_prompt.push_str("\nProvide monitoring analysis and recommendations.");

        let analysis = self
            .core
            .llm_respond(
                vec![ChatMessage::system(system_prompt), ChatMessage::user(user_prompt)],
                context,
                LlmCallOptions::enriched(),
            )
            .await?
            .content;

        Ok(TaskResult::ok()
            .with("agent", json!("monitoring"))
            .with("task", json!(task))
            .with("analysis", json!(analysis))
            .with("metrics", serde_json::to_value(&sample)?)
            .with("history_len", json!(self.history.lock().len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use ensemble_llm::{LlmGateway, MockProvider};

    fn agent() -> MonitoringAgent {
        let gateway = Arc::new(LlmGateway::new());
        gateway.register("mock", Arc::new(MockProvider::new().with_response("all healthy")));
        let mut descriptor = default_descriptor();
        descriptor.reflection.enabled = false;
        MonitoringAgent::new(AgentCore::new(descriptor, gateway))
    }

    #[tokio::test]
    async fn samples_accumulate_in_bounded_history() {
        let agent = agent();
        for _ in 0..3 {
            agent.sample();
        }
        assert_eq!(agent.history().len(), 3);

        for _ in 0..(HISTORY_LIMIT + 10) {
            agent.sample();
        }
        assert_eq!(agent.history().len(), HISTORY_LIMIT);
    }

    #[tokio::test]
    async fn execution_reports_metrics_and_analysis() {
        let agent = agent();
        let result = agent
            .execute("check system health", TaskContext::new())
            .await
            .unwrap();
        assert!(result.success());
        assert_eq!(result.get_str("analysis"), Some("all healthy"));
        let metrics = result.get("metrics").unwrap();
        assert!(metrics["total_memory_bytes"].as_u64().unwrap() > 0);
    }
}
