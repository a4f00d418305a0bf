//! Agent directory: how the mediator reaches agents
//!
//! The mediator refers to agents by name through this trait; the registry
//! implements it. There are no owning back-references: the registry owns
//! the agents and the mediator, the mediator holds a weak handle to the
//! directory.

use async_trait::async_trait;
use serde_json::Value;

use crate::capability::Capability;
use crate::error::Result;
use crate::result::{TaskContext, TaskResult};

#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// Names of the live agents, in registration order.
    fn agent_names(&self) -> Vec<String>;

    fn has_agent(&self, name: &str) -> bool;

    /// First live agent offering `capability` and not in `exclude`.
    /// Deterministic for a fixed registry state.
    fn find_for_capability(&self, capability: Capability, exclude: &[&str]) -> Option<String>;

    /// Run a task on the named agent.
    async fn execute(&self, agent: &str, task: &str, context: TaskContext) -> Result<TaskResult>;

    /// Deliver a broadcast payload to the named agent's handler.
    async fn deliver_broadcast(&self, agent: &str, content: &Value) -> Result<TaskResult>;
}
