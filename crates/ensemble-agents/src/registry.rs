//! Agent registry: lifecycle, capability index, mediator wiring

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{info, warn};

use ensemble_core::{
    AgentDirectory, AgentOverrides, Capability, EnsembleError, Result, TaskContext, TaskResult,
};
use ensemble_mediator::Mediator;

use crate::agent::Agent;

/// Owns the agents and the mediator. The mediator reaches back through
/// a weak directory handle, so there is no ownership cycle.
pub struct AgentRegistry {
    agents: RwLock<Vec<Arc<dyn Agent>>>,
    capability_index: RwLock<HashMap<Capability, Vec<String>>>,
    mediator: Arc<Mediator>,
}

impl AgentRegistry {
    pub fn new(mediator: Arc<Mediator>) -> Arc<Self> {
        let registry = Arc::new(Self {
            agents: RwLock::new(Vec::new()),
            capability_index: RwLock::new(HashMap::new()),
            mediator,
        });
        registry.wire();
        registry
    }

    fn wire(self: &Arc<Self>) {
        let directory: Arc<dyn AgentDirectory> = Arc::clone(self) as Arc<dyn AgentDirectory>;
        self.mediator.set_directory(Arc::downgrade(&directory));
    }

    pub fn mediator(&self) -> Arc<Mediator> {
        Arc::clone(&self.mediator)
    }

    /// Add an agent: wires the mediator into it and rebuilds the
    /// capability index.
    pub fn register(&self, agent: Arc<dyn Agent>) {
        agent.core().set_mediator(Arc::clone(&self.mediator));
        info!(agent = agent.name(), "registered agent");
        self.agents.write().push(agent);
        self.rebuild_capability_index();
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.read().iter().find(|a| a.name() == name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        self.agents.read().iter().map(|a| a.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Hot-swap safe per-agent fields. Returns the applied changes and
    /// the warnings for entries that could not be applied.
    pub fn update_config(
        &self,
        overrides: &HashMap<String, AgentOverrides>,
    ) -> (Vec<String>, Vec<String>) {
        let mut applied = Vec::new();
        let mut warnings = Vec::new();

        for (name, agent_overrides) in overrides {
            match self.get(name) {
                Some(agent) => {
                    for field in agent.apply_overrides(agent_overrides) {
                        applied.push(format!("agents.{}.{}", name, field));
                    }
                }
                None => warnings.push(format!("unknown agent in config update: {}", name)),
            }
        }

        // The index is a pure function of the descriptor set; any change
        // rebuilds it.
        self.rebuild_capability_index();
        (applied, warnings)
    }

    fn rebuild_capability_index(&self) {
        let mut index: HashMap<Capability, Vec<String>> = HashMap::new();
        for agent in self.agents.read().iter() {
            for capability in agent.capabilities() {
                index
                    .entry(capability)
                    .or_default()
                    .push(agent.name().to_string());
            }
        }
        *self.capability_index.write() = index;
    }

    /// Cancel the bus first, then stop each agent.
    pub async fn shutdown(&self) {
        self.mediator.shutdown();
        let agents: Vec<Arc<dyn Agent>> = self.agents.read().clone();
        for agent in agents {
            agent.shutdown().await;
        }
        info!("agent registry shut down");
    }
}

#[async_trait]
impl AgentDirectory for AgentRegistry {
    fn agent_names(&self) -> Vec<String> {
        self.list()
    }

    fn has_agent(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    fn find_for_capability(&self, capability: Capability, exclude: &[&str]) -> Option<String> {
        let index = self.capability_index.read();
        index
            .get(&capability)?
            .iter()
            .find(|name| !exclude.contains(&name.as_str()))
            .cloned()
    }

    async fn execute(&self, agent: &str, task: &str, context: TaskContext) -> Result<TaskResult> {
        let agent = self
            .get(agent)
            .ok_or_else(|| EnsembleError::Agent(format!("agent {} not found", agent)))?;
        agent.execute(task, context).await
    }

    async fn deliver_broadcast(&self, agent: &str, content: &Value) -> Result<TaskResult> {
        let agent = self
            .get(agent)
            .ok_or_else(|| EnsembleError::Agent(format!("agent {} not found", agent)))?;
        Ok(agent.on_broadcast(content).await)
    }
}
