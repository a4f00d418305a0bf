use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use ensemble_core::{Tool, ToolInfo, ToolResult};

/// Name-indexed tool collection shared by the agents.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        let id = tool.id().to_string();
        debug!(tool = %id, "registered tool");
        self.tools.write().insert(id, tool);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().get(id).cloned()
    }

    pub fn has(&self, id: &str) -> bool {
        self.tools.read().contains_key(id)
    }

    pub fn list(&self) -> Vec<ToolInfo> {
        let mut infos: Vec<ToolInfo> = self.tools.read().values().map(|t| t.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Run a tool by name. A missing tool is an unsuccessful result, not
    /// an error: callers feed this straight into observations.
    pub async fn execute(&self, id: &str, args: Value) -> ToolResult {
        match self.get(id) {
            Some(tool) => tool.execute(args).await,
            None => ToolResult::error(format!("tool not found: {}", id)),
        }
    }
}
