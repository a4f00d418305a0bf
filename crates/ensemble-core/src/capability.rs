//! Static capability tags advertised by agents and used for routing

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    CodeGeneration,
    CodeRefactoring,
    DataAnalysis,
    MachineLearning,
    WebSearch,
    Research,
    Reasoning,
    ToolUsage,
    Workflow,
    ApiIntegration,
    Monitoring,
    Testing,
    Verification,
}

impl Capability {
    pub const ALL: [Capability; 13] = [
        Capability::CodeGeneration,
        Capability::CodeRefactoring,
        Capability::DataAnalysis,
        Capability::MachineLearning,
        Capability::WebSearch,
        Capability::Research,
        Capability::Reasoning,
        Capability::ToolUsage,
        Capability::Workflow,
        Capability::ApiIntegration,
        Capability::Monitoring,
        Capability::Testing,
        Capability::Verification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::CodeGeneration => "code_generation",
            Capability::CodeRefactoring => "code_refactoring",
            Capability::DataAnalysis => "data_analysis",
            Capability::MachineLearning => "machine_learning",
            Capability::WebSearch => "web_search",
            Capability::Research => "research",
            Capability::Reasoning => "reasoning",
            Capability::ToolUsage => "tool_usage",
            Capability::Workflow => "workflow",
            Capability::ApiIntegration => "api_integration",
            Capability::Monitoring => "monitoring",
            Capability::Testing => "testing",
            Capability::Verification => "verification",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Capability::ALL
            .iter()
            .find(|c| c.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown capability: {}", s))
    }
}

/// Task type used for per-model performance tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Code,
    Chat,
    Analysis,
    Reasoning,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Code => "code",
            TaskType::Chat => "chat",
            TaskType::Analysis => "analysis",
            TaskType::Reasoning => "reasoning",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "code" => Ok(TaskType::Code),
            "chat" => Ok(TaskType::Chat),
            "analysis" => Ok(TaskType::Analysis),
            "reasoning" => Ok(TaskType::Reasoning),
            other => Err(format!("unknown task type: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_round_trips_through_str() {
        for cap in Capability::ALL {
            assert_eq!(cap.as_str().parse::<Capability>().unwrap(), cap);
        }
        assert!("teleportation".parse::<Capability>().is_err());
    }

    #[test]
    fn capability_serde_uses_snake_case() {
        let json = serde_json::to_string(&Capability::CodeGeneration).unwrap();
        assert_eq!(json, "\"code_generation\"");
    }

    #[test]
    fn task_type_round_trips() {
        for t in [TaskType::Code, TaskType::Chat, TaskType::Analysis, TaskType::Reasoning] {
            assert_eq!(t.as_str().parse::<TaskType>().unwrap(), t);
        }
    }
}
