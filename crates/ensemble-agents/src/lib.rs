//! Agent variants over a shared execution pipeline

mod agent;
mod code_writer;
mod consistency;
mod data_analysis;
mod integration;
mod monitoring;
mod react;
mod registry;
mod research;
mod two_stage;
mod uncertainty;
mod workflow;

pub use agent::{Agent, AgentCore, LlmCallOptions};
pub use code_writer::CodeWriterAgent;
pub use consistency::{ConsensusOutcome, SelfConsistency, SelfConsistencyConfig};
pub use data_analysis::DataAnalysisAgent;
pub use integration::IntegrationAgent;
pub use monitoring::MonitoringAgent;
pub use react::ReactAgent;
pub use registry::AgentRegistry;
pub use research::ResearchAgent;
pub use two_stage::{TwoStageConfig, TwoStageOutcome, TwoStageProcessor};
pub use uncertainty::{EnhancementOutcome, UncertaintySearch, UncertaintySearchConfig};
pub use workflow::WorkflowAgent;

pub use ensemble_core::{AgentDescriptor, AgentOverrides, Capability, TaskContext, TaskResult};
