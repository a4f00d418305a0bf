//! Ensemble: an LLM-agent orchestration runtime

pub mod core {
    pub use ensemble_core::{
        AgentDescriptor, AgentDirectory, AgentOverrides, BusMessage, Capability, ChatMessage,
        CodeEntity, CodeEntityKind, DelegationResult, Embedder, EnsembleError, FinishReason,
        GenerationConfig, HashingEmbedder, LlmChunk, LlmError, LlmProvider, LlmResponse,
        MessageKind, MessagePriority, ReflectionSettings, Result, Role, TaskContext, TaskResult,
        TaskType, TokenUsage, VectorHit, VectorIndex, cosine_similarity,
    };
}

pub mod llm {
    pub use ensemble_llm::{
        GenerateRequest, LlmGateway, MockProvider, ProviderType, RetryPolicy, UnifiedProvider,
    };
}

pub mod memory {
    pub use ensemble_memory::{
        AgentInsights, AgentQuality, FailedTaskRecord, LearningStats, LearningSystem, MemoryHit,
        MemoryRecord, MemorySettings, MemoryStore, ModelRecommendation,
    };
}

pub mod context {
    pub use ensemble_context::{
        AssemblerSettings, CacheSettings, CacheStats, ContextAssembler, ContextCache,
        ContextSummarizer, HistoryEntry, InMemoryVectorIndex, SummarizationStrategy, fingerprint,
    };
}

pub mod validator {
    pub use ensemble_validator::{
        CodeIssue, CodeValidator, IssueSeverity, ValidationResult, detect_language, extract_code,
        wrap_in_fence,
    };
}

pub mod reflection {
    pub use ensemble_reflection::{
        QualityLevel, ReflectionController, ReflectionScore, Reflective,
    };
}

pub mod mediator {
    pub use ensemble_mediator::{AgentStats, Mediator, MediatorEvent, SubscriptionId};
}

pub mod tools {
    pub use ensemble_tools::{HttpTool, Tool, ToolInfo, ToolRegistry, ToolResult, generate_schema};
}

pub mod agents {
    pub use ensemble_agents::{
        Agent, AgentCore, AgentRegistry, CodeWriterAgent, ConsensusOutcome, DataAnalysisAgent,
        EnhancementOutcome, IntegrationAgent, LlmCallOptions, MonitoringAgent, ReactAgent,
        ResearchAgent, SelfConsistency, SelfConsistencyConfig, TwoStageConfig, TwoStageProcessor,
        UncertaintySearch, UncertaintySearchConfig, WorkflowAgent,
    };
}

pub mod runtime {
    pub use ensemble_runtime::{
        EnsembleRuntime, HealthMonitor, HealthSnapshot, Orchestrator, RuntimeConfig,
        UpdateOutcome, adaptive_defaults, apply_update, deep_merge, init_tracing, load_config,
    };
}

pub use ensemble_core::{EnsembleError, Result};
pub use ensemble_runtime::EnsembleRuntime;
