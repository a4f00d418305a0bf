//! Runtime assembly: configuration, orchestration, health

pub mod config;
mod health;
mod orchestrator;
mod runtime;

pub use config::{
    AgentSection, AgentsSection, CacheSection, ContextSection, LlmSection, MemorySection,
    MonitoringSection, OrchestratorSection, ProviderSection, RuntimeConfig, SummarizationSection,
    UpdateOutcome, ValidatorSection, adaptive_defaults, apply_update, deep_merge, load_config,
};
pub use health::{HealthMonitor, HealthSnapshot};
pub use orchestrator::{Orchestrator, fallback_route};
pub use runtime::EnsembleRuntime;

/// Process-wide tracing setup: `RUST_LOG` when set, `info` otherwise.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
