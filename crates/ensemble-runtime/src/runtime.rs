//! The assembled runtime: all subsystems wired, one entrypoint

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::info;

use ensemble_agents::{
    AgentRegistry, CodeWriterAgent, DataAnalysisAgent, IntegrationAgent, MonitoringAgent,
    ReactAgent, ResearchAgent, WorkflowAgent,
};
use ensemble_agents::AgentCore;
use ensemble_context::{
    AssemblerSettings, CacheSettings, ContextAssembler, ContextCache, ContextSummarizer,
    SummarizationStrategy,
};
use ensemble_core::{
    AgentDescriptor, AgentOverrides, Capability, Embedder, Result, TaskContext, TaskResult,
    VectorIndex,
};
use ensemble_llm::LlmGateway;
use ensemble_memory::{LearningSystem, MemorySettings, MemoryStore};
use ensemble_reflection::ReflectionController;
use ensemble_tools::ToolRegistry;
use ensemble_validator::CodeValidator;

use crate::config::{AgentSection, AgentsSection, RuntimeConfig, UpdateOutcome, apply_update};
use crate::health::{HealthMonitor, HealthSnapshot};
use crate::orchestrator::Orchestrator;

pub struct EnsembleRuntime {
    config: RwLock<RuntimeConfig>,
    gateway: Arc<LlmGateway>,
    memory: Option<Arc<MemoryStore>>,
    assembler: Arc<ContextAssembler>,
    registry: Arc<AgentRegistry>,
    orchestrator: Orchestrator,
    monitor: Arc<HealthMonitor>,
}

impl EnsembleRuntime {
    /// Wire every subsystem from the config. The gateway, vector index,
    /// embedder, and tool registry are supplied by the embedder of the
    /// runtime (providers and tools live outside the core). The memory
    /// store reuses the vector index's embedder; a `:memory:` storage
    /// path keeps the store ephemeral.
    pub async fn build(
        config: RuntimeConfig,
        gateway: Arc<LlmGateway>,
        index: Option<Arc<dyn VectorIndex>>,
        embedder: Option<Arc<dyn Embedder>>,
        tools: Arc<ToolRegistry>,
    ) -> Result<Arc<Self>> {
        let memory = if config.memory.enabled {
            let settings = MemorySettings {
                max_memories: config.memory.max_memories,
                similarity_threshold: config.memory.similarity_threshold,
            };
            let store = if config.memory.storage_path == Path::new(":memory:") {
                MemoryStore::open_in_memory(settings, embedder.clone()).await?
            } else {
                MemoryStore::open(&config.memory.storage_path, settings, embedder.clone()).await?
            };
            Some(Arc::new(store))
        } else {
            None
        };
        let learning = memory.as_ref().map(|m| LearningSystem::new(Arc::clone(m)));

        let cache = Arc::new(ContextCache::new(CacheSettings {
            memory_size: config.context.cache.memory_size,
            disk_dir: config.context.cache.disk_cache_dir.clone(),
            ttl_secs: config.context.cache.ttl_secs,
            redis_url: config.context.cache.redis_url.clone(),
        }));
        let strategy = parse_strategy(&config.context.summarization.strategy);
        let summarizer = ContextSummarizer::new(Some(Arc::clone(&gateway)), strategy);
        let assembler = Arc::new(ContextAssembler::new(
            AssemblerSettings {
                max_tokens: config.context.max_tokens,
                query_expansion: config.context.query_expansion,
                multi_query: config.context.multi_query,
                summarization_enabled: config.context.summarization.enabled,
                summarization_threshold: config.context.summarization.threshold,
            },
            index,
            Some(Arc::clone(&gateway)),
            cache,
            summarizer,
        ));

        let validator = Arc::new(
            CodeValidator::new(Some(Arc::clone(&gateway)))
                .with_auto_fix(config.validator.auto_fix)
                .with_max_fix_attempts(config.validator.max_fix_attempts),
        );
        let reflection = Arc::new(ReflectionController::new(
            Arc::clone(&gateway),
            learning.clone(),
        ));

        let registry = AgentRegistry::new(ensemble_mediator::Mediator::new());

        let core_for = |name: &str, capabilities: Vec<Capability>, section: &AgentSection| {
            let mut core = AgentCore::new(
                descriptor_from(name, capabilities, section),
                Arc::clone(&gateway),
            )
            .with_tools(Arc::clone(&tools))
            .with_assembler(Arc::clone(&assembler))
            .with_reflection(Arc::clone(&reflection));
            if let Some(memory) = &memory {
                core = core.with_memory(Arc::clone(memory));
            }
            core
        };

        let agents = &config.agents;
        if agents.code_writer.enabled {
            registry.register(Arc::new(
                CodeWriterAgent::new(
                    core_for(
                        "code_writer",
                        vec![Capability::CodeGeneration, Capability::CodeRefactoring],
                        &agents.code_writer,
                    ),
                    Arc::clone(&validator),
                )
                .with_consistency(agents.code_writer.self_consistency.clone())
                .with_two_stage(agents.code_writer.two_stage.clone()),
            ));
        }
        if agents.react.enabled {
            registry.register(Arc::new(
                ReactAgent::new(core_for(
                    "react",
                    vec![Capability::Reasoning, Capability::ToolUsage],
                    &agents.react,
                ))
                .with_uncertainty(agents.react.uncertainty_search.clone()),
            ));
        }
        if agents.research.enabled {
            registry.register(Arc::new(
                ResearchAgent::new(core_for(
                    "research",
                    vec![Capability::WebSearch, Capability::Research],
                    &agents.research,
                ))
                .with_uncertainty(agents.research.uncertainty_search.clone()),
            ));
        }
        if agents.data_analysis.enabled {
            registry.register(Arc::new(DataAnalysisAgent::new(core_for(
                "data_analysis",
                vec![Capability::DataAnalysis, Capability::MachineLearning],
                &agents.data_analysis,
            ))));
        }
        if agents.workflow.enabled {
            registry.register(Arc::new(WorkflowAgent::new(core_for(
                "workflow",
                vec![Capability::Workflow],
                &agents.workflow,
            ))));
        }
        if agents.integration.enabled {
            registry.register(Arc::new(IntegrationAgent::new(core_for(
                "integration",
                vec![Capability::ApiIntegration],
                &agents.integration,
            ))));
        }
        if agents.monitoring.enabled {
            registry.register(Arc::new(MonitoringAgent::new(core_for(
                "monitoring",
                vec![Capability::Monitoring],
                &agents.monitoring,
            ))));
        }

        let orchestrator = Orchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&gateway),
            &config.orchestrator,
        );

        let monitor = HealthMonitor::new(config.monitoring.clone());
        monitor.start(registry.mediator());

        info!(agents = registry.len(), "runtime assembled");
        Ok(Arc::new(Self {
            config: RwLock::new(config),
            gateway,
            memory,
            assembler,
            registry,
            orchestrator,
            monitor,
        }))
    }

    pub async fn execute_task(
        &self,
        task: &str,
        agent: Option<&str>,
        context: TaskContext,
    ) -> Result<TaskResult> {
        self.orchestrator.execute_task(task, agent, context).await
    }

    pub fn list_agents(&self) -> Vec<String> {
        self.registry.list()
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn memory(&self) -> Option<&Arc<MemoryStore>> {
        self.memory.as_ref()
    }

    pub fn gateway(&self) -> &Arc<LlmGateway> {
        &self.gateway
    }

    pub fn config(&self) -> RuntimeConfig {
        self.config.read().clone()
    }

    pub fn health(&self) -> Option<HealthSnapshot> {
        self.monitor.latest()
    }

    pub fn sample_health(&self) -> HealthSnapshot {
        self.monitor.sample(&self.registry.mediator())
    }

    /// Hot-reload: deep-merge the update, apply what each subsystem can
    /// change live, and report the rest as warnings. The context cache
    /// is intentionally not invalidated: cached contexts are keyed by
    /// stable user queries.
    pub async fn update_config(&self, update: &Value) -> Result<UpdateOutcome> {
        let current = self.config.read().clone();
        let (new_config, mut outcome) = apply_update(&current, update)?;

        if let Some(memory) = &self.memory {
            memory.update_settings(MemorySettings {
                max_memories: new_config.memory.max_memories,
                similarity_threshold: new_config.memory.similarity_threshold,
            });
        }

        self.assembler.update_settings(AssemblerSettings {
            max_tokens: new_config.context.max_tokens,
            query_expansion: new_config.context.query_expansion,
            multi_query: new_config.context.multi_query,
            summarization_enabled: new_config.context.summarization.enabled,
            summarization_threshold: new_config.context.summarization.threshold,
        });

        let overrides = agent_overrides(&new_config.agents);
        let (_applied, agent_warnings) = self.registry.update_config(&overrides);
        outcome.warnings.extend(agent_warnings);

        // Pipeline stages are wired at construction.
        if new_config.agents.code_writer.self_consistency
            != current.agents.code_writer.self_consistency
        {
            outcome
                .warnings
                .push("agents.code_writer.self_consistency: requires restart to take effect".into());
        }
        if new_config.agents.code_writer.two_stage != current.agents.code_writer.two_stage {
            outcome
                .warnings
                .push("agents.code_writer.two_stage: requires restart to take effect".into());
        }
        for name in ["react", "research"] {
            let (new_section, old_section) = match (
                new_config.agents.get(name),
                current.agents.get(name),
            ) {
                (Some(new_section), Some(old_section)) => (new_section, old_section),
                _ => continue,
            };
            if new_section.uncertainty_search != old_section.uncertainty_search {
                outcome.warnings.push(format!(
                    "agents.{}.uncertainty_search: requires restart to take effect",
                    name
                ));
            }
        }

        if new_config.orchestrator.max_parallel_tasks
            != current.orchestrator.max_parallel_tasks
        {
            outcome
                .warnings
                .push("orchestrator.max_parallel_tasks: requires restart to take effect".into());
        }

        *self.config.write() = new_config;
        info!(
            changes = outcome.applied_changes.len(),
            warnings = outcome.warnings.len(),
            "configuration updated"
        );
        Ok(outcome)
    }

    pub async fn shutdown(&self) {
        self.monitor.stop().await;
        self.registry.shutdown().await;
        info!("runtime shut down");
    }
}

fn descriptor_from(
    name: &str,
    capabilities: Vec<Capability>,
    section: &AgentSection,
) -> AgentDescriptor {
    let mut descriptor = AgentDescriptor::new(name, capabilities)
        .with_temperature(section.temperature)
        .with_max_iterations(section.max_iterations)
        .with_thinking_mode(section.thinking_mode)
        .with_reflection(section.reflection.clone());
    descriptor.default_model = section.default_model.clone();
    descriptor.enabled = section.enabled;
    descriptor
}

fn agent_overrides(agents: &AgentsSection) -> HashMap<String, AgentOverrides> {
    AgentsSection::names()
        .iter()
        .filter_map(|name| {
            agents.get(name).map(|section| {
                (
                    name.to_string(),
                    AgentOverrides {
                        temperature: Some(section.temperature),
                        max_iterations: Some(section.max_iterations),
                        thinking_mode: Some(section.thinking_mode),
                        reflection: Some(section.reflection.clone()),
                        default_model: section.default_model.clone(),
                    },
                )
            })
        })
        .collect()
}

fn parse_strategy(raw: &str) -> SummarizationStrategy {
    match raw {
        "hierarchical" => SummarizationStrategy::Hierarchical,
        "extractive" => SummarizationStrategy::Extractive,
        "abstractive" => SummarizationStrategy::Abstractive,
        "structure_preserving" => SummarizationStrategy::StructurePreserving,
        _ => SummarizationStrategy::Hybrid,
    }
}
