//! Configuration: YAML loading, deep-merge, adaptive defaults, hot updates

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use ensemble_agents::{SelfConsistencyConfig, TwoStageConfig, UncertaintySearchConfig};
use ensemble_core::{EnsembleError, ReflectionSettings, Result};

/// Default search locations, first hit wins.
pub const CONFIG_LOCATIONS: [&str; 2] = ["backend/config/config.yaml", "config/config.yaml"];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub memory: MemorySection,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub agents: AgentsSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub validator: ValidatorSection,
    #[serde(default)]
    pub monitoring: MonitoringSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmSection {
    #[serde(default)]
    pub providers: HashMap<String, ProviderSection>,
    #[serde(default)]
    pub default_provider: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSection {
    pub provider_type: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySection {
    #[serde(default = "default_memory_path")]
    pub storage_path: PathBuf,
    #[serde(default = "default_max_memories")]
    pub max_memories: i64,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            storage_path: default_memory_path(),
            max_memories: default_max_memories(),
            similarity_threshold: default_similarity_threshold(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSection {
    #[serde(default = "default_context_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_true")]
    pub query_expansion: bool,
    #[serde(default = "default_true")]
    pub multi_query: bool,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub summarization: SummarizationSection,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            max_tokens: default_context_tokens(),
            query_expansion: true,
            multi_query: true,
            cache: CacheSection::default(),
            summarization: SummarizationSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_cache_entries")]
    pub memory_size: usize,
    #[serde(default = "default_cache_dir")]
    pub disk_cache_dir: PathBuf,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    #[serde(default)]
    pub redis_url: Option<String>,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            memory_size: default_cache_entries(),
            disk_cache_dir: default_cache_dir(),
            ttl_secs: default_cache_ttl(),
            redis_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizationSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_summarization_threshold")]
    pub threshold: usize,
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

impl Default for SummarizationSection {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_summarization_threshold(),
            strategy: default_strategy(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub thinking_mode: bool,
    #[serde(default)]
    pub reflection: ReflectionSettings,
    /// Consulted by the code writer; off by default.
    #[serde(default)]
    pub self_consistency: SelfConsistencyConfig,
    /// Consulted by the code writer; off by default.
    #[serde(default)]
    pub two_stage: TwoStageConfig,
    /// Consulted by the react and research agents.
    #[serde(default)]
    pub uncertainty_search: UncertaintySearchConfig,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            enabled: true,
            default_model: None,
            temperature: default_temperature(),
            max_iterations: default_max_iterations(),
            thinking_mode: false,
            reflection: ReflectionSettings::default(),
            self_consistency: SelfConsistencyConfig::default(),
            two_stage: TwoStageConfig::default(),
            uncertainty_search: UncertaintySearchConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentsSection {
    #[serde(default)]
    pub code_writer: AgentSection,
    #[serde(default)]
    pub react: AgentSection,
    #[serde(default)]
    pub research: AgentSection,
    #[serde(default)]
    pub data_analysis: AgentSection,
    #[serde(default)]
    pub workflow: AgentSection,
    #[serde(default)]
    pub integration: AgentSection,
    #[serde(default)]
    pub monitoring: AgentSection,
}

impl AgentsSection {
    pub fn get(&self, name: &str) -> Option<&AgentSection> {
        match name {
            "code_writer" => Some(&self.code_writer),
            "react" => Some(&self.react),
            "research" => Some(&self.research),
            "data_analysis" => Some(&self.data_analysis),
            "workflow" => Some(&self.workflow),
            "integration" => Some(&self.integration),
            "monitoring" => Some(&self.monitoring),
            _ => None,
        }
    }

    pub fn names() -> [&'static str; 7] {
        [
            "code_writer",
            "react",
            "research",
            "data_analysis",
            "workflow",
            "integration",
            "monitoring",
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_max_parallel")]
    pub max_parallel_tasks: usize,
    #[serde(default = "default_true")]
    pub classifier_enabled: bool,
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_parallel_tasks: default_max_parallel(),
            classifier_enabled: true,
            task_timeout_secs: default_task_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorSection {
    #[serde(default = "default_true")]
    pub auto_fix: bool,
    #[serde(default = "default_fix_attempts")]
    pub max_fix_attempts: u32,
}

impl Default for ValidatorSection {
    fn default() -> Self {
        Self {
            auto_fix: true,
            max_fix_attempts: default_fix_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringSection {
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_monitor_path")]
    pub state_path: PathBuf,
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold_percent: f32,
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold_percent: f32,
}

impl Default for MonitoringSection {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval(),
            state_path: default_monitor_path(),
            cpu_threshold_percent: default_cpu_threshold(),
            memory_threshold_percent: default_memory_threshold(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_memory_path() -> PathBuf {
    PathBuf::from("memory/memories.db")
}
fn default_max_memories() -> i64 {
    1000
}
fn default_similarity_threshold() -> f32 {
    0.3
}
fn default_context_tokens() -> usize {
    4000
}
fn default_cache_entries() -> usize {
    1000
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache/context")
}
fn default_cache_ttl() -> u64 {
    3600
}
fn default_summarization_threshold() -> usize {
    8000
}
fn default_strategy() -> String {
    "hybrid".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_iterations() -> u32 {
    10
}
fn default_max_parallel() -> usize {
    5
}
fn default_task_timeout() -> u64 {
    300
}
fn default_fix_attempts() -> u32 {
    2
}
fn default_monitor_interval() -> u64 {
    30
}
fn default_monitor_path() -> PathBuf {
    PathBuf::from("LOGS_DEBUG/monitor_state.json")
}
fn default_cpu_threshold() -> f32 {
    90.0
}
fn default_memory_threshold() -> f32 {
    90.0
}

/// Recursive merge of `update` into `base`. Maps merge key-wise, lists
/// replace (never merge), and `null` values are skipped so an update
/// cannot erase a field by omission.
pub fn deep_merge(base: &mut Value, update: &Value) {
    match (base, update) {
        (Value::Object(base_map), Value::Object(update_map)) => {
            for (key, update_value) in update_map {
                if update_value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(base_value) if base_value.is_object() && update_value.is_object() => {
                        deep_merge(base_value, update_value);
                    }
                    _ => {
                        base_map.insert(key.clone(), update_value.clone());
                    }
                }
            }
        }
        (base, update) => {
            if !update.is_null() {
                *base = update.clone();
            }
        }
    }
}

/// Defaults tuned to the host: parallelism from the core count, cache
/// size from total memory.
pub fn adaptive_defaults() -> Value {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);

    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let total_gb = system.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);

    let max_parallel = (cores / 2).clamp(2, 8);
    let cache_entries = if total_gb >= 16.0 {
        2000
    } else if total_gb >= 8.0 {
        1000
    } else {
        500
    };

    debug!(cores, total_gb, "derived adaptive defaults");
    serde_json::json!({
        "orchestrator": { "max_parallel_tasks": max_parallel },
        "context": { "cache": { "memory_size": cache_entries } },
    })
}

/// Load the config: adaptive defaults, the YAML file when present,
/// `<PROVIDER>_API_KEY` environment injection, in that order.
pub fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    let mut merged = serde_json::to_value(RuntimeConfig::default())?;
    deep_merge(&mut merged, &adaptive_defaults());

    let file = match path {
        Some(path) => Some(path.to_path_buf()),
        None => CONFIG_LOCATIONS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists()),
    };

    if let Some(file) = file {
        let raw = std::fs::read_to_string(&file)?;
        let parsed: Value = serde_yaml::from_str(&raw)
            .map_err(|e| EnsembleError::Config(format!("invalid YAML in {:?}: {}", file, e)))?;
        deep_merge(&mut merged, &parsed);
        info!(path = ?file, "loaded configuration file");
    }

    inject_api_keys(&mut merged);

    serde_json::from_value(merged)
        .map_err(|e| EnsembleError::Config(format!("invalid configuration: {}", e)))
}

fn inject_api_keys(config: &mut Value) {
    let Some(providers) = config
        .get_mut("llm")
        .and_then(|l| l.get_mut("providers"))
        .and_then(Value::as_object_mut)
    else {
        return;
    };

    for provider in providers.values_mut() {
        let Some(provider_type) = provider.get("provider_type").and_then(Value::as_str) else {
            continue;
        };
        let has_key = provider
            .get("api_key")
            .and_then(Value::as_str)
            .is_some_and(|k| !k.is_empty());
        if has_key {
            continue;
        }
        let env_var = format!("{}_API_KEY", provider_type.to_uppercase());
        if let Ok(key) = std::env::var(&env_var) {
            if let Some(map) = provider.as_object_mut() {
                map.insert("api_key".into(), Value::String(key));
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpdateOutcome {
    pub success: bool,
    pub applied_changes: Vec<String>,
    pub warnings: Vec<String>,
}

/// Apply a hot config update. `api_key` values are stripped before the
/// result is considered for persistence; sections that cannot change
/// without a restart produce warnings instead of applying.
pub fn apply_update(config: &RuntimeConfig, update: &Value) -> Result<(RuntimeConfig, UpdateOutcome)> {
    let mut sanitized = update.clone();
    strip_api_keys(&mut sanitized);

    let before = serde_json::to_value(config)?;
    let mut merged = before.clone();
    deep_merge(&mut merged, &sanitized);

    let mut applied_changes = Vec::new();
    diff_paths(&before, &merged, "", &mut applied_changes);

    let mut warnings = Vec::new();
    for change in &applied_changes {
        if change.starts_with("llm.providers") {
            warnings.push(format!("{}: provider changes apply to new requests only", change));
        }
        if change == "memory.storage_path" {
            warnings.push("memory.storage_path: requires restart to take effect".to_string());
        }
    }

    let new_config: RuntimeConfig = serde_json::from_value(merged)
        .map_err(|e| EnsembleError::Config(format!("invalid configuration update: {}", e)))?;

    Ok((
        new_config,
        UpdateOutcome {
            success: true,
            applied_changes,
            warnings,
        },
    ))
}

fn strip_api_keys(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove("api_key");
            for nested in map.values_mut() {
                strip_api_keys(nested);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_api_keys(item);
            }
        }
        _ => {}
    }
}

fn diff_paths(before: &Value, after: &Value, prefix: &str, out: &mut Vec<String>) {
    match (before, after) {
        (Value::Object(before_map), Value::Object(after_map)) => {
            for (key, after_value) in after_map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                match before_map.get(key) {
                    Some(before_value) => diff_paths(before_value, after_value, &path, out),
                    None => out.push(path),
                }
            }
        }
        (before, after) => {
            if before != after {
                out.push(prefix.to_string());
            }
        }
    }
}
