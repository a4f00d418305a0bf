//! The agent contract and the shared execution pipeline
//!
//! Every variant wraps its `execute_impl` with the same pipeline:
//! recommended-model lookup, the reflection loop, memory writes, and
//! `_execution_time` stamping. The pipeline lives on `AgentCore`; the
//! variants own a core and add their capability-specific routine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::RwLock;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use ensemble_core::message::with_system_preamble;
use ensemble_core::{
    AgentDescriptor, AgentOverrides, Capability, ChatMessage, DelegationResult, EnsembleError,
    GenerationConfig, LlmResponse, MessagePriority, Result, Role, TaskContext, TaskResult,
    TaskType,
};
use ensemble_llm::{GenerateRequest, LlmGateway};
use ensemble_mediator::Mediator;
use ensemble_memory::MemoryStore;
use ensemble_reflection::{Reflective, ReflectionController};
use ensemble_tools::ToolRegistry;

const MIN_SOLUTION_CHARS: usize = 50;
const TASK_SLICE: usize = 500;
const SOLUTION_SLICE: usize = 2000;

#[async_trait]
pub trait Agent: Send + Sync {
    fn core(&self) -> &AgentCore;

    /// The variant's inner routine, invoked by the pipeline and by the
    /// reflection controller's corrections.
    async fn execute_impl(&self, task: &str, context: &TaskContext) -> Result<TaskResult>;

    /// The public entrypoint. Implementations forward to
    /// `AgentCore::run_pipeline`.
    async fn execute(&self, task: &str, context: TaskContext) -> Result<TaskResult>;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn capabilities(&self) -> Vec<Capability> {
        self.core().descriptor().capabilities
    }

    fn descriptor(&self) -> AgentDescriptor {
        self.core().descriptor()
    }

    fn apply_overrides(&self, overrides: &AgentOverrides) -> Vec<&'static str> {
        self.core().apply_overrides(overrides)
    }

    fn streaming_system_prompt(&self) -> String {
        format!(
            "You are {}, an AI assistant. Respond to the user's request clearly and helpfully.",
            self.name()
        )
    }

    /// Stream the response for a task. Finite, not restartable. Falls
    /// back to a single chunk of the non-streaming result when the
    /// provider cannot stream.
    async fn execute_stream(
        &self,
        task: &str,
        context: TaskContext,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let core = self.core();
        let descriptor = core.descriptor();
        let messages = vec![
            ChatMessage::system(self.streaming_system_prompt()),
            ChatMessage::user(task),
        ];
        let mut config = GenerationConfig::default().with_temperature(descriptor.temperature);
        config.model = core.resolve_model(&context);

        match core
            .gateway
            .stream(GenerateRequest::new(messages).with_config(config))
            .await
        {
            Ok(chunks) => Ok(chunks
                .filter_map(|chunk| async move {
                    match chunk {
                        Ok(c) if c.delta.is_empty() && c.done => None,
                        Ok(c) => Some(Ok(c.delta)),
                        Err(e) => Some(Err(EnsembleError::Provider(e))),
                    }
                })
                .boxed()),
            Err(err) => {
                warn!(agent = %self.name(), error = %err, "streaming failed, falling back");
                let result = self.execute(task, context).await?;
                let text = result.solution_text().unwrap_or_default();
                Ok(futures::stream::iter(vec![Ok(text)]).boxed())
            }
        }
    }

    /// Handle a broadcast payload. The default acknowledges.
    async fn on_broadcast(&self, _content: &Value) -> TaskResult {
        TaskResult::ok()
            .with("agent", json!(self.name()))
            .with("acknowledged", json!(true))
    }

    async fn shutdown(&self) {}
}

/// Options for one enriched LLM call.
#[derive(Debug, Clone, Default)]
pub struct LlmCallOptions {
    pub provider: Option<String>,
    pub use_thinking: Option<bool>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub include_few_shot: bool,
    pub include_personalization: bool,
    pub include_error_warnings: bool,
}

impl LlmCallOptions {
    pub fn enriched() -> Self {
        Self {
            include_few_shot: true,
            include_personalization: true,
            include_error_warnings: true,
            ..Default::default()
        }
    }

    pub fn plain() -> Self {
        Self::default()
    }

    pub fn with_thinking(mut self, thinking: bool) -> Self {
        self.use_thinking = Some(thinking);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Wiring and hot-reloadable settings shared by every variant.
pub struct AgentCore {
    name: String,
    descriptor: RwLock<AgentDescriptor>,
    pub(crate) gateway: Arc<LlmGateway>,
    tools: Option<Arc<ToolRegistry>>,
    assembler: Option<Arc<ensemble_context::ContextAssembler>>,
    memory: Option<Arc<MemoryStore>>,
    reflection: Option<Arc<ReflectionController>>,
    mediator: RwLock<Option<Arc<Mediator>>>,
}

impl AgentCore {
    pub fn new(descriptor: AgentDescriptor, gateway: Arc<LlmGateway>) -> Self {
        Self {
            name: descriptor.name.clone(),
            descriptor: RwLock::new(descriptor),
            gateway,
            tools: None,
            assembler: None,
            memory: None,
            reflection: None,
            mediator: RwLock::new(None),
        }
    }

    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_assembler(mut self, assembler: Arc<ensemble_context::ContextAssembler>) -> Self {
        self.assembler = Some(assembler);
        self
    }

    pub fn with_memory(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_reflection(mut self, reflection: Arc<ReflectionController>) -> Self {
        self.reflection = Some(reflection);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> AgentDescriptor {
        self.descriptor.read().clone()
    }

    pub fn apply_overrides(&self, overrides: &AgentOverrides) -> Vec<&'static str> {
        self.descriptor.write().apply(overrides)
    }

    pub fn set_mediator(&self, mediator: Arc<Mediator>) {
        *self.mediator.write() = Some(mediator);
    }

    pub fn mediator(&self) -> Result<Arc<Mediator>> {
        self.mediator.read().clone().ok_or_else(|| {
            EnsembleError::Agent(format!(
                "agent {}: communicator not available",
                self.name
            ))
        })
    }

    pub fn tools(&self) -> Option<&Arc<ToolRegistry>> {
        self.tools.as_ref()
    }

    pub fn memory(&self) -> Option<&Arc<MemoryStore>> {
        self.memory.as_ref()
    }

    pub fn gateway(&self) -> &Arc<LlmGateway> {
        &self.gateway
    }

    /// Task type used for per-model performance tracking.
    pub fn task_type(&self) -> Option<TaskType> {
        match self.name.as_str() {
            "code_writer" | "workflow" | "integration" => Some(TaskType::Code),
            "react" => Some(TaskType::Reasoning),
            "research" | "data_analysis" | "monitoring" => Some(TaskType::Analysis),
            _ => None,
        }
    }

    /// The one model-resolution function. Order: an explicit non-"auto"
    /// context preference, then the memory recommendation, then the
    /// descriptor default. `None` leaves the choice to the gateway.
    pub fn resolve_model(&self, context: &TaskContext) -> Option<String> {
        if let Some(preferred) = context.preferred_model() {
            if preferred != "auto" {
                return Some(preferred.to_string());
            }
        }
        if let Some(recommended) = context.recommended_model() {
            return Some(recommended.to_string());
        }
        self.descriptor.read().default_model.clone()
    }

    /// The shared pipeline around `execute_impl`. See the trait docs for
    /// the guarantees.
    pub async fn run_pipeline(
        &self,
        agent: &dyn Agent,
        task: &str,
        context: TaskContext,
    ) -> Result<TaskResult> {
        let started = Instant::now();
        let mut context = context;

        // Consult memory for a recommended model when the caller did not
        // pin one ("auto" is a request for the recommendation).
        let needs_recommendation =
            matches!(context.preferred_model(), None | Some("auto"));
        if needs_recommendation {
            if let Some(memory) = &self.memory {
                if let Some(task_type) = self.task_type() {
                    match memory.get_best_model_for_task_type(task_type).await {
                        Ok(Some(recommendation)) => {
                            debug!(
                                agent = %self.name,
                                model = %recommendation.model,
                                "memory recommends model"
                            );
                            context.set_recommended_model(recommendation.model);
                        }
                        Ok(None) => {}
                        Err(err) => debug!(agent = %self.name, error = %err, "model recommendation failed"),
                    }
                }
            }
        }

        let descriptor = self.descriptor();
        let use_reflection = descriptor.reflection.enabled
            && !context.is_correction_mode()
            && !context.skip_reflection()
            && self.reflection.is_some();

        info!(agent = %self.name, action = "execute_start", task = %slice(task, 80));

        let outcome = if use_reflection {
            // run_pipeline is only reachable with a controller here.
            match &self.reflection {
                Some(controller) => {
                    let adapter = AttemptAdapter { agent };
                    controller
                        .execute_with_reflection(
                            &adapter,
                            task,
                            &context,
                            &descriptor.reflection,
                        )
                        .await
                }
                None => agent.execute_impl(task, &context).await,
            }
        } else {
            agent.execute_impl(task, &context).await
        };

        let duration = started.elapsed().as_secs_f64();

        match outcome {
            Ok(mut result) => {
                result.set_execution_time(duration);

                if result.success() {
                    self.record_success(task, &context, &result, duration).await;
                } else {
                    self.record_model_outcome(&context, &result, duration, false).await;
                }

                info!(
                    agent = %self.name,
                    action = "execute_complete",
                    duration_ms = (duration * 1000.0) as u64,
                    success = result.success()
                );
                Ok(result)
            }
            Err(err) => {
                self.record_failure(task, &err, duration, &context).await;
                info!(
                    agent = %self.name,
                    action = "execute_error",
                    duration_ms = (duration * 1000.0) as u64,
                    error = %err
                );
                Err(err)
            }
        }
    }

    async fn record_success(
        &self,
        task: &str,
        context: &TaskContext,
        result: &TaskResult,
        duration: f64,
    ) {
        self.record_model_outcome(context, result, duration, true).await;

        let Some(memory) = &self.memory else { return };
        let Some(solution) = result.solution_text() else { return };
        if solution.chars().count() < MIN_SOLUTION_CHARS {
            return;
        }

        let mut metadata = Map::new();
        metadata.insert("duration".into(), json!(duration));
        if let Some(reflection) = result.reflection() {
            metadata.insert("reflection".into(), reflection.clone());
        }

        let model_used = self.resolve_model(context);
        if let Err(err) = memory
            .save_solution(
                &slice(task, TASK_SLICE),
                &slice(&solution, SOLUTION_SLICE),
                Some(&self.name),
                metadata,
                model_used.as_deref(),
            )
            .await
        {
            debug!(agent = %self.name, error = %err, "could not save to memory");
        }
    }

    async fn record_model_outcome(
        &self,
        context: &TaskContext,
        result: &TaskResult,
        duration: f64,
        success: bool,
    ) {
        let Some(memory) = &self.memory else { return };
        let (Some(model), Some(task_type)) = (self.resolve_model(context), self.task_type())
        else {
            return;
        };
        let quality = result
            .reflection()
            .and_then(|r| r.get("overall"))
            .and_then(Value::as_f64);
        if let Err(err) = memory
            .record_model_result(&model, task_type, success, quality, duration)
            .await
        {
            debug!(agent = %self.name, error = %err, "could not record model stats");
        }
    }

    async fn record_failure(
        &self,
        task: &str,
        err: &EnsembleError,
        duration: f64,
        context: &TaskContext,
    ) {
        self.record_model_outcome(context, &TaskResult::fail(err.to_string()), duration, false)
            .await;

        let Some(memory) = &self.memory else { return };
        let mut error_context = Map::new();
        error_context.insert("duration".into(), json!(duration));
        error_context.insert(
            "context_keys".into(),
            json!(context.as_map().keys().cloned().collect::<Vec<_>>()),
        );
        if let Err(record_err) = memory
            .save_failed_task(
                &slice(task, TASK_SLICE),
                Some(&self.name),
                err.component(),
                &slice(&err.to_string(), TASK_SLICE),
                error_context,
            )
            .await
        {
            debug!(agent = %self.name, error = %record_err, "could not record failure");
        }
    }

    /// Retrieve assembled context for a query, or an empty string.
    pub async fn context_for(&self, query: &str) -> String {
        match &self.assembler {
            Some(assembler) => assembler
                .get_context(query, None, None, None)
                .await
                .unwrap_or_default(),
            None => String::new(),
        }
    }

    /// The enriched LLM call every variant goes through: date-time
    /// preamble, personalization, error-avoidance warnings, few-shot
    /// examples, model and thinking-mode resolution.
    pub async fn llm_respond(
        &self,
        messages: Vec<ChatMessage>,
        context: &TaskContext,
        options: LlmCallOptions,
    ) -> Result<LlmResponse> {
        let descriptor = self.descriptor();
        let mut messages = messages;

        let has_datetime = messages
            .iter()
            .any(|m| m.is_system() && m.content.contains("Current date and time"));
        if !has_datetime {
            let preamble = format!(
                "Current date and time: {}. Use this when freshness matters.",
                Utc::now().format("%A, %Y-%m-%d %H:%M:%S UTC")
            );
            messages = with_system_preamble(&messages, &preamble);
        }

        let task_text = messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        if let Some(memory) = &self.memory {
            if !task_text.is_empty() {
                let mut enhancements = Vec::new();
                if options.include_personalization {
                    let personalization =
                        memory.get_personalization_prompt(context.user_id()).await;
                    if !personalization.is_empty() {
                        enhancements.push(personalization);
                    }
                }
                if options.include_error_warnings {
                    let warnings = memory
                        .get_error_avoidance_prompt(&task_text, Some(&self.name))
                        .await;
                    if !warnings.is_empty() {
                        enhancements.push(warnings);
                    }
                }
                if options.include_few_shot {
                    let examples = memory.get_few_shot_block(&task_text, 2, 50.0).await;
                    if !examples.is_empty() {
                        enhancements.push(examples);
                    }
                }
                if !enhancements.is_empty() {
                    let addition = enhancements.join("\n");
                    messages = with_system_preamble(&messages, &addition);
                }
            }
        }

        let thinking = options.use_thinking.unwrap_or(descriptor.thinking_mode);
        let mut config = GenerationConfig::default()
            .with_temperature(options.temperature.unwrap_or(descriptor.temperature))
            .with_thinking(thinking);
        config.model = self.resolve_model(context);
        config.max_tokens = options.max_tokens;
        if let Some(server_url) = context.get_str("server_url") {
            config.extra.insert("server_url".into(), json!(server_url));
        }

        let mut request = GenerateRequest::new(messages).with_config(config);
        request.provider = options.provider;

        let response = self.gateway.generate(request).await?;
        if response.has_thinking() {
            debug!(agent = %self.name, "received thinking trace");
        }
        Ok(response)
    }

    // ---- inter-agent communication ----

    pub async fn delegate_to(
        &self,
        agent_type: &str,
        subtask: &str,
        context: Option<Map<String, Value>>,
        timeout: Duration,
    ) -> Result<DelegationResult> {
        let mediator = self.mediator()?;
        info!(agent = %self.name, to = agent_type, "delegating subtask");
        let result = mediator
            .delegate_subtask(
                &self.name,
                agent_type,
                subtask,
                context,
                MessagePriority::Normal,
                timeout,
            )
            .await;
        if result.success {
            info!(
                agent = %self.name,
                to = agent_type,
                elapsed = result.execution_time,
                "delegation successful"
            );
        } else {
            warn!(
                agent = %self.name,
                to = agent_type,
                error = result.error.as_deref().unwrap_or(""),
                "delegation failed"
            );
        }
        Ok(result)
    }

    pub async fn request_help(
        &self,
        capability: Capability,
        task: &str,
        context: Option<Map<String, Value>>,
    ) -> Result<DelegationResult> {
        let mediator = self.mediator()?;
        info!(agent = %self.name, capability = %capability, "requesting help");
        Ok(mediator
            .request_help(&self.name, capability, task, context)
            .await)
    }

    pub async fn broadcast(&self, content: Map<String, Value>) -> Result<TaskResult> {
        let mediator = self.mediator()?;
        mediator.broadcast_to_all(&self.name, content).await
    }
}

/// Bridges a variant's inner routine into the reflection controller.
struct AttemptAdapter<'a> {
    agent: &'a dyn Agent,
}

#[async_trait]
impl Reflective for AttemptAdapter<'_> {
    fn agent_name(&self) -> &str {
        self.agent.core().name()
    }

    async fn attempt(&self, task: &str, context: &TaskContext) -> Result<TaskResult> {
        self.agent.execute_impl(task, context).await
    }
}

pub(crate) fn slice(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
