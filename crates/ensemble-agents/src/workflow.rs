//! Workflow agent: validated multi-step plans with a sandboxed code step

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use ensemble_core::{
    AgentDescriptor, Capability, ChatMessage, EnsembleError, Result, TaskContext, TaskResult,
};

use crate::agent::{Agent, AgentCore, LlmCallOptions};

const DEFAULT_CODE_TIMEOUT_SECS: u64 = 30;
const AGENT_STEP_TIMEOUT: Duration = Duration::from_secs(120);

/// Names whose presence fails a code step outright. Dotted entries are
/// matched literally, bare entries on word boundaries.
const DANGEROUS_NAMES: [&str; 22] = [
    "os.system", "os.popen", "os.spawn", "os.exec", "subprocess", "__import__", "eval", "exec",
    "compile", "open", "input", "shutil", "pickle", "marshal", "ctypes", "socket", "urllib",
    "requests", "httpx", "aiohttp", "sqlite3", "__builtins__",
];

/// Import roots a code step may use.
const SAFE_IMPORT_ROOTS: [&str; 17] = [
    "math", "random", "datetime", "time", "json", "collections", "itertools", "functools",
    "operator", "string", "re", "decimal", "fractions", "statistics", "numpy", "pandas", "typing",
];

pub fn capabilities() -> Vec<Capability> {
    vec![Capability::Workflow]
}

pub fn default_descriptor() -> AgentDescriptor {
    AgentDescriptor::new("workflow", capabilities())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Agent,
    Tool,
    Code,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default = "default_stop_on_error")]
    pub stop_on_error: bool,
}

fn default_stop_on_error() -> bool {
    true
}

impl WorkflowSpec {
    /// Structural validation: unique step names, per-kind required
    /// fields, and dependencies that only reference earlier steps (the
    /// in-order execution makes forward references cycles).
    pub fn validate(&self) -> std::result::Result<(), String> {
        let mut seen: Vec<&str> = Vec::new();
        for step in &self.steps {
            if step.name.is_empty() {
                return Err("step with empty name".into());
            }
            if seen.contains(&step.name.as_str()) {
                return Err(format!("duplicate step name: {}", step.name));
            }
            match step.kind {
                StepKind::Agent if step.agent_type.is_none() => {
                    return Err(format!("step {}: agent_type required", step.name));
                }
                StepKind::Tool if step.tool_name.is_none() => {
                    return Err(format!("step {}: tool_name required", step.name));
                }
                StepKind::Code if step.code.as_deref().unwrap_or("").is_empty() => {
                    return Err(format!("step {}: code required", step.name));
                }
                _ => {}
            }
            for dependency in &step.dependencies {
                if !seen.contains(&dependency.as_str()) {
                    return Err(format!(
                        "step {}: dependency '{}' does not name an earlier step",
                        step.name, dependency
                    ));
                }
            }
            seen.push(&step.name);
        }
        Ok(())
    }
}

pub struct WorkflowAgent {
    core: AgentCore,
}

impl WorkflowAgent {
    pub fn new(core: AgentCore) -> Self {
        Self { core }
    }

    async fn synthesize_workflow(&self, task: &str, context: &TaskContext) -> Result<WorkflowSpec> {
        let retrieval = self.core.context_for(task).await;

        let system_prompt = r#"You are a workflow parser. Extract a workflow definition from the task description.

Workflow format:
{
  "name": "workflow_name",
  "steps": [
    {
      "name": "step1",
      "type": "agent|tool|code",
      "task": "description",
      "agent_type": "code_writer",
      "dependencies": []
    }
  ],
  "stop_on_error": true
}

Return only valid JSON."#;

        let mut user_prompt = format!("Task: {}\n", task);
        if !retrieval.is_empty() {
            user_prompt.push_str(&format!("\nContext:\n{}\n", retrieval));
        }
        user_prompt.push_str("\nExtract the workflow definition from this task.");

        let response = self
            .core
            .llm_respond(
                vec![ChatMessage::system(system_prompt), ChatMessage::user(user_prompt)],
                context,
                LlmCallOptions::plain().with_max_tokens(2000),
            )
            .await?
            .content;

        let object = Regex::new(r"(?s)\{.*\}")
            .ok()
            .and_then(|re| re.find(&response).map(|m| m.as_str().to_string()))
            .ok_or_else(|| {
                EnsembleError::Validation("no workflow JSON in model response".into())
            })?;
        serde_json::from_str(&object)
            .map_err(|e| EnsembleError::Validation(format!("unparseable workflow: {}", e)))
    }

    async fn execute_step(&self, step: &WorkflowStep, context: &TaskContext) -> TaskResult {
        info!(agent = "workflow", step = %step.name, kind = ?step.kind, "executing step");

        let outcome = match step.kind {
            StepKind::Agent => self.run_agent_step(step, context).await,
            StepKind::Tool => self.run_tool_step(step).await,
            StepKind::Code => {
                run_code_step(
                    step.code.as_deref().unwrap_or(""),
                    context
                        .code_timeout_secs()
                        .unwrap_or(DEFAULT_CODE_TIMEOUT_SECS),
                )
                .await
            }
        };

        let mut outcome = outcome;
        outcome.insert("step", json!(step.name));
        outcome
    }

    async fn run_agent_step(&self, step: &WorkflowStep, context: &TaskContext) -> TaskResult {
        let Some(agent_type) = step.agent_type.as_deref() else {
            return TaskResult::fail("agent_type required for agent steps");
        };
        let task = step.task.clone().unwrap_or_default();

        match self
            .core
            .delegate_to(agent_type, &task, Some(context.as_map().clone()), AGENT_STEP_TIMEOUT)
            .await
        {
            Ok(delegation) if delegation.success => {
                let mut result = TaskResult::ok();
                if let Some(inner) = delegation.result {
                    result.insert("result", inner.to_value());
                }
                result
            }
            Ok(delegation) => {
                TaskResult::fail(delegation.error.unwrap_or_else(|| "delegation failed".into()))
            }
            Err(err) => TaskResult::fail(err.to_string()),
        }
    }

    async fn run_tool_step(&self, step: &WorkflowStep) -> TaskResult {
        let Some(tools) = self.core.tools() else {
            return TaskResult::fail("tool registry not available");
        };
        let Some(tool_name) = step.tool_name.as_deref() else {
            return TaskResult::fail("tool_name required for tool steps");
        };

        let output = tools
            .execute(tool_name, step.input.clone().unwrap_or(json!({})))
            .await;
        if output.success {
            TaskResult::ok().with("result", output.output)
        } else {
            TaskResult::fail(output.error.unwrap_or_else(|| "tool failed".into()))
        }
    }
}

#[async_trait]
impl Agent for WorkflowAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn execute(&self, task: &str, context: TaskContext) -> Result<TaskResult> {
        self.core.run_pipeline(self, task, context).await
    }

    async fn execute_impl(&self, task: &str, context: &TaskContext) -> Result<TaskResult> {
        let spec: WorkflowSpec = match context.get("workflow") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| EnsembleError::Validation(format!("invalid workflow: {}", e)))?,
            None => self.synthesize_workflow(task, context).await?,
        };

        if let Err(reason) = spec.validate() {
            return Ok(TaskResult::fail(format!("invalid workflow definition: {}", reason))
                .with("agent", json!("workflow")));
        }

        let mut results: Vec<Value> = Vec::new();
        for step in &spec.steps {
            let step_result = self.execute_step(step, context).await;
            let failed = !step_result.success();
            results.push(step_result.to_value());

            if failed && spec.stop_on_error {
                warn!(agent = "workflow", step = %step.name, "workflow stopped on error");
                return Ok(TaskResult::fail(format!("workflow stopped at step: {}", step.name))
                    .with("agent", json!("workflow"))
                    .with("results", json!(results)));
            }
        }

        Ok(TaskResult::ok()
            .with("agent", json!("workflow"))
            .with("workflow", json!(spec.name.clone().unwrap_or_else(|| "unnamed".into())))
            .with("steps_executed", json!(spec.steps.len()))
            .with("results", json!(results)))
    }
}

/// Static safety gate for code steps. Returns the offending name on a
/// denylist hit.
fn find_dangerous_name(code: &str) -> Option<&'static str> {
    let lower = code.to_lowercase();
    for name in DANGEROUS_NAMES {
        let found = if name.contains('.') || name.starts_with("__") {
            lower.contains(name)
        } else {
            Regex::new(&format!(r"\b{}\b", regex::escape(name)))
                .map(|re| re.is_match(&lower))
                .unwrap_or(false)
        };
        if found {
            return Some(name);
        }
    }
    None
}

fn find_forbidden_import(code: &str) -> Option<String> {
    let import_pattern =
        Regex::new(r"(?m)^\s*(?:import|from)\s+([\w.]+)").ok()?;
    for capture in import_pattern.captures_iter(code) {
        let module = capture[1].to_string();
        let root = module.split('.').next().unwrap_or(&module);
        if !SAFE_IMPORT_ROOTS.contains(&root) {
            return Some(module);
        }
    }
    None
}

/// Run one code step in the sandbox: denylist scan, import allowlist,
/// then an isolated interpreter with a hard timeout and captured output.
/// Denylist hits never spawn a process.
pub async fn run_code_step(code: &str, timeout_secs: u64) -> TaskResult {
    if code.trim().is_empty() {
        return TaskResult::fail("code required for code steps");
    }

    if let Some(name) = find_dangerous_name(code) {
        return TaskResult::fail(format!(
            "Dangerous operation detected: {}. Code execution is restricted for security.",
            name
        ));
    }
    if let Some(module) = find_forbidden_import(code) {
        return TaskResult::fail(format!(
            "Import of '{}' is not allowed. Only safe modules are permitted.",
            module
        ));
    }

    let mut command = tokio::process::Command::new("python3");
    command
        .arg("-I")
        .arg("-c")
        .arg(code)
        .env_clear()
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            return TaskResult::fail(format!("python3 interpreter not available: {}", err));
        }
    };

    match tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if output.status.success() {
                TaskResult::ok().with("output", json!(stdout))
            } else {
                let error = if stderr.is_empty() {
                    format!("code exited with status {}", output.status)
                } else {
                    stderr
                };
                TaskResult::fail(error).with("output", json!(stdout))
            }
        }
        Ok(Err(err)) => TaskResult::fail(format!("execution error: {}", err)),
        // Dropping the timed-out future kills the child.
        Err(_) => TaskResult::fail(format!(
            "code execution timed out after {} seconds",
            timeout_secs
        )),
    }
}
