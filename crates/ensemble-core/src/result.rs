//! Map-shaped task results and execution contexts
//!
//! Agents exchange loosely-typed JSON maps. The newtypes here give those
//! maps a vocabulary: reserved keys (`_execution_time`, `_reflection`,
//! `_correction_mode`, ...) are only touched through accessors.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const KEY_SUCCESS: &str = "success";
pub const KEY_ERROR: &str = "error";
pub const KEY_EXECUTION_TIME: &str = "_execution_time";
pub const KEY_REFLECTION: &str = "_reflection";
pub const KEY_REFLECTION_ATTEMPTS: &str = "_reflection_attempts";
pub const KEY_CORRECTED: &str = "_corrected";
pub const KEY_MAX_RETRIES_REACHED: &str = "_max_retries_reached";
pub const KEY_CORRECTION_MODE: &str = "_correction_mode";
pub const KEY_SKIP_REFLECTION: &str = "_skip_reflection";
pub const KEY_PREFERRED_MODEL: &str = "preferred_model";
pub const KEY_RECOMMENDED_MODEL: &str = "_memory_recommended_model";
pub const KEY_DELEGATED_FROM: &str = "_delegated_from";
pub const KEY_DELEGATION_ID: &str = "_delegation_id";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct TaskResult(Map<String, Value>);

impl TaskResult {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn ok() -> Self {
        let mut map = Map::new();
        map.insert(KEY_SUCCESS.into(), Value::Bool(true));
        Self(map)
    }

    pub fn fail(error: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert(KEY_SUCCESS.into(), Value::Bool(false));
        map.insert(KEY_ERROR.into(), Value::String(error.into()));
        Self(map)
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    /// Absent `success` means success, matching the bus convention that
    /// only failures are obliged to say so.
    pub fn success(&self) -> bool {
        self.0.get(KEY_SUCCESS).and_then(|v| v.as_bool()).unwrap_or(true)
    }

    pub fn error(&self) -> Option<&str> {
        self.get_str(KEY_ERROR)
    }

    /// The representative payload of a result: code, a final answer, an
    /// analysis, or a report, in that order; otherwise the stringified
    /// `result` field.
    pub fn solution_text(&self) -> Option<String> {
        for key in ["code", "final_answer", "analysis", "report"] {
            if let Some(text) = self.get_str(key) {
                if !text.is_empty() {
                    return Some(text.to_string());
                }
            }
        }
        self.0.get("result").map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn set_execution_time(&mut self, seconds: f64) {
        self.0.insert(KEY_EXECUTION_TIME.into(), seconds.into());
    }

    pub fn execution_time(&self) -> Option<f64> {
        self.0.get(KEY_EXECUTION_TIME).and_then(|v| v.as_f64())
    }

    pub fn reflection(&self) -> Option<&Value> {
        self.0.get(KEY_REFLECTION)
    }

    pub fn reflection_attempts(&self) -> Option<u64> {
        self.0.get(KEY_REFLECTION_ATTEMPTS).and_then(|v| v.as_u64())
    }

    pub fn was_corrected(&self) -> bool {
        self.0.get(KEY_CORRECTED).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

impl From<Map<String, Value>> for TaskResult {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<TaskResult> for Value {
    fn from(result: TaskResult) -> Self {
        Value::Object(result.0)
    }
}

/// Context handed to one `execute` call. Owned by the executing agent for
/// the lifetime of that call and dropped on completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct TaskContext(Map<String, Value>);

impl TaskContext {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn preferred_model(&self) -> Option<&str> {
        self.get_str(KEY_PREFERRED_MODEL)
    }

    pub fn recommended_model(&self) -> Option<&str> {
        self.get_str(KEY_RECOMMENDED_MODEL)
    }

    pub fn set_recommended_model(&mut self, model: impl Into<String>) {
        self.0.insert(KEY_RECOMMENDED_MODEL.into(), Value::String(model.into()));
    }

    pub fn is_correction_mode(&self) -> bool {
        self.flag(KEY_CORRECTION_MODE)
    }

    pub fn set_correction_mode(&mut self) {
        self.0.insert(KEY_CORRECTION_MODE.into(), Value::Bool(true));
    }

    pub fn skip_reflection(&self) -> bool {
        self.flag(KEY_SKIP_REFLECTION)
    }

    pub fn delegated_from(&self) -> Option<&str> {
        self.get_str(KEY_DELEGATED_FROM)
    }

    pub fn stamp_delegation(&mut self, from: &str, delegation_id: &str) {
        self.0.insert(KEY_DELEGATED_FROM.into(), Value::String(from.to_string()));
        self.0.insert(KEY_DELEGATION_ID.into(), Value::String(delegation_id.to_string()));
    }

    pub fn user_id(&self) -> &str {
        self.get_str("user_id").unwrap_or("default")
    }

    pub fn code_timeout_secs(&self) -> Option<u64> {
        self.0.get("code_timeout").and_then(|v| v.as_u64())
    }

    fn flag(&self, key: &str) -> bool {
        self.0.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for TaskContext {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_defaults_to_true() {
        assert!(TaskResult::new().success());
        assert!(TaskResult::ok().success());
        assert!(!TaskResult::fail("boom").success());
        assert_eq!(TaskResult::fail("boom").error(), Some("boom"));
    }

    #[test]
    fn solution_text_prefers_code() {
        let result = TaskResult::ok()
            .with("code", json!("fn main() {}"))
            .with("final_answer", json!("42"));
        assert_eq!(result.solution_text().as_deref(), Some("fn main() {}"));

        let result = TaskResult::ok().with("report", json!("findings"));
        assert_eq!(result.solution_text().as_deref(), Some("findings"));

        let result = TaskResult::ok().with("result", json!({"n": 1}));
        assert_eq!(result.solution_text().as_deref(), Some("{\"n\":1}"));
    }

    #[test]
    fn execution_time_round_trips() {
        let mut result = TaskResult::ok();
        result.set_execution_time(1.25);
        assert_eq!(result.execution_time(), Some(1.25));
    }

    #[test]
    fn context_flags_and_stamps() {
        let mut ctx = TaskContext::new();
        assert!(!ctx.is_correction_mode());
        ctx.set_correction_mode();
        assert!(ctx.is_correction_mode());

        ctx.stamp_delegation("code_writer", "abc-123");
        assert_eq!(ctx.delegated_from(), Some("code_writer"));
        assert_eq!(ctx.get_str(KEY_DELEGATION_ID), Some("abc-123"));
        assert_eq!(ctx.user_id(), "default");
    }

    #[test]
    fn context_serde_is_transparent() {
        let ctx = TaskContext::new().with("preferred_model", json!("llama3"));
        let json = serde_json::to_string(&ctx).unwrap();
        assert_eq!(json, "{\"preferred_model\":\"llama3\"}");
        let parsed: TaskContext = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.preferred_model(), Some("llama3"));
    }
}
