//! The reflection controller: evaluate a result, drive corrections,
//! record what was learned

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use ensemble_core::result::{
    KEY_CORRECTED, KEY_MAX_RETRIES_REACHED, KEY_REFLECTION, KEY_REFLECTION_ATTEMPTS,
};
use ensemble_core::{
    ChatMessage, GenerationConfig, ReflectionSettings, Result, TaskContext, TaskResult,
};
use ensemble_llm::{GenerateRequest, LlmGateway};
use ensemble_memory::LearningSystem;

use crate::score::ReflectionScore;

const REFLECTION_TEMPERATURE: f32 = 0.2;
const REFLECTION_MAX_TOKENS: u32 = 800;
const CODE_SLICE: usize = 3000;
const TEXT_SLICE: usize = 2000;
const SNIPPET_SLICE: usize = 1000;
const ERROR_PATTERN_SCORE: f64 = 50.0;
const SNIPPET_SCORE: f64 = 85.0;

/// What the controller re-invokes for corrections: one attempt of the
/// agent's inner execution routine, without the surrounding pipeline.
#[async_trait]
pub trait Reflective: Send + Sync {
    fn agent_name(&self) -> &str;

    async fn attempt(&self, task: &str, context: &TaskContext) -> Result<TaskResult>;
}

pub struct ReflectionController {
    gateway: Arc<LlmGateway>,
    learning: Option<LearningSystem>,
}

impl ReflectionController {
    pub fn new(gateway: Arc<LlmGateway>, learning: Option<LearningSystem>) -> Self {
        Self { gateway, learning }
    }

    /// Score one result. History is the prior attempts of this same
    /// execution only; it never crosses tasks.
    pub async fn reflect_on_result(
        &self,
        agent_name: &str,
        task: &str,
        result: &TaskResult,
        history: &[ReflectionScore],
        settings: &ReflectionSettings,
    ) -> ReflectionScore {
        if !settings.enabled {
            return ReflectionScore::perfect();
        }

        let prompt = self.build_reflection_prompt(agent_name, task, result, history).await;

        let request = GenerateRequest::new(vec![
            ChatMessage::system(
                "You are an expert in quality assessment and critical analysis. \
                 Evaluate the result objectively and identify concrete problems. \
                 Respond ONLY with JSON. Be specific in criticism and recommendations.",
            ),
            ChatMessage::user(prompt),
        ])
        .with_config(
            GenerationConfig::default()
                .with_temperature(REFLECTION_TEMPERATURE)
                .with_max_tokens(REFLECTION_MAX_TOKENS),
        );

        let response = match self.gateway.generate(request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(agent = agent_name, error = %err, "reflection call failed");
                return ReflectionScore::degraded(err.to_string());
            }
        };

        let mut score = match parse_reflection_response(&response.content) {
            Some(score) => score,
            None => {
                warn!(agent = agent_name, "unparseable reflection response");
                ReflectionScore::degraded("could not parse scorecard")
            }
        };
        score.thinking = response.thinking;
        score.resolve_retry(settings.min_quality_threshold);

        info!(
            agent = agent_name,
            overall = format!("{:.1}", score.overall),
            quality = ?score.quality_level,
            should_retry = score.should_retry,
            "reflection complete"
        );
        score
    }

    /// Re-run the agent's inner routine against an explicit correction
    /// task derived from the scorecard.
    pub async fn self_correct(
        &self,
        agent: &dyn Reflective,
        task: &str,
        original: TaskResult,
        score: &ReflectionScore,
        context: &TaskContext,
        attempt_number: usize,
    ) -> TaskResult {
        if !score.should_retry {
            return original;
        }

        info!(agent = agent.agent_name(), "self-correcting based on reflection");

        let mut correction_context = context.clone();
        correction_context.set_correction_mode();
        correction_context.insert("_original_result", original.to_value());
        correction_context.insert(
            "_reflection",
            serde_json::to_value(score).unwrap_or(Value::Null),
        );

        let issues = bullet_list(&score.issues, 5);
        let improvements = bullet_list(&score.improvements, 5);
        let suggestion = score
            .retry_suggestion
            .clone()
            .unwrap_or_else(|| "Fix the listed problems and improve the result.".to_string());

        let correction_task = format!(
            "CORRECTION OF A PREVIOUS RESULT\n\n\
             Original task: {task}\n\n\
             Identified problems:\n{issues}\n\n\
             Improvement recommendations:\n{improvements}\n\n\
             {suggestion}\n\n\
             IMPORTANT: produce an IMPROVED solution that addresses every point above."
        );

        match agent.attempt(&correction_task, &correction_context).await {
            Ok(mut corrected) => {
                corrected.insert(KEY_CORRECTED, json!(true));
                corrected.insert("_correction_attempt", json!(attempt_number));
                corrected
            }
            Err(err) => {
                warn!(agent = agent.agent_name(), error = %err, "correction attempt failed");
                original
            }
        }
    }

    /// The full loop: enhance, execute, reflect, correct while retries
    /// remain, and record the outcome for learning.
    pub async fn execute_with_reflection(
        &self,
        agent: &dyn Reflective,
        task: &str,
        context: &TaskContext,
        settings: &ReflectionSettings,
    ) -> Result<TaskResult> {
        let started = Instant::now();

        if !settings.enabled {
            return agent.attempt(task, context).await;
        }

        // History lives for exactly one execution.
        let mut history: Vec<ReflectionScore> = Vec::new();

        let enhanced_task = match self.prompt_enhancement(agent.agent_name(), task).await {
            Some(enhancement) => format!("{}\n\n{}", task, enhancement),
            None => task.to_string(),
        };

        let mut result = agent.attempt(&enhanced_task, context).await?;
        let mut total_attempts: u32 = 1;
        let mut was_corrected = false;

        for round in 0..settings.max_retries {
            let score = self
                .reflect_on_result(agent.agent_name(), task, &result, &history, settings)
                .await;
            history.push(score.clone());

            if !score.should_retry {
                result.insert(KEY_REFLECTION, serde_json::to_value(&score)?);
                result.insert(KEY_REFLECTION_ATTEMPTS, json!(round + 1));
                self.record_outcome(
                    agent.agent_name(),
                    task,
                    &score,
                    was_corrected,
                    total_attempts,
                    started.elapsed().as_secs_f64(),
                    &result,
                )
                .await;
                info!(
                    agent = agent.agent_name(),
                    attempts = round + 1,
                    score = format!("{:.1}", score.overall),
                    "task completed"
                );
                return Ok(result);
            }

            if round + 1 < settings.max_retries {
                result = self
                    .self_correct(agent, task, result, &score, context, history.len())
                    .await;
                total_attempts += 1;
                was_corrected = true;
            }
        }

        // Retries exhausted: one final verdict on whatever we have.
        let final_score = self
            .reflect_on_result(agent.agent_name(), task, &result, &history, settings)
            .await;
        result.insert(KEY_REFLECTION, serde_json::to_value(&final_score)?);
        result.insert(KEY_REFLECTION_ATTEMPTS, json!(settings.max_retries + 1));
        result.insert(KEY_MAX_RETRIES_REACHED, json!(true));

        self.record_outcome(
            agent.agent_name(),
            task,
            &final_score,
            was_corrected,
            total_attempts,
            started.elapsed().as_secs_f64(),
            &result,
        )
        .await;

        if final_score.overall < ERROR_PATTERN_SCORE {
            self.record_error_patterns(agent.agent_name(), &final_score).await;
        }

        warn!(
            agent = agent.agent_name(),
            score = format!("{:.1}", final_score.overall),
            "max reflection retries reached"
        );
        Ok(result)
    }

    async fn build_reflection_prompt(
        &self,
        agent_name: &str,
        task: &str,
        result: &TaskResult,
        history: &[ReflectionScore],
    ) -> String {
        let content = if let Some(code) = result.get_str("code") {
            format!("Code:\n```\n{}\n```", slice(code, CODE_SLICE))
        } else if let Some(report) = result.get_str("report") {
            format!("Report:\n{}", slice(report, TEXT_SLICE))
        } else if let Some(analysis) = result.get_str("analysis") {
            format!("Analysis:\n{}", slice(analysis, TEXT_SLICE))
        } else if let Some(answer) = result.get_str("final_answer") {
            format!("Answer:\n{}", slice(answer, TEXT_SLICE))
        } else {
            format!("Result:\n{}", slice(&result.to_value().to_string(), TEXT_SLICE))
        };

        let error_info = result
            .error()
            .map(|e| format!("\n\nERROR: {}", e))
            .unwrap_or_default();

        let retry_context = history
            .last()
            .map(|last| {
                format!(
                    "\n\nPrevious attempt:\n- Score: {:.1}\n- Problems: {}\n- Recommendations: {}\n",
                    last.overall,
                    last.issues.iter().take(3).cloned().collect::<Vec<_>>().join(", "),
                    last.improvements.iter().take(3).cloned().collect::<Vec<_>>().join(", "),
                )
            })
            .unwrap_or_default();

        let learning_context = match &self.learning {
            Some(learning) => match learning.agent_insights(agent_name).await {
                Ok(insights) if !insights.common_issues.is_empty() => {
                    let issues = insights
                        .common_issues
                        .iter()
                        .map(|i| format!("- {}", i))
                        .collect::<Vec<_>>()
                        .join("\n");
                    format!("\n\nHISTORICAL ISSUES FOR THIS AGENT (watch closely):\n{}\n", issues)
                }
                Ok(_) => String::new(),
                Err(err) => {
                    debug!(error = %err, "could not load agent insights");
                    String::new()
                }
            },
            None => String::new(),
        };

        format!(
            "Analyze the result of the task below and rate its quality.\n\n\
             TASK:\n{task}\n\n\
             RESULT:\n{content}{error_info}{retry_context}{learning_context}\n\n\
             Rate each criterion from 0 to 100:\n\
             1. COMPLETENESS: how fully is the task solved?\n\
             2. CORRECTNESS: how correct is the solution?\n\
             3. QUALITY: how well is it written (code/text)?\n\n\
             Identify:\n- PROBLEMS: what is wrong or could be improved?\n\
             - IMPROVEMENTS: concrete recommendations\n\n\
             Respond STRICTLY as JSON:\n\
             {{\n    \"completeness\": <0-100>,\n    \"correctness\": <0-100>,\n    \"quality\": <0-100>,\n\
             \"issues\": [\"problem1\", \"problem2\"],\n    \"improvements\": [\"improvement1\", \"improvement2\"],\n\
             \"retry_suggestion\": \"<what to fix if a retry is needed, else null>\"\n}}\n\n\
             Be critical but fair. Judge objectively."
        )
    }

    async fn prompt_enhancement(&self, agent_name: &str, task: &str) -> Option<String> {
        let learning = self.learning.as_ref()?;
        let enhancement = learning.prompt_enhancement(agent_name, task).await;
        if enhancement.is_empty() {
            None
        } else {
            debug!(agent = agent_name, "using enhanced prompt with learning insights");
            Some(enhancement)
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_outcome(
        &self,
        agent_name: &str,
        task: &str,
        score: &ReflectionScore,
        was_corrected: bool,
        attempts: u32,
        duration_secs: f64,
        result: &TaskResult,
    ) {
        let Some(learning) = self.learning.as_ref() else { return };

        let snippet = if score.overall >= SNIPPET_SCORE {
            result.solution_text().map(|s| slice(&s, SNIPPET_SLICE))
        } else {
            None
        };

        if let Err(err) = learning
            .record_reflection(
                agent_name,
                task,
                score.overall,
                was_corrected,
                attempts,
                duration_secs,
                snippet.as_deref(),
            )
            .await
        {
            debug!(error = %err, "failed to record learning outcome");
        }
    }

    async fn record_error_patterns(&self, agent_name: &str, score: &ReflectionScore) {
        let Some(learning) = self.learning.as_ref() else { return };
        for issue in score.issues.iter().take(2) {
            if let Err(err) = learning.record_error_pattern(agent_name, issue).await {
                debug!(error = %err, "failed to record error pattern");
            }
        }
    }
}

fn slice(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn bullet_list(items: &[String], max: usize) -> String {
    items
        .iter()
        .take(max)
        .map(|i| format!("- {}", i))
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_reflection_response(response: &str) -> Option<ReflectionScore> {
    let json_match = Regex::new(r"\{[\s\S]*\}").ok()?.find(response)?;
    let data: Value = serde_json::from_str(json_match.as_str()).ok()?;

    let component = |key: &str| data.get(key).and_then(Value::as_f64).unwrap_or(50.0);
    let string_list = |key: &str| -> Vec<String> {
        data.get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };

    Some(ReflectionScore::from_components(
        component("completeness"),
        component("correctness"),
        component("quality"),
        string_list("issues"),
        string_list("improvements"),
        data.get("retry_suggestion")
            .and_then(Value::as_str)
            .map(str::to_string),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use ensemble_llm::MockProvider;
    use ensemble_memory::{MemorySettings, MemoryStore};

    struct ScriptedAgent {
        name: String,
        results: Mutex<Vec<TaskResult>>,
        calls: Mutex<Vec<(String, TaskContext)>>,
    }

    impl ScriptedAgent {
        fn new(results: Vec<TaskResult>) -> Self {
            Self {
                name: "code_writer".into(),
                results: Mutex::new(results),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Reflective for ScriptedAgent {
        fn agent_name(&self) -> &str {
            &self.name
        }

        async fn attempt(&self, task: &str, context: &TaskContext) -> Result<TaskResult> {
            self.calls
                .lock()
                .unwrap()
                .push((task.to_string(), context.clone()));
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                Ok(TaskResult::ok())
            } else {
                Ok(results.remove(0))
            }
        }
    }

    fn scorecard(completeness: f64, correctness: f64, quality: f64, issues: &[&str]) -> String {
        serde_json::json!({
            "completeness": completeness,
            "correctness": correctness,
            "quality": quality,
            "issues": issues,
            "improvements": ["be more careful"],
            "retry_suggestion": if issues.is_empty() { Value::Null } else { json!("fix the issues") },
        })
        .to_string()
    }

    fn controller_with(responses: Vec<String>) -> ReflectionController {
        let gateway = Arc::new(LlmGateway::new());
        gateway.register("mock", Arc::new(MockProvider::new().with_responses(responses)));
        ReflectionController::new(gateway, None)
    }

    async fn controller_with_learning(responses: Vec<String>) -> (ReflectionController, LearningSystem) {
        let gateway = Arc::new(LlmGateway::new());
        gateway.register("mock", Arc::new(MockProvider::new().with_responses(responses)));
        let store = MemoryStore::open_in_memory(MemorySettings::default(), None)
            .await
            .unwrap();
        let learning = LearningSystem::new(Arc::new(store));
        (
            ReflectionController::new(gateway, Some(learning.clone())),
            learning,
        )
    }

    fn settings(max_retries: u32) -> ReflectionSettings {
        ReflectionSettings {
            enabled: true,
            max_retries,
            min_quality_threshold: 60.0,
        }
    }

    #[tokio::test]
    async fn disabled_reflection_passes_through() {
        let controller = controller_with(vec![]);
        let agent = ScriptedAgent::new(vec![TaskResult::ok().with("code", json!("fn main() {}"))]);
        let off = ReflectionSettings {
            enabled: false,
            ..settings(2)
        };

        let result = controller
            .execute_with_reflection(&agent, "write code", &TaskContext::new(), &off)
            .await
            .unwrap();
        assert_eq!(agent.call_count(), 1);
        assert!(result.reflection().is_none());
    }

    #[tokio::test]
    async fn good_first_result_is_not_corrected() {
        let controller = controller_with(vec![scorecard(90.0, 90.0, 85.0, &[])]);
        let agent = ScriptedAgent::new(vec![TaskResult::ok().with("code", json!("fn main() {}"))]);

        let result = controller
            .execute_with_reflection(&agent, "write code", &TaskContext::new(), &settings(2))
            .await
            .unwrap();
        assert_eq!(agent.call_count(), 1);
        assert_eq!(result.reflection_attempts(), Some(1));
        assert!(!result.was_corrected());
    }

    #[tokio::test]
    async fn poor_result_triggers_correction_then_succeeds() {
        // First reflection: poor with issues. Second: good.
        let controller = controller_with(vec![
            scorecard(40.0, 40.0, 40.0, &["missing colon on line 3"]),
            scorecard(85.0, 85.0, 85.0, &[]),
        ]);
        let agent = ScriptedAgent::new(vec![
            TaskResult::ok().with("code", json!("def f()\n  pass")),
            TaskResult::ok().with("code", json!("def f():\n    pass")),
        ]);

        let result = controller
            .execute_with_reflection(&agent, "write f", &TaskContext::new(), &settings(2))
            .await
            .unwrap();

        assert_eq!(agent.call_count(), 2);
        assert!(result.was_corrected());
        assert_eq!(result.reflection_attempts(), Some(2));
        let overall = result.reflection().unwrap()["overall"].as_f64().unwrap();
        assert!((overall - 85.0).abs() < 1e-9);

        // The correction call carried the correction marker.
        let calls = agent.calls.lock().unwrap();
        assert!(calls[1].1.is_correction_mode());
        assert!(calls[1].0.contains("missing colon on line 3"));
    }

    #[tokio::test]
    async fn exhausted_retries_mark_the_result() {
        let controller = controller_with(vec![
            scorecard(30.0, 30.0, 30.0, &["wrong output"]),
            scorecard(30.0, 30.0, 30.0, &["still wrong"]),
            scorecard(30.0, 30.0, 30.0, &["still wrong"]),
        ]);
        let agent = ScriptedAgent::new(vec![
            TaskResult::ok().with("code", json!("bad")),
            TaskResult::ok().with("code", json!("also bad")),
        ]);

        let result = controller
            .execute_with_reflection(&agent, "task", &TaskContext::new(), &settings(2))
            .await
            .unwrap();
        assert_eq!(result.reflection_attempts(), Some(3));
        assert_eq!(result.get(KEY_MAX_RETRIES_REACHED), Some(&json!(true)));
        // initial + one correction: max_retries bounds executions
        assert_eq!(agent.call_count(), 2);
    }

    #[tokio::test]
    async fn reflection_failure_degrades_and_never_retries() {
        // Unparseable scorecard: degrade to acceptable, no retry.
        let controller = controller_with(vec!["not json at all".to_string()]);
        let agent = ScriptedAgent::new(vec![TaskResult::ok().with("code", json!("x"))]);

        let result = controller
            .execute_with_reflection(&agent, "task", &TaskContext::new(), &settings(2))
            .await
            .unwrap();
        assert_eq!(agent.call_count(), 1);
        let overall = result.reflection().unwrap()["overall"].as_f64().unwrap();
        assert!((overall - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn low_final_scores_record_error_patterns() {
        let (controller, learning) = controller_with_learning(vec![
            scorecard(20.0, 20.0, 20.0, &["hallucinated API", "no error handling"]),
            scorecard(20.0, 20.0, 20.0, &["hallucinated API", "no error handling"]),
            scorecard(20.0, 20.0, 20.0, &["hallucinated API", "no error handling"]),
        ])
        .await;
        let agent = ScriptedAgent::new(vec![TaskResult::ok().with("code", json!("nonsense"))]);

        controller
            .execute_with_reflection(&agent, "task", &TaskContext::new(), &settings(2))
            .await
            .unwrap();

        let insights = learning.agent_insights("code_writer").await.unwrap();
        assert!(insights.common_issues.contains(&"hallucinated API".to_string()));
        assert_eq!(insights.executions, 1);
    }

    #[tokio::test]
    async fn high_scores_store_a_solution_snippet() {
        let (controller, learning) =
            controller_with_learning(vec![scorecard(95.0, 95.0, 90.0, &[])]).await;
        let agent = ScriptedAgent::new(vec![
            TaskResult::ok().with("code", json!("def add(a, b):\n    return a + b")),
        ]);

        controller
            .execute_with_reflection(&agent, "add numbers", &TaskContext::new(), &settings(2))
            .await
            .unwrap();

        let insights = learning.agent_insights("code_writer").await.unwrap();
        assert_eq!(insights.executions, 1);
        assert_eq!(insights.corrected, 0);
    }

    #[test]
    fn parser_clips_and_extracts_from_noise() {
        let response = format!("Here is my analysis:\n{}", scorecard(120.0, -5.0, 50.0, &["x"]));
        let score = parse_reflection_response(&response).unwrap();
        assert_eq!(score.completeness, 100.0);
        assert_eq!(score.correctness, 0.0);
        assert_eq!(score.issues, vec!["x".to_string()]);
    }
}
