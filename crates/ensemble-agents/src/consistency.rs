//! Self-consistency: sample N completions, keep the agreement
//!
//! Short outputs are settled by exact vote; long ones by an LLM-judged
//! rerank. Confidence reflects both agreement and sample diversity.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use ensemble_core::{ChatMessage, Result, TaskContext};

use crate::agent::{AgentCore, LlmCallOptions};

const SHORT_OUTPUT_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfConsistencyConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Clamped to [2, 7].
    #[serde(default = "default_samples")]
    pub num_samples: u32,
    #[serde(default = "default_spread")]
    pub temperature_spread: f32,
}

fn default_samples() -> u32 {
    3
}

fn default_spread() -> f32 {
    0.1
}

impl Default for SelfConsistencyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            num_samples: default_samples(),
            temperature_spread: default_spread(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusOutcome {
    pub content: String,
    /// Derived from agreement across samples, discounted by diversity.
    pub confidence: f64,
    pub samples: usize,
    pub distinct: usize,
}

pub struct SelfConsistency {
    config: SelfConsistencyConfig,
}

impl SelfConsistency {
    pub fn new(config: SelfConsistencyConfig) -> Self {
        Self { config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Generate N independent completions at moderate, spread-out
    /// temperatures and select the consensus answer.
    pub async fn generate(
        &self,
        core: &AgentCore,
        messages: &[ChatMessage],
        context: &TaskContext,
    ) -> Result<ConsensusOutcome> {
        let n = self.config.num_samples.clamp(2, 7);
        let base_temperature = core.descriptor().temperature;

        let mut samples: Vec<String> = Vec::with_capacity(n as usize);
        for i in 0..n {
            let temperature =
                (base_temperature + i as f32 * self.config.temperature_spread).min(1.0);
            let response = core
                .llm_respond(
                    messages.to_vec(),
                    context,
                    LlmCallOptions::plain().with_temperature(temperature),
                )
                .await?;
            samples.push(response.content);
        }

        let distinct = distinct_count(&samples);
        let all_short = samples
            .iter()
            .all(|s| s.chars().count() < SHORT_OUTPUT_CHARS);

        let (content, agreement) = if all_short {
            exact_vote(&samples)
        } else {
            match self.judge(core, messages, context, &samples).await {
                Some(index) => (samples[index].clone(), 1.0 / distinct as f64),
                None => exact_vote(&samples),
            }
        };

        let diversity_penalty = (distinct as f64 - 1.0) / samples.len() as f64;
        let confidence = (agreement * (1.0 - 0.3 * diversity_penalty)).clamp(0.0, 1.0);

        debug!(
            samples = samples.len(),
            distinct,
            confidence,
            "self-consistency consensus selected"
        );

        Ok(ConsensusOutcome {
            content,
            confidence,
            samples: samples.len(),
            distinct,
        })
    }

    /// Ask the model which sample best answers the task; `None` when the
    /// verdict is unusable.
    async fn judge(
        &self,
        core: &AgentCore,
        messages: &[ChatMessage],
        context: &TaskContext,
        samples: &[String],
    ) -> Option<usize> {
        let task = messages
            .iter()
            .find(|m| matches!(m.role, ensemble_core::Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        let mut listing = String::new();
        for (i, sample) in samples.iter().enumerate() {
            listing.push_str(&format!(
                "--- CANDIDATE {} ---\n{}\n\n",
                i + 1,
                crate::agent::slice(sample, 1500)
            ));
        }

        let prompt = format!(
            "TASK:\n{task}\n\n{listing}\
             Which candidate best solves the task? Answer with ONLY the candidate number."
        );

        let response = core
            .llm_respond(
                vec![
                    ChatMessage::system(
                        "You are a strict judge comparing candidate solutions. Answer with a single number.",
                    ),
                    ChatMessage::user(prompt),
                ],
                context,
                LlmCallOptions::plain().with_temperature(0.0).with_max_tokens(8),
            )
            .await;

        match response {
            Ok(response) => {
                let digits: String = response
                    .content
                    .chars()
                    .filter(|c| c.is_ascii_digit())
                    .collect();
                let index = digits.parse::<usize>().ok()?.checked_sub(1)?;
                if index < samples.len() { Some(index) } else { None }
            }
            Err(err) => {
                warn!(error = %err, "consensus judge failed, falling back to vote");
                None
            }
        }
    }
}

fn normalize(sample: &str) -> String {
    sample.trim().to_lowercase()
}

fn distinct_count(samples: &[String]) -> usize {
    let mut seen: Vec<String> = Vec::new();
    for sample in samples {
        let n = normalize(sample);
        if !seen.contains(&n) {
            seen.push(n);
        }
    }
    seen.len().max(1)
}

/// Most frequent normalized answer; ties break toward the earliest.
fn exact_vote(samples: &[String]) -> (String, f64) {
    let mut best_index = 0;
    let mut best_count = 0;
    for (i, sample) in samples.iter().enumerate() {
        let n = normalize(sample);
        let count = samples.iter().filter(|s| normalize(s) == n).count();
        if count > best_count {
            best_count = count;
            best_index = i;
        }
    }
    (
        samples[best_index].clone(),
        best_count as f64 / samples.len() as f64,
    )
}

/// Attach consensus metadata to a result map.
pub fn consensus_fields(outcome: &ConsensusOutcome) -> Vec<(&'static str, serde_json::Value)> {
    vec![
        ("confidence", json!(outcome.confidence)),
        ("consistency_samples", json!(outcome.samples)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use ensemble_core::{AgentDescriptor, Capability};
    use ensemble_llm::{LlmGateway, MockProvider};

    fn core_with(provider: MockProvider) -> AgentCore {
        let gateway = Arc::new(LlmGateway::new());
        gateway.register("mock", Arc::new(provider));
        let mut descriptor =
            AgentDescriptor::new("code_writer", vec![Capability::CodeGeneration]);
        descriptor.reflection.enabled = false;
        AgentCore::new(descriptor, gateway)
    }

    fn config(n: u32) -> SelfConsistencyConfig {
        SelfConsistencyConfig {
            enabled: true,
            num_samples: n,
            temperature_spread: 0.1,
        }
    }

    #[tokio::test]
    async fn majority_vote_wins_for_short_outputs() {
        let provider = MockProvider::new()
            .with_responses(vec!["42".into(), "41".into(), "42".into()])
            .once();
        let core = core_with(provider);
        let consistency = SelfConsistency::new(config(3));

        let outcome = consistency
            .generate(&core, &[ChatMessage::user("what is 6*7")], &TaskContext::new())
            .await
            .unwrap();
        assert_eq!(outcome.content, "42");
        assert_eq!(outcome.samples, 3);
        assert_eq!(outcome.distinct, 2);
        assert!(outcome.confidence > 0.5);
    }

    #[tokio::test]
    async fn unanimous_short_answers_give_high_confidence() {
        let provider = MockProvider::new().with_response("yes");
        let core = core_with(provider);
        let consistency = SelfConsistency::new(config(3));

        let outcome = consistency
            .generate(&core, &[ChatMessage::user("is it safe?")], &TaskContext::new())
            .await
            .unwrap();
        assert_eq!(outcome.distinct, 1);
        assert!((outcome.confidence - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn long_outputs_are_judged_by_the_llm() {
        let long_a = format!("def solve():\n{}", "    pass  # padding\n".repeat(10));
        let long_b = format!("def solve_differently():\n{}", "    pass  # padding\n".repeat(10));
        // three samples, then the judge's verdict "2"
        let provider = MockProvider::new()
            .with_responses(vec![long_a.clone(), long_b.clone(), long_a.clone(), "2".into()])
            .once();
        let core = core_with(provider);
        let consistency = SelfConsistency::new(config(3));

        let outcome = consistency
            .generate(&core, &[ChatMessage::user("write solve()")], &TaskContext::new())
            .await
            .unwrap();
        assert_eq!(outcome.content, long_b);
        assert!(outcome.confidence > 0.0);
    }

    #[tokio::test]
    async fn sample_count_is_clamped() {
        let provider = MockProvider::new().with_response("ok");
        let core = core_with(provider.clone());
        let consistency = SelfConsistency::new(config(50));

        let outcome = consistency
            .generate(&core, &[ChatMessage::user("q")], &TaskContext::new())
            .await
            .unwrap();
        assert_eq!(outcome.samples, 7);
        assert_eq!(provider.call_count(), 7);
    }
}
