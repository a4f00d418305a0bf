//! Learning layer over the memory store
//!
//! The reflection controller records every execution outcome here; the
//! accumulated error patterns and scores feed back into prompts for the
//! same agent. All operations share the store's failure semantics:
//! recording never breaks the caller.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::debug;

use ensemble_core::{EnsembleError, Result};

use crate::store::MemoryStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInsights {
    pub agent: String,
    /// Recurring issues, most frequent first.
    pub common_issues: Vec<String>,
    pub avg_quality: f64,
    pub executions: i64,
    pub corrected: i64,
}

#[derive(Clone)]
pub struct LearningSystem {
    store: Arc<MemoryStore>,
}

impl LearningSystem {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    pub async fn record_reflection(
        &self,
        agent: &str,
        task: &str,
        overall: f64,
        was_corrected: bool,
        attempts: u32,
        duration_secs: f64,
        solution_snippet: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reflection_log (agent, task, overall, was_corrected, attempts, duration, solution_snippet, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(agent)
        .bind(task)
        .bind(overall)
        .bind(i64::from(was_corrected))
        .bind(i64::from(attempts))
        .bind(duration_secs)
        .bind(solution_snippet)
        .bind(Utc::now().to_rfc3339())
        .execute(self.store.pool())
        .await
        .map_err(|e| EnsembleError::Memory(e.to_string()))?;
        Ok(())
    }

    pub async fn record_error_pattern(&self, agent: &str, pattern: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO error_patterns (agent, pattern, occurrences, last_seen)
            VALUES (?, ?, 1, ?)
            ON CONFLICT (agent, pattern) DO UPDATE SET
                occurrences = occurrences + 1,
                last_seen = excluded.last_seen
            "#,
        )
        .bind(agent)
        .bind(pattern)
        .bind(Utc::now().to_rfc3339())
        .execute(self.store.pool())
        .await
        .map_err(|e| EnsembleError::Memory(e.to_string()))?;
        Ok(())
    }

    pub async fn agent_insights(&self, agent: &str) -> Result<AgentInsights> {
        let issues = sqlx::query(
            "SELECT pattern FROM error_patterns WHERE agent = ? ORDER BY occurrences DESC, last_seen DESC LIMIT 3",
        )
        .bind(agent)
        .fetch_all(self.store.pool())
        .await
        .map_err(|e| EnsembleError::Memory(e.to_string()))?;

        let totals = sqlx::query(
            r#"
            SELECT COUNT(*) AS executions,
                   COALESCE(AVG(overall), 0.0) AS avg_quality,
                   COALESCE(SUM(was_corrected), 0) AS corrected
            FROM reflection_log WHERE agent = ?
            "#,
        )
        .bind(agent)
        .fetch_one(self.store.pool())
        .await
        .map_err(|e| EnsembleError::Memory(e.to_string()))?;

        Ok(AgentInsights {
            agent: agent.to_string(),
            common_issues: issues.into_iter().map(|row| row.get("pattern")).collect(),
            avg_quality: totals.get("avg_quality"),
            executions: totals.get("executions"),
            corrected: totals.get("corrected"),
        })
    }

    /// Prompt addition derived from this agent's accumulated experience,
    /// or an empty string when there is nothing worth saying.
    pub async fn prompt_enhancement(&self, agent: &str, task: &str) -> String {
        let insights = match self.agent_insights(agent).await {
            Ok(insights) => insights,
            Err(err) => {
                debug!(error = %err, "insight lookup degraded to empty");
                return String::new();
            }
        };

        let mut sections = Vec::new();
        if !insights.common_issues.is_empty() {
            let mut block =
                String::from("RECURRING ISSUES FOR THIS AGENT (pay special attention):\n");
            for issue in &insights.common_issues {
                block.push_str(&format!("- {}\n", issue));
            }
            sections.push(block);
        }

        let avoidance = self.store.get_error_avoidance_prompt(task, Some(agent)).await;
        if !avoidance.is_empty() {
            sections.push(avoidance);
        }

        sections.join("\n")
    }
}
