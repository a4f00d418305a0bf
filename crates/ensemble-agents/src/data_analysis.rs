//! Data-analysis agent: ML task detection and analysis

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};
use tracing::info;

use ensemble_core::{AgentDescriptor, Capability, ChatMessage, Result, TaskContext, TaskResult};

use crate::agent::{Agent, AgentCore, LlmCallOptions};

const AUTOML_CONFIDENCE: f64 = 0.6;

pub fn capabilities() -> Vec<Capability> {
    vec![Capability::DataAnalysis, Capability::MachineLearning]
}

pub fn default_descriptor() -> AgentDescriptor {
    AgentDescriptor::new("data_analysis", capabilities())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MlTaskKind {
    Classification,
    Regression,
    Clustering,
    TimeSeries,
}

impl MlTaskKind {
    fn as_str(&self) -> &'static str {
        match self {
            MlTaskKind::Classification => "classification",
            MlTaskKind::Regression => "regression",
            MlTaskKind::Clustering => "clustering",
            MlTaskKind::TimeSeries => "time_series",
        }
    }

    fn keywords(&self) -> &'static [&'static str] {
        match self {
            MlTaskKind::Classification => {
                &["classif", "categor", "label", "predict class", "detect", "recognize"]
            }
            MlTaskKind::Regression => {
                &["regress", "predict value", "predict price", "estimate", "forecast amount"]
            }
            MlTaskKind::Clustering => &["cluster", "segment", "group similar", "unsupervised"],
            MlTaskKind::TimeSeries => &["time series", "trend", "seasonal", "forecast"],
        }
    }
}

pub struct DataAnalysisAgent {
    core: AgentCore,
    path_pattern: Regex,
    target_pattern: Regex,
}

impl DataAnalysisAgent {
    pub fn new(core: AgentCore) -> Self {
        Self {
            core,
            path_pattern: Regex::new(r"[\w./\\-]+\.(?:csv|parquet|json|xlsx)")
                .expect("static pattern"),
            target_pattern: Regex::new(r"(?:target(?:\s+column)?|predicting)\s+[`'\x22]?(\w+)")
                .expect("static pattern"),
        }
    }

    /// Detect the ML task kind and a confidence in [0, 1]; three keyword
    /// hits saturate the confidence.
    pub fn detect_ml_task(task: &str) -> (Option<MlTaskKind>, f64) {
        let lower = task.to_lowercase();
        let kinds = [
            MlTaskKind::Classification,
            MlTaskKind::Regression,
            MlTaskKind::Clustering,
            MlTaskKind::TimeSeries,
        ];

        let mut best: Option<(MlTaskKind, usize)> = None;
        for kind in kinds {
            let hits = kind.keywords().iter().filter(|k| lower.contains(*k)).count();
            if hits > 0 && best.map_or(true, |(_, best_hits)| hits > best_hits) {
                best = Some((kind, hits));
            }
        }

        match best {
            Some((kind, hits)) => (Some(kind), (hits as f64 / 3.0).min(1.0)),
            None => (None, 0.0),
        }
    }

    fn extract_data_path(&self, task: &str, context: &TaskContext) -> Option<String> {
        if let Some(path) = context.get_str("data_path") {
            return Some(path.to_string());
        }
        self.path_pattern.find(task).map(|m| m.as_str().to_string())
    }

    fn extract_target_column(&self, task: &str, context: &TaskContext) -> Option<String> {
        if let Some(column) = context.get_str("target_column") {
            return Some(column.to_string());
        }
        self.target_pattern
            .captures(&task.to_lowercase())
            .map(|c| c[1].to_string())
    }
}

#[async_trait]
impl Agent for DataAnalysisAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn execute(&self, task: &str, context: TaskContext) -> Result<TaskResult> {
        self.core.run_pipeline(self, task, context).await
    }

    async fn execute_impl(&self, task: &str, context: &TaskContext) -> Result<TaskResult> {
        let (detected, confidence) = Self::detect_ml_task(task);
        let data_path = self.extract_data_path(task, context);
        let target_column = self.extract_target_column(task, context);

        if let Some(kind) = detected {
            info!(
                agent = "data_analysis",
                kind = kind.as_str(),
                confidence,
                "detected ML task"
            );
        }

        // Supervised tasks with a known dataset and target are eligible
        // for the external AutoML engine; the hand-off is advertised in
        // the result and the analysis proceeds either way.
        let automl_eligible = matches!(
            detected,
            Some(MlTaskKind::Classification) | Some(MlTaskKind::Regression)
        ) && confidence >= AUTOML_CONFIDENCE
            && data_path.is_some()
            && target_column.is_some();

        let system_prompt = "You are a data analysis and machine learning expert. \
             Analyze datasets, recommend approaches, and explain trade-offs.\n\
             Cover: data preparation, feature engineering, model selection, \
             evaluation metrics, and pitfalls specific to the task.";

        let mut user_prompt = format!("Analysis task: {}\n", task);
        if let Some(kind) = detected {
            user_prompt.push_str(&format!(
                "\nDetected ML task type: {} (confidence {:.2})\n",
                kind.as_str(),
                confidence
            ));
        }
        if let Some(path) = &data_path {
            user_prompt.push_str(&format!("Dataset: {}\n", path));
        }
        if let Some(column) = &target_column {
            user_prompt.push_str(&format!("Target column: {}\n", column));
        }
        if automl_eligible {
            user_prompt.push_str(
                "\nAn AutoML run is available for this dataset; include a recommended \
                 model family and search budget in the analysis.\n",
            );
        }

        let analysis = self
            .core
            .llm_respond(
                vec![ChatMessage::system(system_prompt), ChatMessage::user(user_prompt)],
                context,
                LlmCallOptions::enriched(),
            )
            .await?
            .content;

        let mut result = TaskResult::ok()
            .with("agent", json!("data_analysis"))
            .with("task", json!(task))
            .with("analysis", json!(analysis))
            .with("detection_confidence", json!(confidence))
            .with("automl_eligible", json!(automl_eligible));
        if let Some(kind) = detected {
            result.insert("detected_task_type", json!(kind.as_str()));
        }
        if let Some(path) = data_path {
            result.insert("data_path", json!(path));
        }
        if let Some(column) = target_column {
            result.insert("target_column", json!(column));
        }
        Ok(result)
    }
}
