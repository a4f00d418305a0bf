//! Row types and settings for the memory store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySettings {
    #[serde(default = "default_max_memories")]
    pub max_memories: i64,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
}

fn default_max_memories() -> i64 {
    1000
}

fn default_similarity_threshold() -> f32 {
    0.3
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            max_memories: 1000,
            similarity_threshold: 0.3,
        }
    }
}

/// One stored solution with its feedback-derived quality signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: i64,
    pub task: String,
    pub solution: String,
    pub agent: Option<String>,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub success_count: i64,
    pub quality_score: f64,
    pub feedback_count: i64,
    pub avg_rating: f64,
    pub helpful_count: i64,
    pub last_used: Option<DateTime<Utc>>,
}

/// A search result: a record plus its similarity to the query, and the
/// combined relevance-times-quality score when quality was considered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryHit {
    pub id: i64,
    pub task: String,
    pub solution: String,
    pub agent: Option<String>,
    pub metadata: Map<String, Value>,
    pub similarity: f32,
    #[serde(default)]
    pub quality_score: f64,
    #[serde(default)]
    pub feedback_count: i64,
    #[serde(default)]
    pub avg_rating: f64,
    #[serde(default)]
    pub combined_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedTaskRecord {
    pub id: i64,
    pub task: String,
    pub agent: Option<String>,
    pub error_kind: String,
    pub error_message: String,
    pub error_context: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecommendation {
    pub model: String,
    pub success_rate: f64,
    pub avg_quality: f64,
    pub avg_duration: f64,
    pub samples: i64,
}
