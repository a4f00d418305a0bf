//! SQLite-backed memory store
//!
//! One connection, explicit transactions, record-level atomicity. Write
//! failures must never break an agent's critical path: callers log and
//! swallow `Memory` errors, and the helpers here degrade reads to empty
//! results where the data is advisory.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info, warn};

use ensemble_core::{Embedder, EnsembleError, Result, TaskType, cosine_similarity};

use crate::records::{
    FailedTaskRecord, MemoryHit, MemoryRecord, MemorySettings, ModelRecommendation,
};

const TEXT_SEARCH_SIMILARITY: f32 = 0.5;
const ERROR_OVERLAP_THRESHOLD: f32 = 0.3;

pub struct MemoryStore {
    pool: SqlitePool,
    settings: RwLock<MemorySettings>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl MemoryStore {
    /// Open (or create) the store at `path`. The embedder, when given, is
    /// the instance owned by the vector index; the store never loads its
    /// own model. Without one, similarity search degrades to substring
    /// matching.
    pub async fn open(
        path: impl AsRef<Path>,
        settings: MemorySettings,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(db_err)?;
        let store = Self {
            pool,
            settings: RwLock::new(settings),
            embedder,
        };
        store.migrate().await?;
        info!("memory store initialized");
        Ok(store)
    }

    /// Ephemeral store for tests.
    pub async fn open_in_memory(
        settings: MemorySettings,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;
        let store = Self {
            pool,
            settings: RwLock::new(settings),
            embedder,
        };
        store.migrate().await?;
        Ok(store)
    }

    pub fn update_settings(&self, settings: MemorySettings) {
        let mut current = self.settings.write();
        info!(
            max_memories = settings.max_memories,
            similarity_threshold = settings.similarity_threshold,
            "memory settings updated"
        );
        *current = settings;
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task TEXT NOT NULL,
                solution TEXT NOT NULL,
                agent TEXT,
                metadata TEXT,
                embedding BLOB,
                created_at TEXT NOT NULL,
                success_count INTEGER DEFAULT 1,
                quality_score REAL DEFAULT 0.0,
                feedback_count INTEGER DEFAULT 0,
                avg_rating REAL DEFAULT 0.0,
                is_helpful_count INTEGER DEFAULT 0,
                last_used TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        // Columns added after the first release; adding them again is a
        // no-op failure on an up-to-date schema.
        for (column, decl) in [
            ("quality_score", "REAL DEFAULT 0.0"),
            ("feedback_count", "INTEGER DEFAULT 0"),
            ("avg_rating", "REAL DEFAULT 0.0"),
            ("is_helpful_count", "INTEGER DEFAULT 0"),
            ("last_used", "TEXT"),
        ] {
            let stmt = format!("ALTER TABLE memories ADD COLUMN {} {}", column, decl);
            if let Err(err) = sqlx::query(&stmt).execute(&self.pool).await {
                debug!(column, error = %err, "migration column already present");
            }
        }

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_memories_created_at ON memories(created_at)")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_memories_quality ON memories(quality_score DESC)",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS failed_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task TEXT NOT NULL,
                agent TEXT,
                error_kind TEXT NOT NULL,
                error_message TEXT NOT NULL,
                error_context TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_preferences (
                user_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (user_id, key)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS model_task_stats (
                model TEXT NOT NULL,
                task_type TEXT NOT NULL,
                success_count INTEGER DEFAULT 0,
                failure_count INTEGER DEFAULT 0,
                sum_quality REAL DEFAULT 0.0,
                sum_duration REAL DEFAULT 0.0,
                samples INTEGER DEFAULT 0,
                PRIMARY KEY (model, task_type)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS error_patterns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent TEXT NOT NULL,
                pattern TEXT NOT NULL,
                occurrences INTEGER DEFAULT 1,
                last_seen TEXT NOT NULL,
                UNIQUE (agent, pattern)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reflection_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent TEXT NOT NULL,
                task TEXT NOT NULL,
                overall REAL NOT NULL,
                was_corrected INTEGER NOT NULL,
                attempts INTEGER NOT NULL,
                duration REAL NOT NULL,
                solution_snippet TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    // ---- solutions ----

    pub async fn save_solution(
        &self,
        task: &str,
        solution: &str,
        agent: Option<&str>,
        mut metadata: Map<String, Value>,
        model_used: Option<&str>,
    ) -> Result<i64> {
        if let Some(model) = model_used {
            metadata.insert("model_used".into(), Value::String(model.to_string()));
        }
        let embedding = self
            .embedder
            .as_ref()
            .map(|e| embedding_to_blob(&e.encode(task)));
        // The reflection score seeds the initial quality; feedback later
        // recomputes it from ratings.
        let initial_quality = metadata
            .get("reflection")
            .and_then(|r| r.get("overall"))
            .and_then(Value::as_f64)
            .map(|q| q.clamp(0.0, 100.0))
            .unwrap_or(0.0);
        let metadata_json = serde_json::to_string(&metadata)?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query(
            r#"
            INSERT INTO memories (task, solution, agent, metadata, embedding, created_at, quality_score)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(task)
        .bind(solution)
        .bind(agent)
        .bind(metadata_json)
        .bind(embedding)
        .bind(Utc::now().to_rfc3339())
        .bind(initial_quality)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        let id: i64 = row.get("id");

        // Eviction failure must not fail the save.
        if let Err(err) = self.cleanup_if_needed().await {
            warn!(error = %err, "memory cleanup failed");
        }

        Ok(id)
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM memories")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.get("n"))
    }

    /// Evict down to `max_memories`, lowest quality first, oldest first
    /// within equal quality. Never evicts a strictly higher-quality row
    /// while keeping a strictly lower one.
    pub async fn cleanup_if_needed(&self) -> Result<u64> {
        let max_memories = self.settings.read().max_memories;
        let count = self.count().await?;
        if count <= max_memories {
            return Ok(0);
        }
        let to_delete = count - max_memories;
        let result = sqlx::query(
            r#"
            DELETE FROM memories WHERE id IN (
                SELECT id FROM memories
                ORDER BY quality_score ASC, created_at ASC
                LIMIT ?
            )
            "#,
        )
        .bind(to_delete)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        info!(evicted = result.rows_affected(), "evicted low-quality memories");
        Ok(result.rows_affected())
    }

    pub async fn search_similar_tasks(&self, query: &str, top_k: usize) -> Result<Vec<MemoryHit>> {
        let Some(embedder) = self.embedder.as_ref() else {
            return self.text_search(query, top_k).await;
        };
        let query_embedding = embedder.encode(query);
        let threshold = self.settings.read().similarity_threshold;

        let rows = sqlx::query(
            "SELECT id, task, solution, agent, metadata, embedding FROM memories WHERE embedding IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut hits: Vec<MemoryHit> = Vec::new();
        for row in rows {
            let blob: Vec<u8> = row.get("embedding");
            let stored = blob_to_embedding(&blob);
            let similarity = cosine_similarity(&query_embedding, &stored);
            if similarity >= threshold {
                hits.push(MemoryHit {
                    id: row.get("id"),
                    task: row.get("task"),
                    solution: row.get("solution"),
                    agent: row.get("agent"),
                    metadata: parse_metadata(row.get::<Option<String>, _>("metadata")),
                    similarity,
                    quality_score: 0.0,
                    feedback_count: 0,
                    avg_rating: 0.0,
                    combined_score: 0.0,
                });
            }
        }
        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn text_search(&self, query: &str, top_k: usize) -> Result<Vec<MemoryHit>> {
        let pattern = format!("%{}%", query);
        let rows = sqlx::query(
            r#"
            SELECT id, task, solution, agent, metadata FROM memories
            WHERE task LIKE ? OR solution LIKE ?
            ORDER BY created_at DESC
            LIMIT ?
            "#,
        )
        .bind(&pattern)
        .bind(&pattern)
        .bind(top_k as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|row| MemoryHit {
                id: row.get("id"),
                task: row.get("task"),
                solution: row.get("solution"),
                agent: row.get("agent"),
                metadata: parse_metadata(row.get::<Option<String>, _>("metadata")),
                similarity: TEXT_SEARCH_SIMILARITY,
                quality_score: 0.0,
                feedback_count: 0,
                avg_rating: 0.0,
                combined_score: 0.0,
            })
            .collect())
    }

    /// Similarity search reweighted by feedback quality:
    /// combined = 0.6 * similarity + 0.4 * quality / 100.
    /// Marks the returned rows as used.
    pub async fn search_similar_tasks_with_quality(
        &self,
        query: &str,
        top_k: usize,
        min_quality: f64,
    ) -> Result<Vec<MemoryHit>> {
        let mut hits = self.search_similar_tasks(query, top_k * 2).await?;
        if hits.is_empty() {
            return Ok(hits);
        }

        let mut kept: Vec<MemoryHit> = Vec::new();
        for mut hit in hits.drain(..) {
            let row = sqlx::query(
                "SELECT quality_score, feedback_count, avg_rating FROM memories WHERE id = ?",
            )
            .bind(hit.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

            let Some(row) = row else { continue };
            let quality: f64 = row.get::<Option<f64>, _>("quality_score").unwrap_or(0.0);
            if quality < min_quality {
                continue;
            }
            hit.quality_score = quality;
            hit.feedback_count = row.get::<Option<i64>, _>("feedback_count").unwrap_or(0);
            hit.avg_rating = row.get::<Option<f64>, _>("avg_rating").unwrap_or(0.0);
            hit.combined_score = f64::from(hit.similarity) * 0.6 + (quality / 100.0) * 0.4;
            kept.push(hit);
        }

        kept.sort_by(|a, b| b.combined_score.total_cmp(&a.combined_score));
        kept.truncate(top_k);

        let now = Utc::now().to_rfc3339();
        for hit in &kept {
            sqlx::query("UPDATE memories SET last_used = ? WHERE id = ?")
                .bind(&now)
                .bind(hit.id)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(kept)
    }

    /// Fold one rating into the record's quality signals:
    /// quality = 0.4 * (avg_rating / 5 * 100)
    ///         + 0.4 * helpful_rate * 100
    ///         + 0.2 * min(1, feedback_count / 10) * 100
    pub async fn update_solution_feedback(
        &self,
        id: i64,
        rating: u8,
        is_helpful: bool,
    ) -> Result<()> {
        let rating = f64::from(rating.clamp(1, 5));

        let row = sqlx::query(
            "SELECT feedback_count, avg_rating, is_helpful_count FROM memories WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            warn!(id, "feedback for unknown memory");
            return Ok(());
        };

        let feedback_count = row.get::<Option<i64>, _>("feedback_count").unwrap_or(0) + 1;
        let prior_avg = row.get::<Option<f64>, _>("avg_rating").unwrap_or(0.0);
        let helpful_count = row.get::<Option<i64>, _>("is_helpful_count").unwrap_or(0)
            + i64::from(is_helpful);

        let avg_rating = (prior_avg * (feedback_count - 1) as f64 + rating) / feedback_count as f64;
        let helpful_rate = helpful_count as f64 / feedback_count as f64;
        let feedback_bonus = (feedback_count as f64 / 10.0).min(1.0);
        let quality_score =
            (avg_rating / 5.0) * 40.0 + helpful_rate * 40.0 + feedback_bonus * 20.0;

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            r#"
            UPDATE memories
            SET feedback_count = ?, avg_rating = ?, is_helpful_count = ?, quality_score = ?
            WHERE id = ?
            "#,
        )
        .bind(feedback_count)
        .bind(avg_rating)
        .bind(helpful_count)
        .bind(quality_score)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        debug!(id, quality_score, "memory feedback applied");
        Ok(())
    }

    pub async fn get_record(&self, id: i64) -> Result<Option<MemoryRecord>> {
        let row = sqlx::query("SELECT * FROM memories WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|row| MemoryRecord {
            id: row.get("id"),
            task: row.get("task"),
            solution: row.get("solution"),
            agent: row.get("agent"),
            metadata: parse_metadata(row.get::<Option<String>, _>("metadata")),
            created_at: parse_timestamp(row.get::<String, _>("created_at")),
            success_count: row.get::<Option<i64>, _>("success_count").unwrap_or(1),
            quality_score: row.get::<Option<f64>, _>("quality_score").unwrap_or(0.0),
            feedback_count: row.get::<Option<i64>, _>("feedback_count").unwrap_or(0),
            avg_rating: row.get::<Option<f64>, _>("avg_rating").unwrap_or(0.0),
            helpful_count: row.get::<Option<i64>, _>("is_helpful_count").unwrap_or(0),
            last_used: row
                .get::<Option<String>, _>("last_used")
                .map(parse_timestamp),
        }))
    }

    // ---- model performance ----

    pub async fn record_model_result(
        &self,
        model: &str,
        task_type: TaskType,
        success: bool,
        quality: Option<f64>,
        duration_secs: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO model_task_stats (model, task_type, success_count, failure_count, sum_quality, sum_duration, samples)
            VALUES (?, ?, ?, ?, ?, ?, 1)
            ON CONFLICT (model, task_type) DO UPDATE SET
                success_count = success_count + excluded.success_count,
                failure_count = failure_count + excluded.failure_count,
                sum_quality = sum_quality + excluded.sum_quality,
                sum_duration = sum_duration + excluded.sum_duration,
                samples = samples + 1
            "#,
        )
        .bind(model)
        .bind(task_type.as_str())
        .bind(i64::from(success))
        .bind(i64::from(!success))
        .bind(quality.unwrap_or(0.0))
        .bind(duration_secs)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_best_model_for_task_type(
        &self,
        task_type: TaskType,
    ) -> Result<Option<ModelRecommendation>> {
        let row = sqlx::query(
            r#"
            SELECT model,
                   CAST(success_count AS REAL) / MAX(samples, 1) AS success_rate,
                   sum_quality / MAX(samples, 1) AS avg_quality,
                   sum_duration / MAX(samples, 1) AS avg_duration,
                   samples
            FROM model_task_stats
            WHERE task_type = ? AND samples > 0
            ORDER BY success_rate DESC, avg_quality DESC
            LIMIT 1
            "#,
        )
        .bind(task_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|row| ModelRecommendation {
            model: row.get("model"),
            success_rate: row.get("success_rate"),
            avg_quality: row.get("avg_quality"),
            avg_duration: row.get("avg_duration"),
            samples: row.get("samples"),
        }))
    }

    // ---- failures ----

    pub async fn save_failed_task(
        &self,
        task: &str,
        agent: Option<&str>,
        error_kind: &str,
        error_message: &str,
        error_context: Map<String, Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO failed_tasks (task, agent, error_kind, error_message, error_context, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task)
        .bind(agent)
        .bind(error_kind)
        .bind(error_message)
        .bind(serde_json::to_string(&error_context)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn recent_failures(
        &self,
        agent: Option<&str>,
        limit: usize,
    ) -> Result<Vec<FailedTaskRecord>> {
        let rows = match agent {
            Some(agent) => {
                sqlx::query(
                    "SELECT * FROM failed_tasks WHERE agent = ? ORDER BY created_at DESC LIMIT ?",
                )
                .bind(agent)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM failed_tasks ORDER BY created_at DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|row| FailedTaskRecord {
                id: row.get("id"),
                task: row.get("task"),
                agent: row.get("agent"),
                error_kind: row.get("error_kind"),
                error_message: row.get("error_message"),
                error_context: parse_metadata(row.get::<Option<String>, _>("error_context")),
                created_at: parse_timestamp(row.get::<String, _>("created_at")),
            })
            .collect())
    }

    /// Warning block listing prior errors on tasks that look like this one,
    /// or an empty string.
    pub async fn get_error_avoidance_prompt(&self, task: &str, agent: Option<&str>) -> String {
        let failures = match self.recent_failures(agent, 20).await {
            Ok(failures) => failures,
            Err(err) => {
                debug!(error = %err, "failed-task lookup degraded to empty");
                return String::new();
            }
        };

        let mut relevant: Vec<&FailedTaskRecord> = failures
            .iter()
            .filter(|f| word_overlap(task, &f.task) >= ERROR_OVERLAP_THRESHOLD)
            .collect();
        if relevant.is_empty() {
            return String::new();
        }
        relevant.truncate(3);

        let mut block = String::from(
            "\n### WARNINGS FROM PAST FAILURES ON SIMILAR TASKS:\n(avoid repeating these errors)\n",
        );
        for failure in relevant {
            block.push_str(&format!(
                "- [{}] {}\n",
                failure.error_kind, failure.error_message
            ));
        }
        block
    }

    // ---- preferences ----

    pub async fn save_user_preference(&self, user_id: &str, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_preferences (user_id, key, value) VALUES (?, ?, ?)
            ON CONFLICT (user_id, key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(user_id)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_personalization_prompt(&self, user_id: &str) -> String {
        let rows = match sqlx::query(
            "SELECT key, value FROM user_preferences WHERE user_id = ? ORDER BY key",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        {
            Ok(rows) => rows,
            Err(err) => {
                debug!(error = %err, "preference lookup degraded to empty");
                return String::new();
            }
        };
        if rows.is_empty() {
            return String::new();
        }

        let mut block = String::from("\n### USER PREFERENCES:\n");
        for row in rows {
            let key: String = row.get("key");
            let value: String = row.get("value");
            block.push_str(&format!("- {}: {}\n", key, value));
        }
        block
    }

    // ---- few-shot ----

    /// Formatted examples section built from high-quality similar
    /// solutions, or an empty string when there are none.
    pub async fn get_few_shot_block(
        &self,
        task: &str,
        max_examples: usize,
        min_quality: f64,
    ) -> String {
        let hits = match self
            .search_similar_tasks_with_quality(task, max_examples, min_quality)
            .await
        {
            Ok(hits) => hits,
            Err(err) => {
                debug!(error = %err, "few-shot lookup degraded to empty");
                return String::new();
            }
        };
        if hits.is_empty() {
            return String::new();
        }

        let mut block = String::from(
            "\n\n### SUCCESSFUL EXAMPLES FROM PREVIOUS TASKS:\n(use these as reference for similar solutions)\n",
        );
        for (i, hit) in hits.iter().enumerate() {
            let task_text: String = hit.task.chars().take(300).collect();
            let solution_text: String = hit.solution.chars().take(800).collect();
            block.push_str(&format!(
                "\n**Example {}** (quality: {:.0}%, similarity: {:.0}%):\nTask: {}\n",
                i + 1,
                hit.quality_score,
                hit.similarity * 100.0,
                task_text
            ));
            if hit.solution.chars().count() > 800 {
                block.push_str(&format!("Solution (truncated):\n{}...\n", solution_text));
            } else {
                block.push_str(&format!("Solution:\n{}\n", solution_text));
            }
        }
        block.push_str("\n### END OF EXAMPLES\nNow solve the current task, using the examples as reference if helpful.\n");
        block
    }

    /// How well the store is learning: totals, feedback coverage, and
    /// the agents producing the best-rated work.
    pub async fn learning_stats(&self) -> Result<LearningStats> {
        let totals = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COALESCE(SUM(CASE WHEN feedback_count > 0 THEN 1 ELSE 0 END), 0) AS with_feedback,
                   COALESCE(AVG(quality_score), 0.0) AS avg_quality,
                   COALESCE(SUM(is_helpful_count) * 1.0 / NULLIF(SUM(feedback_count), 0), 0.0) AS helpful_rate
            FROM memories
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let top_agents = sqlx::query(
            r#"
            SELECT agent, AVG(quality_score) AS avg_quality, COUNT(*) AS solutions
            FROM memories
            WHERE agent IS NOT NULL AND feedback_count > 0
            GROUP BY agent
            ORDER BY avg_quality DESC
            LIMIT 5
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(LearningStats {
            total_memories: totals.get("total"),
            with_feedback: totals.get("with_feedback"),
            avg_quality: totals.get("avg_quality"),
            helpful_rate: totals.get("helpful_rate"),
            top_agents: top_agents
                .into_iter()
                .map(|row| AgentQuality {
                    agent: row.get("agent"),
                    avg_quality: row.get("avg_quality"),
                    solutions: row.get("solutions"),
                })
                .collect(),
        })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LearningStats {
    pub total_memories: i64,
    pub with_feedback: i64,
    pub avg_quality: f64,
    pub helpful_rate: f64,
    pub top_agents: Vec<AgentQuality>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AgentQuality {
    pub agent: String,
    pub avg_quality: f64,
    pub solutions: i64,
}

fn db_err(err: sqlx::Error) -> EnsembleError {
    EnsembleError::Memory(err.to_string())
}

fn parse_metadata(raw: Option<String>) -> Map<String, Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn parse_timestamp(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn word_overlap(a: &str, b: &str) -> f32 {
    let tokens = |s: &str| -> HashSet<String> {
        s.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 2)
            .map(str::to_string)
            .collect()
    };
    let set_a = tokens(a);
    let set_b = tokens(b);
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let shared = set_a.intersection(&set_b).count();
    shared as f32 / set_a.len().min(set_b.len()) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_core::HashingEmbedder;

    async fn store_with_embedder() -> MemoryStore {
        MemoryStore::open_in_memory(
            MemorySettings::default(),
            Some(Arc::new(HashingEmbedder::default())),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn save_and_search_round_trip() {
        let store = store_with_embedder().await;
        store
            .save_solution(
                "sort a list of numbers in python",
                "def sort_numbers(xs):\n    return sorted(xs)",
                Some("code_writer"),
                Map::new(),
                Some("llama3"),
            )
            .await
            .unwrap();

        let hits = store
            .search_similar_tasks("sort numbers python list", 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].similarity > 0.3);
        assert_eq!(hits[0].agent.as_deref(), Some("code_writer"));
        assert_eq!(hits[0].metadata["model_used"], "llama3");
    }

    #[tokio::test]
    async fn substring_fallback_without_embedder() {
        let store = MemoryStore::open_in_memory(MemorySettings::default(), None)
            .await
            .unwrap();
        store
            .save_solution("parse yaml config", "use serde_yaml", None, Map::new(), None)
            .await
            .unwrap();

        let hits = store.search_similar_tasks("yaml", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].similarity, TEXT_SEARCH_SIMILARITY);
        assert!(store.search_similar_tasks("kubernetes", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn feedback_updates_quality_per_formula() {
        let store = store_with_embedder().await;
        let id = store
            .save_solution("task", "a solution body", None, Map::new(), None)
            .await
            .unwrap();

        // Two ratings of 4, both helpful: feedback_count=2, avg=4.0, helpful=2.
        store.update_solution_feedback(id, 4, true).await.unwrap();
        store.update_solution_feedback(id, 4, true).await.unwrap();
        // The scenario under test: one more (5, helpful).
        store.update_solution_feedback(id, 5, true).await.unwrap();

        let record = store.get_record(id).await.unwrap().unwrap();
        assert_eq!(record.feedback_count, 3);
        assert!((record.avg_rating - 13.0 / 3.0).abs() < 1e-9);
        assert_eq!(record.helpful_count, 3);
        let expected = (13.0 / 3.0 / 5.0) * 40.0 + 40.0 + (3.0 / 10.0) * 20.0;
        assert!((record.quality_score - expected).abs() < 1e-9);
        assert!((record.quality_score - 80.666).abs() < 0.01);
    }

    #[tokio::test]
    async fn quality_weighted_search_orders_by_combined_score() {
        let store = store_with_embedder().await;
        let low = store
            .save_solution("sort numbers quickly", "bubble sort", None, Map::new(), None)
            .await
            .unwrap();
        let high = store
            .save_solution("sort numbers quickly", "tim sort", None, Map::new(), None)
            .await
            .unwrap();
        store.update_solution_feedback(high, 5, true).await.unwrap();
        store.update_solution_feedback(low, 1, false).await.unwrap();

        let hits = store
            .search_similar_tasks_with_quality("sort numbers quickly", 2, 0.0)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, high);
        assert!(hits[0].combined_score > hits[1].combined_score);

        let record = store.get_record(high).await.unwrap().unwrap();
        assert!(record.last_used.is_some());
    }

    #[tokio::test]
    async fn min_quality_filters_results() {
        let store = store_with_embedder().await;
        store
            .save_solution("sort numbers", "unrated solution", None, Map::new(), None)
            .await
            .unwrap();
        let hits = store
            .search_similar_tasks_with_quality("sort numbers", 5, 50.0)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn eviction_keeps_higher_quality_rows() {
        let store = MemoryStore::open_in_memory(
            MemorySettings {
                max_memories: 2,
                similarity_threshold: 0.0,
            },
            Some(Arc::new(HashingEmbedder::default())),
        )
        .await
        .unwrap();

        let keep_a = store
            .save_solution("task one", "solution one", None, Map::new(), None)
            .await
            .unwrap();
        store.update_solution_feedback(keep_a, 5, true).await.unwrap();
        let evicted = store
            .save_solution("task two", "solution two", None, Map::new(), None)
            .await
            .unwrap();
        let keep_b = store
            .save_solution("task three", "solution three", None, Map::new(), None)
            .await
            .unwrap();
        store.update_solution_feedback(keep_b, 4, true).await.unwrap();
        store.cleanup_if_needed().await.unwrap();

        assert_eq!(store.count().await.unwrap(), 2);
        assert!(store.get_record(keep_a).await.unwrap().is_some());
        assert!(store.get_record(evicted).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn model_stats_pick_the_best_performer() {
        let store = store_with_embedder().await;
        for _ in 0..3 {
            store
                .record_model_result("strong-model", TaskType::Code, true, Some(90.0), 2.0)
                .await
                .unwrap();
        }
        store
            .record_model_result("weak-model", TaskType::Code, false, Some(30.0), 1.0)
            .await
            .unwrap();
        store
            .record_model_result("weak-model", TaskType::Code, true, Some(40.0), 1.0)
            .await
            .unwrap();

        let best = store
            .get_best_model_for_task_type(TaskType::Code)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(best.model, "strong-model");
        assert!((best.success_rate - 1.0).abs() < 1e-9);
        assert_eq!(best.samples, 3);
        assert!((best.avg_quality - 90.0).abs() < 1e-9);

        assert!(store
            .get_best_model_for_task_type(TaskType::Chat)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn error_avoidance_prompt_matches_similar_tasks() {
        let store = store_with_embedder().await;
        store
            .save_failed_task(
                "parse the csv file with pandas",
                Some("data_analysis"),
                "ToolError",
                "file not found: data.csv",
                Map::new(),
            )
            .await
            .unwrap();

        let prompt = store
            .get_error_avoidance_prompt("parse another csv file with pandas", Some("data_analysis"))
            .await;
        assert!(prompt.contains("file not found"));
        assert!(prompt.contains("WARNINGS FROM PAST FAILURES"));

        let unrelated = store
            .get_error_avoidance_prompt("deploy a web server", Some("data_analysis"))
            .await;
        assert!(unrelated.is_empty());
    }

    #[tokio::test]
    async fn preferences_format_into_prompt() {
        let store = store_with_embedder().await;
        store
            .save_user_preference("default", "language", "Rust")
            .await
            .unwrap();
        store
            .save_user_preference("default", "style", "concise")
            .await
            .unwrap();

        let prompt = store.get_personalization_prompt("default").await;
        assert!(prompt.contains("language: Rust"));
        assert!(prompt.contains("style: concise"));
        assert!(store.get_personalization_prompt("someone-else").await.is_empty());
    }

    #[tokio::test]
    async fn few_shot_block_formats_examples() {
        let store = store_with_embedder().await;
        let id = store
            .save_solution(
                "reverse a string in python",
                "def reverse(s):\n    return s[::-1]",
                Some("code_writer"),
                Map::new(),
                None,
            )
            .await
            .unwrap();
        store.update_solution_feedback(id, 5, true).await.unwrap();

        let block = store
            .get_few_shot_block("reverse a string in python", 2, 50.0)
            .await;
        assert!(block.contains("SUCCESSFUL EXAMPLES"));
        assert!(block.contains("reverse(s)"));
        assert!(store.get_few_shot_block("unrelated topic entirely", 2, 50.0).await.is_empty());
    }

    #[tokio::test]
    async fn learning_stats_aggregate_feedback() {
        let store = store_with_embedder().await;
        let rated = store
            .save_solution("task a", "solution a body", Some("code_writer"), Map::new(), None)
            .await
            .unwrap();
        store
            .save_solution("task b", "solution b body", Some("research"), Map::new(), None)
            .await
            .unwrap();
        store.update_solution_feedback(rated, 5, true).await.unwrap();

        let stats = store.learning_stats().await.unwrap();
        assert_eq!(stats.total_memories, 2);
        assert_eq!(stats.with_feedback, 1);
        assert!((stats.helpful_rate - 1.0).abs() < 1e-9);
        assert_eq!(stats.top_agents.len(), 1);
        assert_eq!(stats.top_agents[0].agent, "code_writer");
    }

    #[tokio::test]
    async fn migration_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memories.db");
        {
            let store = MemoryStore::open(&path, MemorySettings::default(), None)
                .await
                .unwrap();
            store
                .save_solution("persisted task", "persisted solution", None, Map::new(), None)
                .await
                .unwrap();
        }
        // Re-opening runs the migrations again over the existing schema.
        let store = MemoryStore::open(&path, MemorySettings::default(), None)
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }
}
