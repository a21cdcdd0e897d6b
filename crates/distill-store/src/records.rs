//! Enrichment records.
//!
//! The rows the handlers read and write: analysis types, analysis runs,
//! embeddings, and facets. Functions come in pairs where the write batcher
//! needs them: a pool variant and a `_tx` variant taking an open
//! connection, so the same statement can run standalone or inside a
//! batched transaction.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::error::StoreError;

/// How an analysis type's output is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
pub enum OutputKind {
    /// JSON the facet extractor can walk.
    Structured,
    /// Prose kept verbatim.
    Freeform,
}

/// Lifecycle of one (analysis type, episode) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// The model declined to answer; terminal and not an error.
    Blocked,
}

impl RunStatus {
    /// Terminal states that idempotency must never re-enter.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Blocked)
    }
}

/// Entity kinds that receive embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
pub enum TargetKind {
    Episode,
    Facet,
    Person,
    Document,
}

impl TargetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetKind::Episode => "episode",
            TargetKind::Facet => "facet",
            TargetKind::Person => "person",
            TargetKind::Document => "document",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "episode" => Some(TargetKind::Episode),
            "facet" => Some(TargetKind::Facet),
            "person" => Some(TargetKind::Person),
            "document" => Some(TargetKind::Document),
            _ => None,
        }
    }
}

/// A configured analysis: prompt template, output handling, and optional
/// facet extraction mappings.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AnalysisType {
    pub id: String,
    pub name: String,
    pub prompt_template: String,
    pub output_kind: OutputKind,
    /// Mapping of facet type -> dotted extraction path, as JSON.
    pub facet_spec: Option<serde_json::Value>,
    /// Response schema forwarded to the model when set.
    pub response_schema: Option<serde_json::Value>,
    pub minimal_thinking: bool,
    pub created_at: DateTime<Utc>,
}

impl AnalysisType {
    pub async fn insert(
        pool: &SqlitePool,
        name: &str,
        prompt_template: &str,
        output_kind: OutputKind,
        facet_spec: Option<serde_json::Value>,
        response_schema: Option<serde_json::Value>,
        minimal_thinking: bool,
    ) -> Result<AnalysisType, StoreError> {
        let id = Uuid::new_v4().to_string();
        let row = sqlx::query_as::<_, AnalysisType>(
            r#"
            INSERT INTO analysis_types
                (id, name, prompt_template, output_kind, facet_spec, response_schema,
                 minimal_thinking, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(name)
        .bind(prompt_template)
        .bind(output_kind)
        .bind(facet_spec)
        .bind(response_schema)
        .bind(minimal_thinking)
        .bind(Utc::now())
        .fetch_one(pool)
        .await?;
        Ok(row)
    }

    pub async fn get(pool: &SqlitePool, id: &str) -> Result<AnalysisType, StoreError> {
        sqlx::query_as::<_, AnalysisType>("SELECT * FROM analysis_types WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "analysis_type",
                id: id.to_string(),
            })
    }
}

/// One execution of an analysis type against an episode. Unique on the
/// (type, episode) pair; that uniqueness is the analysis idempotency key.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AnalysisRun {
    pub id: String,
    pub analysis_type_id: String,
    pub episode_id: String,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output_text: Option<String>,
    pub error_message: Option<String>,
    pub blocked_reason: Option<String>,
    pub retry_count: i64,
}

/// Result of claiming a run for execution.
#[derive(Debug, Clone)]
pub enum BeginRun {
    /// The run already finished; nothing to do.
    AlreadyTerminal(AnalysisRun),
    /// The run is now `running` and owned by the caller.
    Started(AnalysisRun),
}

impl AnalysisRun {
    pub async fn find(
        pool: &SqlitePool,
        analysis_type_id: &str,
        episode_id: &str,
    ) -> Result<Option<AnalysisRun>, StoreError> {
        let row = sqlx::query_as::<_, AnalysisRun>(
            "SELECT * FROM analysis_runs WHERE analysis_type_id = ? AND episode_id = ?",
        )
        .bind(analysis_type_id)
        .bind(episode_id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    /// Claim the (type, episode) run, creating it if absent.
    ///
    /// Returns [`BeginRun::AlreadyTerminal`] without touching the row when
    /// a previous execution completed or was blocked.
    pub async fn begin(
        pool: &SqlitePool,
        analysis_type_id: &str,
        episode_id: &str,
    ) -> Result<BeginRun, StoreError> {
        if let Some(existing) = Self::find(pool, analysis_type_id, episode_id).await? {
            if existing.status.is_terminal() {
                return Ok(BeginRun::AlreadyTerminal(existing));
            }
            let row = sqlx::query_as::<_, AnalysisRun>(
                r#"
                UPDATE analysis_runs
                SET status = 'running',
                    started_at = ?,
                    error_message = NULL,
                    retry_count = retry_count + 1
                WHERE id = ?
                RETURNING *
                "#,
            )
            .bind(Utc::now())
            .bind(&existing.id)
            .fetch_one(pool)
            .await?;
            return Ok(BeginRun::Started(row));
        }

        let id = Uuid::new_v4().to_string();
        let row = sqlx::query_as::<_, AnalysisRun>(
            r#"
            INSERT INTO analysis_runs (id, analysis_type_id, episode_id, status, started_at)
            VALUES (?, ?, ?, 'running', ?)
            ON CONFLICT (analysis_type_id, episode_id) DO UPDATE
                SET status = 'running', started_at = excluded.started_at
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(analysis_type_id)
        .bind(episode_id)
        .bind(Utc::now())
        .fetch_one(pool)
        .await?;
        Ok(BeginRun::Started(row))
    }

    pub async fn mark_completed(
        pool: &SqlitePool,
        id: &str,
        output_text: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE analysis_runs
            SET status = 'completed', completed_at = ?, output_text = ?, error_message = NULL
            WHERE id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(output_text)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_blocked(
        pool: &SqlitePool,
        id: &str,
        reason: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE analysis_runs
            SET status = 'blocked', completed_at = ?, blocked_reason = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(reason)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(pool: &SqlitePool, id: &str, error: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE analysis_runs SET status = 'failed', error_message = ? WHERE id = ?")
            .bind(error)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

/// A dense vector for one (target kind, target id, model) triple.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Embedding {
    pub id: String,
    pub target_kind: TargetKind,
    pub target_id: String,
    pub model: String,
    pub vector: Vec<u8>,
    pub dimension: i64,
    pub text_hash: String,
    pub created_at: DateTime<Utc>,
}

impl Embedding {
    /// Upsert inside an open transaction; the triple is unique and the
    /// newest successful call wins.
    pub async fn upsert_tx(
        conn: &mut SqliteConnection,
        target_kind: TargetKind,
        target_id: &str,
        model: &str,
        vector: &[u8],
        dimension: i64,
        text_hash: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO embeddings
                (id, target_kind, target_id, model, vector, dimension, text_hash, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (target_kind, target_id, model) DO UPDATE
                SET vector = excluded.vector,
                    dimension = excluded.dimension,
                    text_hash = excluded.text_hash,
                    created_at = excluded.created_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(target_kind)
        .bind(target_id)
        .bind(model)
        .bind(vector)
        .bind(dimension)
        .bind(text_hash)
        .bind(Utc::now())
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn upsert(
        pool: &SqlitePool,
        target_kind: TargetKind,
        target_id: &str,
        model: &str,
        vector: &[u8],
        dimension: i64,
        text_hash: &str,
    ) -> Result<(), StoreError> {
        let mut conn = pool.acquire().await?;
        Self::upsert_tx(
            &mut conn, target_kind, target_id, model, vector, dimension, text_hash,
        )
        .await?;
        Ok(())
    }

    pub async fn get(
        pool: &SqlitePool,
        target_kind: TargetKind,
        target_id: &str,
        model: &str,
    ) -> Result<Option<Embedding>, StoreError> {
        let row = sqlx::query_as::<_, Embedding>(
            "SELECT * FROM embeddings WHERE target_kind = ? AND target_id = ? AND model = ?",
        )
        .bind(target_kind)
        .bind(target_id)
        .bind(model)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }
}

/// A structured value extracted from an analysis output.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Facet {
    pub id: String,
    pub analysis_run_id: String,
    pub episode_id: String,
    pub facet_type: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
}

impl Facet {
    pub async fn insert_tx(
        conn: &mut SqliteConnection,
        analysis_run_id: &str,
        episode_id: &str,
        facet_type: &str,
        value: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO facets (id, analysis_run_id, episode_id, facet_type, value, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(analysis_run_id)
        .bind(episode_id)
        .bind(facet_type)
        .bind(value)
        .bind(Utc::now())
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn list_for_run(
        pool: &SqlitePool,
        analysis_run_id: &str,
    ) -> Result<Vec<Facet>, StoreError> {
        let rows = sqlx::query_as::<_, Facet>(
            "SELECT * FROM facets WHERE analysis_run_id = ? ORDER BY created_at, id",
        )
        .bind(analysis_run_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector;

    async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect(&dir.path().join("records.db"), 2)
            .await
            .unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn analysis_run_begin_is_idempotent_after_completion() {
        let (_dir, pool) = test_pool().await;
        let at = AnalysisType::insert(
            &pool,
            "summary",
            "Summarize: {{episode}}",
            OutputKind::Freeform,
            None,
            None,
            false,
        )
        .await
        .unwrap();

        let begun = AnalysisRun::begin(&pool, &at.id, "ep-1").await.unwrap();
        let run = match begun {
            BeginRun::Started(run) => run,
            BeginRun::AlreadyTerminal(_) => panic!("fresh run must start"),
        };
        assert_eq!(run.status, RunStatus::Running);

        AnalysisRun::mark_completed(&pool, &run.id, "a summary")
            .await
            .unwrap();

        match AnalysisRun::begin(&pool, &at.id, "ep-1").await.unwrap() {
            BeginRun::AlreadyTerminal(existing) => {
                assert_eq!(existing.status, RunStatus::Completed);
                assert_eq!(existing.output_text.as_deref(), Some("a summary"));
            }
            BeginRun::Started(_) => panic!("completed run must not restart"),
        }
    }

    #[tokio::test]
    async fn failed_run_restarts_with_retry_count() {
        let (_dir, pool) = test_pool().await;
        let at = AnalysisType::insert(
            &pool,
            "summary",
            "Summarize: {{episode}}",
            OutputKind::Freeform,
            None,
            None,
            false,
        )
        .await
        .unwrap();

        let run = match AnalysisRun::begin(&pool, &at.id, "ep-1").await.unwrap() {
            BeginRun::Started(run) => run,
            BeginRun::AlreadyTerminal(_) => unreachable!(),
        };
        AnalysisRun::mark_failed(&pool, &run.id, "boom").await.unwrap();

        let retried = match AnalysisRun::begin(&pool, &at.id, "ep-1").await.unwrap() {
            BeginRun::Started(run) => run,
            BeginRun::AlreadyTerminal(_) => panic!("failed run must be retryable"),
        };
        assert_eq!(retried.id, run.id);
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.status, RunStatus::Running);
        assert_eq!(retried.error_message, None);
    }

    #[tokio::test]
    async fn blocked_run_is_terminal() {
        let (_dir, pool) = test_pool().await;
        let at = AnalysisType::insert(
            &pool,
            "summary",
            "Summarize: {{episode}}",
            OutputKind::Freeform,
            None,
            None,
            false,
        )
        .await
        .unwrap();

        let run = match AnalysisRun::begin(&pool, &at.id, "ep-1").await.unwrap() {
            BeginRun::Started(run) => run,
            BeginRun::AlreadyTerminal(_) => unreachable!(),
        };
        AnalysisRun::mark_blocked(&pool, &run.id, "SAFETY").await.unwrap();

        match AnalysisRun::begin(&pool, &at.id, "ep-1").await.unwrap() {
            BeginRun::AlreadyTerminal(existing) => {
                assert_eq!(existing.status, RunStatus::Blocked);
                assert_eq!(existing.blocked_reason.as_deref(), Some("SAFETY"));
            }
            BeginRun::Started(_) => panic!("blocked run must not restart"),
        }
    }

    #[tokio::test]
    async fn embedding_upsert_replaces_on_conflict() {
        let (_dir, pool) = test_pool().await;

        let first = vector::pack(&[1.0, 2.0]);
        Embedding::upsert(&pool, TargetKind::Episode, "ep-1", "embed-1", &first, 2, "h1")
            .await
            .unwrap();

        let second = vector::pack(&[3.0, 4.0, 5.0]);
        Embedding::upsert(&pool, TargetKind::Episode, "ep-1", "embed-1", &second, 3, "h2")
            .await
            .unwrap();

        let row = Embedding::get(&pool, TargetKind::Episode, "ep-1", "embed-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.dimension, 3);
        assert_eq!(row.text_hash, "h2");
        assert_eq!(vector::unpack(&row.vector).unwrap(), vec![3.0, 4.0, 5.0]);
        assert_eq!(row.vector.len() as i64, 8 * row.dimension);

        // Different model is a distinct row.
        Embedding::upsert(&pool, TargetKind::Episode, "ep-1", "embed-2", &first, 2, "h1")
            .await
            .unwrap();
        assert!(Embedding::get(&pool, TargetKind::Episode, "ep-1", "embed-2")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn facets_attach_to_runs() {
        let (_dir, pool) = test_pool().await;
        let at = AnalysisType::insert(
            &pool,
            "entities",
            "Extract: {{episode}}",
            OutputKind::Structured,
            Some(serde_json::json!({"person": "people[].name"})),
            None,
            false,
        )
        .await
        .unwrap();
        let run = match AnalysisRun::begin(&pool, &at.id, "ep-9").await.unwrap() {
            BeginRun::Started(run) => run,
            BeginRun::AlreadyTerminal(_) => unreachable!(),
        };

        let mut conn = pool.acquire().await.unwrap();
        Facet::insert_tx(&mut conn, &run.id, "ep-9", "person", "Ada")
            .await
            .unwrap();
        Facet::insert_tx(&mut conn, &run.id, "ep-9", "person", "Grace")
            .await
            .unwrap();
        drop(conn);

        let facets = Facet::list_for_run(&pool, &run.id).await.unwrap();
        assert_eq!(facets.len(), 2);
        assert!(facets.iter().all(|f| f.facet_type == "person"));
    }
}
