//! Schema bootstrap.
//!
//! The store owns four tables: the job queue, analysis types, analysis
//! runs, embeddings, and facets. All DDL is idempotent so bootstrap can
//! run on every startup.

use sqlx::SqlitePool;

use crate::error::StoreError;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id               TEXT PRIMARY KEY,
        job_type         TEXT NOT NULL,
        job_key          TEXT NOT NULL,
        payload          BLOB NOT NULL,
        status           TEXT NOT NULL DEFAULT 'pending',
        attempts         INTEGER NOT NULL DEFAULT 0,
        max_attempts     INTEGER NOT NULL DEFAULT 5,
        leased_by        TEXT,
        lease_expires_at TEXT,
        run_after        TEXT,
        last_error       TEXT,
        created_at       TEXT NOT NULL,
        updated_at       TEXT NOT NULL
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS jobs_key_uniq ON jobs (job_key)",
    "CREATE INDEX IF NOT EXISTS jobs_status_idx ON jobs (status, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS analysis_types (
        id               TEXT PRIMARY KEY,
        name             TEXT NOT NULL UNIQUE,
        prompt_template  TEXT NOT NULL,
        output_kind      TEXT NOT NULL,
        facet_spec       TEXT,
        response_schema  TEXT,
        minimal_thinking INTEGER NOT NULL DEFAULT 0,
        created_at       TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS analysis_runs (
        id               TEXT PRIMARY KEY,
        analysis_type_id TEXT NOT NULL REFERENCES analysis_types (id),
        episode_id       TEXT NOT NULL,
        status           TEXT NOT NULL DEFAULT 'pending',
        started_at       TEXT,
        completed_at     TEXT,
        output_text      TEXT,
        error_message    TEXT,
        blocked_reason   TEXT,
        retry_count      INTEGER NOT NULL DEFAULT 0,
        UNIQUE (analysis_type_id, episode_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS analysis_runs_status_idx ON analysis_runs (status)",
    r#"
    CREATE TABLE IF NOT EXISTS embeddings (
        id          TEXT PRIMARY KEY,
        target_kind TEXT NOT NULL,
        target_id   TEXT NOT NULL,
        model       TEXT NOT NULL,
        vector      BLOB NOT NULL,
        dimension   INTEGER NOT NULL,
        text_hash   TEXT NOT NULL,
        created_at  TEXT NOT NULL,
        UNIQUE (target_kind, target_id, model)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS facets (
        id              TEXT PRIMARY KEY,
        analysis_run_id TEXT NOT NULL REFERENCES analysis_runs (id),
        episode_id      TEXT NOT NULL,
        facet_type      TEXT NOT NULL,
        value           TEXT NOT NULL,
        created_at      TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS facets_run_idx ON facets (analysis_run_id)",
    "CREATE INDEX IF NOT EXISTS facets_type_idx ON facets (facet_type)",
];

/// Create any missing tables and indexes.
pub async fn init(pool: &SqlitePool) -> Result<(), StoreError> {
    for ddl in STATEMENTS {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}
