//! PostgreSQL-backed job store.
//!
//! Jobs and movie assets are stored as JSONB documents with a few indexed
//! columns pulled out for querying. The asset table is keyed by
//! `(job_id, label)` so upserts match-by-label: a re-enqueue of the same
//! trajectory updates the existing row instead of growing a list.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

use crate::model::{Job, MovieAsset};

use super::{JobStore, StoreError};

/// Idempotent schema statements, applied in order at startup.
const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id UUID PRIMARY KEY,
        title TEXT NOT NULL,
        job_type VARCHAR(32) NOT NULL,
        status VARCHAR(16) NOT NULL,
        progress SMALLINT NOT NULL DEFAULT 0,
        document JSONB NOT NULL,
        submitted_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status)",
    r#"
    CREATE TABLE IF NOT EXISTS movie_assets (
        job_id UUID NOT NULL,
        label TEXT NOT NULL,
        status VARCHAR(16) NOT NULL,
        document JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (job_id, label)
    )
    "#,
];

/// PostgreSQL job store.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    /// Connects to the database and returns a new store.
    ///
    /// # Arguments
    ///
    /// * `database_url` - PostgreSQL connection string
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Creates a store from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the schema. Idempotent; safe to run on every startup.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn find_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query("SELECT document FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let document: serde_json::Value = row.try_get("document")?;
                let job: Job = serde_json::from_value(document)?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        let document = serde_json::to_value(job)?;

        sqlx::query(
            r#"
            INSERT INTO jobs (id, title, job_type, status, progress, document, submitted_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                title = EXCLUDED.title,
                status = EXCLUDED.status,
                progress = EXCLUDED.progress,
                document = EXCLUDED.document,
                updated_at = NOW()
            "#,
        )
        .bind(job.id)
        .bind(&job.title)
        .bind(job.payload.type_name())
        .bind(job.status.to_string())
        .bind(job.progress as i16)
        .bind(&document)
        .bind(job.submitted_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_movie_asset(&self, job_id: Uuid, asset: &MovieAsset) -> Result<(), StoreError> {
        let document = serde_json::to_value(asset)?;

        sqlx::query(
            r#"
            INSERT INTO movie_assets (job_id, label, status, document, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (job_id, label) DO UPDATE SET
                status = EXCLUDED.status,
                document = EXCLUDED.document,
                updated_at = NOW()
            "#,
        )
        .bind(job_id)
        .bind(&asset.label)
        .bind(asset.status.to_string())
        .bind(&document)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_movie_asset(
        &self,
        job_id: Uuid,
        label: &str,
    ) -> Result<Option<MovieAsset>, StoreError> {
        let row = sqlx::query("SELECT document FROM movie_assets WHERE job_id = $1 AND label = $2")
            .bind(job_id)
            .bind(label)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let document: serde_json::Value = row.try_get("document")?;
                let asset: MovieAsset = serde_json::from_value(document)?;
                Ok(Some(asset))
            }
            None => Ok(None),
        }
    }

    async fn list_movie_assets(&self, job_id: Uuid) -> Result<Vec<MovieAsset>, StoreError> {
        let rows =
            sqlx::query("SELECT document FROM movie_assets WHERE job_id = $1 ORDER BY label")
                .bind(job_id)
                .fetch_all(&self.pool)
                .await?;

        let mut assets = Vec::with_capacity(rows.len());
        for row in rows {
            let document: serde_json::Value = row.try_get("document")?;
            assets.push(serde_json::from_value(document)?);
        }
        Ok(assets)
    }
}
