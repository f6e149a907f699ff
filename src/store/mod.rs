//! Persistent storage for jobs and movie assets.
//!
//! The pipeline talks to storage through the `JobStore` trait so the
//! sequencer and movie workers can be tested against an in-memory
//! implementation. Production uses PostgreSQL via sqlx.

mod database;
mod memory;
mod steps;

pub use database::PgJobStore;
pub use memory::MemoryJobStore;
pub use steps::StepWriter;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{Job, MovieAsset};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Serialization/deserialization of a document failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Job not found.
    #[error("Job {0} not found")]
    JobNotFound(Uuid),
}

/// Storage operations the pipeline depends on.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Retrieves a job by ID, or `None` if it does not exist.
    async fn find_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Saves a job document, inserting or overwriting it.
    async fn save_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Inserts or updates a movie asset, matched by `(job_id, label)`.
    async fn upsert_movie_asset(&self, job_id: Uuid, asset: &MovieAsset) -> Result<(), StoreError>;

    /// Retrieves a movie asset by job and label.
    async fn find_movie_asset(
        &self,
        job_id: Uuid,
        label: &str,
    ) -> Result<Option<MovieAsset>, StoreError>;

    /// Lists all movie assets for a job, ordered by label.
    async fn list_movie_assets(&self, job_id: Uuid) -> Result<Vec<MovieAsset>, StoreError>;
}
