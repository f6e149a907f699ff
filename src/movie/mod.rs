//! Asynchronous movie-render sub-pipeline.
//!
//! After the MD stage each trajectory run directory becomes a movie
//! asset. Enqueueing is idempotent (stable per-trajectory task keys) and
//! rendering is resumable (an existing mp4 short-circuits to ready), so
//! job re-runs and queue redeliveries never duplicate work.

mod enqueue;
mod render;

pub use enqueue::{MovieEnqueuer, RenderQueue};
pub use render::MovieRenderer;

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::exec::ExecError;
use crate::scheduler::QueueError;
use crate::store::StoreError;

/// Errors from the movie sub-pipeline.
#[derive(Debug, Error)]
pub enum MovieError {
    /// Storage operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Queue operation failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A render tool failed.
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// The asset record for a render task is missing.
    #[error("movie asset {label} for job {job_id} not found")]
    AssetNotFound {
        /// Owning job.
        job_id: Uuid,
        /// Asset label.
        label: String,
    },

    /// The render tool exited cleanly but produced no movie.
    #[error("render output missing: {}", .0.display())]
    MissingOutput(PathBuf),

    /// Filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable dedup key for a trajectory's render task.
pub(crate) fn movie_task_key(job_id: Uuid, label: &str) -> String {
    format!("{}:movie:{}", job_id, label)
}
