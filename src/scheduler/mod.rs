//! Task scheduling: queue plumbing and worker loops.
//!
//! Two queues share the same Redis reliability mechanics: the pipeline
//! queue carries whole jobs, the movie queue carries per-trajectory
//! render tasks.

mod queue;
mod worker;

pub use queue::{Envelope, QueueError, QueueStats, TaskQueue};
pub use worker::{MovieWorker, PipelineWorker};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A queued pipeline run for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineTask {
    /// Job to run.
    pub job_id: Uuid,
}

/// A queued movie render for one trajectory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovieTask {
    /// Owning job.
    pub job_id: Uuid,
    /// Trajectory run label, e.g. `rg_27`.
    pub label: String,
}
