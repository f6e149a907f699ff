//! Stage sequencing and tool execution.
//!
//! The sequencer owns job-level control flow: resolve the stage plan,
//! drive each stage through a `StageExecutor`, keep the step trail and
//! progress current, and hand terminal outcomes to the completion
//! handler. `ToolExecutor` is the production executor that renders input
//! decks and supervises the scientific binaries.

mod sequencer;
mod stages;
mod tools;

pub use sequencer::{PipelineError, Sequencer};
pub use stages::{initial_steps, stage_plan, StagePlan};
pub use tools::ToolExecutor;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::ensemble::AssembleError;
use crate::exec::ExecError;
use crate::hpc::HpcError;
use crate::model::{Job, StageId};

/// Errors a stage's unit of work can produce.
#[derive(Debug, Error)]
pub enum StageError {
    /// An external tool failed to start, timed out, or exited non-zero.
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// Rendering an input deck failed.
    #[error("template error: {0}")]
    Template(#[from] tera::Error),

    /// A tool exited successfully but its expected output is missing.
    #[error("expected output missing: {}", .0.display())]
    MissingArtifact(PathBuf),

    /// The job document lacks an input this stage requires.
    #[error("missing input: {0}")]
    MissingInput(String),

    /// A tool's structured output could not be parsed.
    #[error("failed to parse tool output: {0}")]
    BadArtifact(#[from] serde_json::Error),

    /// A tool's output parsed but holds an unusable value.
    #[error("invalid tool output: {0}")]
    InvalidArtifact(String),

    /// Ensemble PDB assembly failed.
    #[error(transparent)]
    Assemble(#[from] AssembleError),

    /// The remote HPC service rejected or failed the work.
    #[error(transparent)]
    Hpc(#[from] HpcError),

    /// Filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Executes a single stage's unit of work.
///
/// Implemented by `ToolExecutor` in production; tests substitute scripted
/// executors so sequencer behavior can be verified without the binaries.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Runs one stage for the job, returning a short summary message for
    /// the step trail.
    async fn execute(&self, job: &mut Job, stage: StageId) -> Result<String, StageError>;
}
