//! Core data model: jobs, step trails and movie assets.

mod assets;
mod job;
mod steps;

pub use assets::{AssetStatus, MovieAsset, MovieOutputs, MovieSource, RenderSettings};
pub use job::{Feedback, Job, JobPayload, JobResults, JobStatus, MdEngine, RgRange};
pub use steps::{StageId, StepMap, StepRecord, StepState};
