//! Job definitions for the pipeline.
//!
//! A `Job` is the persistent document the worker operates on: the input
//! files, the MD engine selection, the overall status/progress, the ordered
//! step trail and (eventually) the parsed ensemble results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ensemble::Ensemble;

use super::steps::StepMap;

/// Default number of conformational sampling multipliers for MD runs.
const DEFAULT_CONFORMATIONAL_SAMPLING: u32 = 1;

/// Overall lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted but not yet queued for processing.
    Submitted,
    /// Queued, waiting for a worker.
    Pending,
    /// A worker is executing the stage plan.
    Running,
    /// All stages finished successfully.
    Completed,
    /// A stage failed; the step trail names the failing stage.
    Error,
    /// The queue gave up after exhausting delivery attempts.
    Failed,
    /// The job was cancelled before completion.
    Cancelled,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Submitted => write!(f, "submitted"),
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Error => write!(f, "error"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Which molecular dynamics engine runs the minimize/heat/md stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MdEngine {
    /// Classic CHARMM input decks.
    Charmm,
    /// OpenMM driven through Python stage scripts.
    OpenMm,
}

impl std::fmt::Display for MdEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MdEngine::Charmm => write!(f, "charmm"),
            MdEngine::OpenMm => write!(f, "openmm"),
        }
    }
}

/// Radius-of-gyration range driving the MD fan-out, in Angstroms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RgRange {
    /// Smallest target Rg.
    pub min: u32,
    /// Largest target Rg.
    pub max: u32,
}

/// Type-specific job inputs.
///
/// Each variant carries only the files that job type actually needs, so a
/// CRD job cannot exist without its topology and an AlphaFold job cannot
/// exist without its PAE matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    /// Classic run starting from a PDB structure.
    ClassicPdb {
        /// Input structure file.
        pdb_file: String,
        /// Optional user-supplied CHARMM constraint file.
        #[serde(default)]
        const_inp_file: Option<String>,
    },
    /// Classic run starting from pre-built CHARMM coordinates.
    ClassicCrd {
        /// Coordinate file.
        crd_file: String,
        /// Topology file.
        psf_file: String,
        /// Optional user-supplied CHARMM constraint file.
        #[serde(default)]
        const_inp_file: Option<String>,
    },
    /// Automatic run deriving constraints from a PAE matrix.
    Auto {
        /// Input structure file.
        pdb_file: String,
        /// Predicted aligned error matrix (JSON).
        pae_file: String,
    },
    /// Run against an AlphaFold prediction and its PAE matrix.
    Alphafold {
        /// Top-ranked predicted structure.
        pdb_file: String,
        /// Predicted aligned error matrix (JSON).
        pae_file: String,
    },
    /// Small-angle neutron scattering run.
    Sans {
        /// Input structure file.
        pdb_file: String,
        /// Deuterium oxide fraction of the solvent, 0.0 to 1.0.
        d2o_fraction: f64,
    },
    /// RNA conformer generation and scoring run.
    Scoper {
        /// Input structure file.
        pdb_file: String,
    },
}

impl JobPayload {
    /// Returns a short name for the job type, used in logs and queries.
    pub fn type_name(&self) -> &'static str {
        match self {
            JobPayload::ClassicPdb { .. } => "classic_pdb",
            JobPayload::ClassicCrd { .. } => "classic_crd",
            JobPayload::Auto { .. } => "auto",
            JobPayload::Alphafold { .. } => "alphafold",
            JobPayload::Sans { .. } => "sans",
            JobPayload::Scoper { .. } => "scoper",
        }
    }
}

/// Parsed results attached to a completed job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResults {
    /// One ensemble per ensemble size reported by the selection tool.
    pub ensembles: Vec<Ensemble>,
}

/// Quality-of-fit feedback derived from the selected ensembles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    /// Ensemble size whose top-ranked model fits best.
    pub best_ensemble_size: u32,
    /// Goodness-of-fit score of that model.
    pub best_chi2: f64,
}

/// A pipeline job document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier; also names the job's working directory.
    pub id: Uuid,
    /// Human-readable job title.
    pub title: String,
    /// Type-specific inputs.
    pub payload: JobPayload,
    /// Engine used for the MD stages.
    pub md_engine: MdEngine,
    /// Overall lifecycle status.
    pub status: JobStatus,
    /// Completion percentage, 0-100. Never decreases within a run.
    pub progress: u8,
    /// Ordered per-stage status trail.
    pub steps: StepMap,
    /// Experimental scattering profile the results are fit against.
    pub data_file: String,
    /// Multiplier for the amount of MD sampling per Rg.
    pub conformational_sampling: u32,
    /// Target Rg range; user-supplied or filled in by the autorg stage.
    #[serde(default)]
    pub rg_range: Option<RgRange>,
    /// Parsed ensemble results, present once the results stage has run.
    #[serde(default)]
    pub results: Option<JobResults>,
    /// Fit-quality summary, present once the results stage has run.
    #[serde(default)]
    pub feedback: Option<Feedback>,
    /// Where the completion notification is sent.
    #[serde(default)]
    pub recipient: Option<String>,
    /// When the job was submitted.
    pub submitted_at: DateTime<Utc>,
    /// When a worker started executing the stage plan.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a new job in `Submitted` state with an empty step trail.
    ///
    /// The step trail is filled in from the stage plan before the job is
    /// enqueued; see the pipeline module.
    pub fn new(title: impl Into<String>, payload: JobPayload, data_file: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            payload,
            md_engine: MdEngine::Charmm,
            status: JobStatus::Submitted,
            progress: 0,
            steps: StepMap::for_stages(&[]),
            data_file: data_file.into(),
            conformational_sampling: DEFAULT_CONFORMATIONAL_SAMPLING,
            rg_range: None,
            results: None,
            feedback: None,
            recipient: None,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Sets the MD engine.
    pub fn with_md_engine(mut self, engine: MdEngine) -> Self {
        self.md_engine = engine;
        self
    }

    /// Sets the notification recipient.
    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    /// Sets the target Rg range.
    pub fn with_rg_range(mut self, min: u32, max: u32) -> Self {
        self.rg_range = Some(RgRange { min, max });
        self
    }

    /// Sets the conformational sampling multiplier.
    pub fn with_conformational_sampling(mut self, sampling: u32) -> Self {
        self.conformational_sampling = sampling;
        self
    }

    /// Raises the progress percentage, never lowering it.
    pub fn set_progress(&mut self, progress: u8) {
        self.progress = self.progress.max(progress.min(100));
    }

    /// Returns whether the job is in a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Completed | JobStatus::Error | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}
