//! Per-stage status tracking for pipeline jobs.
//!
//! Every job carries an ordered step trail that mirrors its stage plan.
//! The trail is fixed when the job is created and each entry moves through
//! `Waiting -> Running -> Success | Error` as the sequencer advances.

use serde::{Deserialize, Serialize};

/// Identifier for a pipeline stage.
///
/// The set of stages a job runs is determined by its payload type and
/// MD engine; see the pipeline module for the stage plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    /// Convert an input PDB structure to CHARMM coordinate/topology files.
    Pdb2Crd,
    /// Derive MD constraints from a predicted aligned error matrix.
    Pae,
    /// Estimate the radius-of-gyration range from the scattering profile.
    AutoRg,
    /// Energy minimization of the starting structure.
    Minimize,
    /// Heating run to bring the system to simulation temperature.
    Heat,
    /// Molecular dynamics production runs, one per target Rg.
    Md,
    /// Extract individual conformer PDBs from the MD trajectories.
    Dcd2Pdb,
    /// Compute theoretical SAXS profiles per conformer.
    Foxs,
    /// Multi-state ensemble selection against the experimental profile.
    MultiFoxs,
    /// SANS profile computation per conformer.
    PepsiSans,
    /// SANS ensemble analysis.
    GaSans,
    /// KGS conformer generation and IonNet scoring for RNA jobs.
    Scoper,
    /// Parse reports, assemble ensemble PDBs and attach results.
    Results,
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StageId::Pdb2Crd => "pdb2crd",
            StageId::Pae => "pae",
            StageId::AutoRg => "autorg",
            StageId::Minimize => "minimize",
            StageId::Heat => "heat",
            StageId::Md => "md",
            StageId::Dcd2Pdb => "dcd2pdb",
            StageId::Foxs => "foxs",
            StageId::MultiFoxs => "multifoxs",
            StageId::PepsiSans => "pepsisans",
            StageId::GaSans => "gasans",
            StageId::Scoper => "scoper",
            StageId::Results => "results",
        };
        write!(f, "{}", name)
    }
}

/// Status of a single pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    /// The step has not started yet.
    Waiting,
    /// The step is currently executing.
    Running,
    /// The step finished successfully.
    Success,
    /// The step failed; the message holds the error text.
    Error,
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepState::Waiting => write!(f, "waiting"),
            StepState::Running => write!(f, "running"),
            StepState::Success => write!(f, "success"),
            StepState::Error => write!(f, "error"),
        }
    }
}

/// One entry in a job's step trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Which stage this entry tracks.
    pub stage: StageId,
    /// Current state of the stage.
    pub state: StepState,
    /// Human-readable progress or error message.
    pub message: String,
}

/// Ordered step trail for a job.
///
/// The order matches the job's stage plan and never changes after
/// creation; only the state and message of each entry are updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMap(Vec<StepRecord>);

impl StepMap {
    /// Creates a step trail with one `Waiting` entry per stage.
    pub fn for_stages(stages: &[StageId]) -> Self {
        Self(
            stages
                .iter()
                .map(|&stage| StepRecord {
                    stage,
                    state: StepState::Waiting,
                    message: String::new(),
                })
                .collect(),
        )
    }

    /// Overwrites the state and message for the named stage.
    ///
    /// Unknown stages are ignored; the trail shape is fixed at creation.
    pub fn set(&mut self, stage: StageId, state: StepState, message: impl Into<String>) {
        if let Some(record) = self.0.iter_mut().find(|r| r.stage == stage) {
            record.state = state;
            record.message = message.into();
        }
    }

    /// Returns the record for the named stage, if present.
    pub fn get(&self, stage: StageId) -> Option<&StepRecord> {
        self.0.iter().find(|r| r.stage == stage)
    }

    /// Resets every entry back to `Waiting` with an empty message.
    ///
    /// Called when a job (re)starts so stale state from a previous
    /// delivery does not leak into the new run.
    pub fn reset(&mut self) {
        for record in &mut self.0 {
            record.state = StepState::Waiting;
            record.message.clear();
        }
    }

    /// Iterates over the records in stage order.
    pub fn iter(&self) -> impl Iterator<Item = &StepRecord> {
        self.0.iter()
    }

    /// Returns the number of steps in the trail.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns whether the trail is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
