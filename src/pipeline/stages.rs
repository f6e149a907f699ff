//! Stage plans per job type.
//!
//! The plan is resolved once from the job payload and never changes while
//! the job runs. Engine selection (CHARMM vs OpenMM) swaps the stage
//! *implementations*, not the stage names or ordering, so the step trail
//! looks the same to users regardless of engine.

use crate::model::{JobPayload, StageId, StepMap};

/// One entry in a job's stage plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePlan {
    /// The stage to execute.
    pub stage: StageId,
    /// Progress percentage reached when this stage succeeds.
    pub checkpoint: u8,
}

const fn plan(stage: StageId, checkpoint: u8) -> StagePlan {
    StagePlan { stage, checkpoint }
}

/// Resolves the ordered stage plan for a job payload.
pub fn stage_plan(payload: &JobPayload) -> Vec<StagePlan> {
    match payload {
        JobPayload::ClassicPdb { .. } => vec![
            plan(StageId::Pdb2Crd, 10),
            plan(StageId::Minimize, 25),
            plan(StageId::Heat, 40),
            plan(StageId::Md, 60),
            plan(StageId::Dcd2Pdb, 70),
            plan(StageId::Foxs, 80),
            plan(StageId::MultiFoxs, 95),
            plan(StageId::Results, 99),
        ],
        JobPayload::ClassicCrd { .. } => vec![
            plan(StageId::Minimize, 25),
            plan(StageId::Heat, 40),
            plan(StageId::Md, 60),
            plan(StageId::Dcd2Pdb, 70),
            plan(StageId::Foxs, 80),
            plan(StageId::MultiFoxs, 95),
            plan(StageId::Results, 99),
        ],
        JobPayload::Auto { .. } | JobPayload::Alphafold { .. } => vec![
            plan(StageId::Pdb2Crd, 10),
            plan(StageId::Pae, 15),
            plan(StageId::AutoRg, 20),
            plan(StageId::Minimize, 25),
            plan(StageId::Heat, 40),
            plan(StageId::Md, 60),
            plan(StageId::Dcd2Pdb, 70),
            plan(StageId::Foxs, 80),
            plan(StageId::MultiFoxs, 95),
            plan(StageId::Results, 99),
        ],
        JobPayload::Sans { .. } => vec![
            plan(StageId::Pdb2Crd, 10),
            plan(StageId::Minimize, 25),
            plan(StageId::Heat, 40),
            plan(StageId::Md, 60),
            plan(StageId::Dcd2Pdb, 70),
            plan(StageId::PepsiSans, 80),
            plan(StageId::GaSans, 95),
            plan(StageId::Results, 99),
        ],
        JobPayload::Scoper { .. } => vec![plan(StageId::Scoper, 80), plan(StageId::Results, 99)],
    }
}

/// Builds the initial step trail matching a payload's stage plan.
pub fn initial_steps(payload: &JobPayload) -> StepMap {
    let stages: Vec<StageId> = stage_plan(payload).iter().map(|p| p.stage).collect();
    StepMap::for_stages(&stages)
}
