//! Step-trail writer with an explicit persistence policy.
//!
//! Every step update names whether it is critical. Critical writes carry
//! the pipeline's primary progression and their failure aborts the job;
//! best-effort writes are terminal bookkeeping (recording an error that
//! already happened) where failing loudly would mask the original error,
//! so they are logged and swallowed.

use std::sync::Arc;

use tracing::warn;

use crate::model::{Job, StageId, StepState};

use super::{JobStore, StoreError};

/// Writes step-trail updates through a `JobStore`.
#[derive(Clone)]
pub struct StepWriter {
    store: Arc<dyn JobStore>,
}

impl StepWriter {
    /// Creates a writer backed by the given store.
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Updates one step and persists the job.
    ///
    /// # Errors
    ///
    /// Persistence failures are returned only when `critical` is true;
    /// otherwise they are logged and the call succeeds.
    pub async fn set_step(
        &self,
        job: &mut Job,
        stage: StageId,
        state: StepState,
        message: &str,
        critical: bool,
    ) -> Result<(), StoreError> {
        job.steps.set(stage, state, message);

        match self.store.save_job(job).await {
            Ok(()) => Ok(()),
            Err(e) if critical => Err(e),
            Err(e) => {
                warn!(
                    job_id = %job.id,
                    stage = %stage,
                    error = %e,
                    "best-effort step write failed"
                );
                Ok(())
            }
        }
    }

    /// Marks a stage as running. Critical.
    pub async fn mark_running(&self, job: &mut Job, stage: StageId) -> Result<(), StoreError> {
        self.set_step(job, stage, StepState::Running, "", true).await
    }

    /// Marks a stage as succeeded and bumps progress to its checkpoint.
    /// Critical.
    pub async fn mark_success(
        &self,
        job: &mut Job,
        stage: StageId,
        message: &str,
        checkpoint: u8,
    ) -> Result<(), StoreError> {
        job.set_progress(checkpoint);
        self.set_step(job, stage, StepState::Success, message, true)
            .await
    }

    /// Marks a stage as failed. Best-effort: the stage error itself is
    /// what surfaces to the caller, not the bookkeeping write.
    pub async fn mark_error(&self, job: &mut Job, stage: StageId, message: &str) {
        // set_step never errors on best-effort writes
        let _ = self
            .set_step(job, stage, StepState::Error, message, false)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobPayload;
    use crate::store::MemoryJobStore;

    fn sample_job() -> Job {
        let mut job = Job::new(
            "step writer test",
            JobPayload::ClassicCrd {
                crd_file: "m.crd".to_string(),
                psf_file: "m.psf".to_string(),
                const_inp_file: None,
            },
            "saxs.dat",
        );
        job.steps = crate::model::StepMap::for_stages(&[StageId::Minimize, StageId::Heat]);
        job
    }

    #[tokio::test]
    async fn test_critical_write_failure_propagates() {
        let store = Arc::new(MemoryJobStore::new());
        let writer = StepWriter::new(store.clone());
        let mut job = sample_job();

        store.set_fail_saves(true);
        let result = writer.mark_running(&mut job, StageId::Minimize).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_best_effort_write_failure_is_swallowed() {
        let store = Arc::new(MemoryJobStore::new());
        let writer = StepWriter::new(store.clone());
        let mut job = sample_job();

        store.set_fail_saves(true);
        writer
            .mark_error(&mut job, StageId::Minimize, "charmm failed (exit code 1)")
            .await;

        // The in-memory job still carries the update even though the
        // persistence failed.
        let record = job.steps.get(StageId::Minimize).unwrap();
        assert_eq!(record.state, StepState::Error);
        assert!(record.message.contains("exit code 1"));
    }

    #[tokio::test]
    async fn test_mark_success_persists_and_bumps_progress() {
        let store = Arc::new(MemoryJobStore::new());
        let writer = StepWriter::new(store.clone());
        let mut job = sample_job();
        store.seed_job(job.clone()).await;

        writer
            .mark_success(&mut job, StageId::Minimize, "minimization complete", 25)
            .await
            .unwrap();

        assert_eq!(job.progress, 25);
        let saved = store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(saved.progress, 25);
        assert_eq!(
            saved.steps.get(StageId::Minimize).unwrap().state,
            StepState::Success
        );
        assert_eq!(
            saved.steps.get(StageId::Heat).unwrap().state,
            StepState::Waiting
        );
    }
}
