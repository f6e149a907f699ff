//! Job-level stage sequencing.
//!
//! The sequencer drives one job through its stage plan:
//!
//! - every stage transition is persisted before and after the work runs
//! - the first stage error stops the job; later steps stay `Waiting`
//! - after the MD stage the movie sub-pipeline is kicked off without
//!   being awaited
//! - terminal outcomes go through the completion handler
//!
//! There is no stage-level retry here: redelivery is owned by the task
//! queue, and partial artifacts are left on disk for inspection.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::model::{JobStatus, StageId};
use crate::movie::MovieEnqueuer;
use crate::notify::Notifier;
use crate::store::{JobStore, StepWriter, StoreError};

use super::{stage_plan, StageError, StageExecutor};

/// Errors from running a job through the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The queued job ID has no job document.
    #[error("job {0} not found")]
    JobNotFound(Uuid),

    /// A critical persistence write failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A stage's unit of work failed.
    #[error("stage {stage} failed: {source}")]
    Stage {
        /// The failing stage.
        stage: StageId,
        /// The underlying error.
        #[source]
        source: StageError,
    },
}

/// Drives jobs through their stage plans.
pub struct Sequencer<E: StageExecutor> {
    store: Arc<dyn JobStore>,
    steps: StepWriter,
    executor: E,
    notifier: Arc<Notifier>,
    movies: Option<Arc<MovieEnqueuer>>,
}

impl<E: StageExecutor> Sequencer<E> {
    /// Creates a sequencer.
    pub fn new(store: Arc<dyn JobStore>, executor: E, notifier: Arc<Notifier>) -> Self {
        let steps = StepWriter::new(store.clone());
        Self {
            store,
            steps,
            executor,
            notifier,
            movies: None,
        }
    }

    /// Attaches the movie enqueuer, enabling the render sub-pipeline.
    pub fn with_movie_enqueuer(mut self, movies: Arc<MovieEnqueuer>) -> Self {
        self.movies = Some(movies);
        self
    }

    /// Runs one job to a terminal status.
    ///
    /// # Errors
    ///
    /// Returns an error when the job is missing, a critical persistence
    /// write fails, or a stage fails. In the stage-failure case the job
    /// document has already been moved to `Error` (best-effort) before
    /// the error is returned to the queue worker.
    pub async fn run(&self, job_id: Uuid) -> Result<JobStatus, PipelineError> {
        let mut job = self
            .store
            .find_job(job_id)
            .await?
            .ok_or(PipelineError::JobNotFound(job_id))?;

        info!(job_id = %job.id, job_type = job.payload.type_name(), title = %job.title, "starting job");

        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        job.steps.reset();
        self.store.save_job(&job).await?;

        let plan = stage_plan(&job.payload);
        for entry in plan {
            self.steps.mark_running(&mut job, entry.stage).await?;
            info!(job_id = %job.id, stage = %entry.stage, "stage running");

            match self.executor.execute(&mut job, entry.stage).await {
                Ok(summary) => {
                    self.steps
                        .mark_success(&mut job, entry.stage, &summary, entry.checkpoint)
                        .await?;
                    info!(job_id = %job.id, stage = %entry.stage, progress = job.progress, "stage complete");

                    if entry.stage == StageId::Md {
                        self.spawn_movie_enqueue(&job);
                    }
                }
                Err(stage_err) => {
                    error!(job_id = %job.id, stage = %entry.stage, error = %stage_err, "stage failed");
                    self.steps
                        .mark_error(&mut job, entry.stage, &stage_err.to_string())
                        .await;

                    job.status = JobStatus::Error;
                    job.completed_at = Some(Utc::now());
                    if let Err(e) = self.store.save_job(&job).await {
                        warn!(job_id = %job.id, error = %e, "failed to persist terminal error status");
                    }
                    self.notifier.notify_job_complete(&job, true).await;

                    return Err(PipelineError::Stage {
                        stage: entry.stage,
                        source: stage_err,
                    });
                }
            }
        }

        job.status = JobStatus::Completed;
        job.set_progress(100);
        job.completed_at = Some(Utc::now());
        self.store.save_job(&job).await?;
        self.notifier.notify_job_complete(&job, false).await;
        info!(job_id = %job.id, "job completed");

        Ok(JobStatus::Completed)
    }

    /// Kicks off movie enqueueing in the background.
    ///
    /// The pipeline does not wait for renders; a movie failure must never
    /// affect the scientific result.
    fn spawn_movie_enqueue(&self, job: &crate::model::Job) {
        let Some(movies) = self.movies.clone() else {
            return;
        };
        let job = job.clone();
        tokio::spawn(async move {
            if let Err(e) = movies.enqueue_movies(&job).await {
                warn!(job_id = %job.id, error = %e, "movie enqueue failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Job, JobPayload, StepState};
    use crate::pipeline::initial_steps;
    use crate::store::MemoryJobStore;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Scripted executor: succeeds every stage except the ones listed,
    /// recording execution order.
    struct ScriptedExecutor {
        fail_at: Option<StageId>,
        executed: Mutex<Vec<StageId>>,
    }

    impl ScriptedExecutor {
        fn new(fail_at: Option<StageId>) -> Self {
            Self {
                fail_at,
                executed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StageExecutor for ScriptedExecutor {
        async fn execute(&self, _job: &mut Job, stage: StageId) -> Result<String, StageError> {
            self.executed.lock().unwrap().push(stage);
            if self.fail_at == Some(stage) {
                Err(StageError::MissingInput(format!("{stage} blew up")))
            } else {
                Ok(format!("{stage} ok"))
            }
        }
    }

    fn classic_crd_job() -> Job {
        let payload = JobPayload::ClassicCrd {
            crd_file: "m.crd".to_string(),
            psf_file: "m.psf".to_string(),
            const_inp_file: None,
        };
        let mut job = Job::new("sequencer test", payload.clone(), "saxs.dat");
        job.steps = initial_steps(&payload);
        job
    }

    fn sequencer(
        store: Arc<MemoryJobStore>,
        fail_at: Option<StageId>,
    ) -> Sequencer<ScriptedExecutor> {
        Sequencer::new(
            store,
            ScriptedExecutor::new(fail_at),
            Arc::new(Notifier::new(None)),
        )
    }

    #[tokio::test]
    async fn test_successful_run_completes_all_stages() {
        let store = Arc::new(MemoryJobStore::new());
        let job = classic_crd_job();
        let id = job.id;
        store.seed_job(job).await;

        let seq = sequencer(store.clone(), None);
        let status = seq.run(id).await.unwrap();
        assert_eq!(status, JobStatus::Completed);

        let saved = store.find_job(id).await.unwrap().unwrap();
        assert_eq!(saved.status, JobStatus::Completed);
        assert_eq!(saved.progress, 100);
        assert!(saved.started_at.is_some());
        assert!(saved.completed_at.is_some());
        for record in saved.steps.iter() {
            assert_eq!(record.state, StepState::Success);
        }
    }

    #[tokio::test]
    async fn test_failure_leaves_a_prefix_trail() {
        let store = Arc::new(MemoryJobStore::new());
        let job = classic_crd_job();
        let id = job.id;
        store.seed_job(job).await;

        let seq = sequencer(store.clone(), Some(StageId::Heat));
        let err = seq.run(id).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Stage {
                stage: StageId::Heat,
                ..
            }
        ));

        // Nothing after the failing stage ran
        let executed = seq.executor.executed.lock().unwrap().clone();
        assert_eq!(executed, vec![StageId::Minimize, StageId::Heat]);

        let saved = store.find_job(id).await.unwrap().unwrap();
        assert_eq!(saved.status, JobStatus::Error);
        assert_eq!(
            saved.steps.get(StageId::Minimize).unwrap().state,
            StepState::Success
        );
        let heat = saved.steps.get(StageId::Heat).unwrap();
        assert_eq!(heat.state, StepState::Error);
        assert!(heat.message.contains("blew up"));
        for later in [StageId::Md, StageId::Dcd2Pdb, StageId::Foxs] {
            assert_eq!(saved.steps.get(later).unwrap().state, StepState::Waiting);
        }

        // Progress reflects only the completed prefix
        assert_eq!(saved.progress, 25);
    }

    #[tokio::test]
    async fn test_step_trail_is_a_prefix_of_the_plan() {
        let store = Arc::new(MemoryJobStore::new());
        let job = classic_crd_job();
        let id = job.id;
        store.seed_job(job).await;

        let seq = sequencer(store.clone(), Some(StageId::MultiFoxs));
        let _ = seq.run(id).await;

        let saved = store.find_job(id).await.unwrap().unwrap();
        let mut seen_non_success = false;
        let mut states = HashSet::new();
        for record in saved.steps.iter() {
            states.insert(record.state);
            match record.state {
                StepState::Success => assert!(!seen_non_success, "success after failure"),
                _ => seen_non_success = true,
            }
        }
        assert!(states.contains(&StepState::Error));
        assert!(states.contains(&StepState::Waiting));
    }

    #[tokio::test]
    async fn test_missing_job_is_an_error() {
        let store = Arc::new(MemoryJobStore::new());
        let seq = sequencer(store, None);

        let err = seq.run(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, PipelineError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_rerun_resets_stale_steps() {
        let store = Arc::new(MemoryJobStore::new());
        let mut job = classic_crd_job();
        let id = job.id;
        // Simulate a previous failed delivery
        job.steps
            .set(StageId::Minimize, StepState::Error, "old failure");
        job.status = JobStatus::Error;
        store.seed_job(job).await;

        let seq = sequencer(store.clone(), None);
        seq.run(id).await.unwrap();

        let saved = store.find_job(id).await.unwrap().unwrap();
        let minimize = saved.steps.get(StageId::Minimize).unwrap();
        assert_eq!(minimize.state, StepState::Success);
        assert!(!minimize.message.contains("old failure"));
    }
}
