//! Worker loops for the pipeline and movie queues.
//!
//! Each worker runs as an independent async task, pulling envelopes from
//! its queue until a shutdown signal arrives. Retry bookkeeping lives
//! here: attempts are counted per delivery, failed tasks are requeued
//! while attempts remain, and exhausted tasks move to the dead letter
//! queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::model::JobStatus;
use crate::movie::MovieRenderer;
use crate::pipeline::{Sequencer, StageExecutor};
use crate::store::JobStore;

use super::queue::{Envelope, TaskQueue};
use super::{MovieTask, PipelineTask};

/// How long a dequeue blocks before re-checking for shutdown.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Pulls pipeline tasks and runs jobs through the sequencer.
pub struct PipelineWorker<E: StageExecutor> {
    queue: Arc<TaskQueue<PipelineTask>>,
    sequencer: Arc<Sequencer<E>>,
    store: Arc<dyn JobStore>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl<E: StageExecutor + 'static> PipelineWorker<E> {
    /// Creates a pipeline worker.
    pub fn new(
        queue: Arc<TaskQueue<PipelineTask>>,
        sequencer: Arc<Sequencer<E>>,
        store: Arc<dyn JobStore>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            queue,
            sequencer,
            store,
            shutdown_rx,
        }
    }

    /// Main worker loop. Runs until the shutdown channel fires.
    pub async fn run(mut self) {
        info!(queue = %self.queue.queue_name(), "pipeline worker started");

        loop {
            if shutdown_requested(&mut self.shutdown_rx) {
                break;
            }

            match self.queue.dequeue(POLL_INTERVAL).await {
                Ok(Some(envelope)) => self.process(envelope).await,
                Ok(None) => {
                    debug!("no pipeline tasks available");
                }
                Err(e) => {
                    error!(error = %e, "pipeline dequeue failed");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }

        info!("pipeline worker stopped");
    }

    async fn process(&self, mut envelope: Envelope<PipelineTask>) {
        envelope.increment_attempts();
        let job_id = envelope.payload.job_id;
        let started = Instant::now();

        info!(%job_id, attempt = envelope.attempts, "processing pipeline task");

        match self.sequencer.run(job_id).await {
            Ok(status) => {
                info!(
                    %job_id,
                    %status,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "pipeline task finished"
                );
                if let Err(e) = self.queue.complete(&envelope).await {
                    error!(%job_id, error = %e, "failed to mark pipeline task complete");
                }
            }
            Err(e) => {
                if envelope.should_retry() {
                    warn!(
                        %job_id,
                        error = %e,
                        attempt = envelope.attempts,
                        max_attempts = envelope.max_attempts,
                        "pipeline task failed, requeueing"
                    );
                    if let Err(requeue_err) = self.queue.requeue(envelope).await {
                        error!(%job_id, error = %requeue_err, "failed to requeue pipeline task");
                    }
                } else {
                    error!(%job_id, error = %e, "pipeline task exhausted attempts");
                    let message = e.to_string();
                    if let Err(dlq_err) = self.queue.dead_letter(envelope, &message).await {
                        error!(%job_id, error = %dlq_err, "failed to dead-letter pipeline task");
                    }
                    mark_job_failed(self.store.as_ref(), job_id).await;
                }
            }
        }
    }
}

/// Pulls render tasks and hands them to the movie renderer.
pub struct MovieWorker {
    queue: Arc<TaskQueue<MovieTask>>,
    renderer: Arc<MovieRenderer>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl MovieWorker {
    /// Creates a movie worker.
    pub fn new(
        queue: Arc<TaskQueue<MovieTask>>,
        renderer: Arc<MovieRenderer>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            queue,
            renderer,
            shutdown_rx,
        }
    }

    /// Main worker loop. Runs until the shutdown channel fires.
    pub async fn run(mut self) {
        info!(queue = %self.queue.queue_name(), "movie worker started");

        loop {
            if shutdown_requested(&mut self.shutdown_rx) {
                break;
            }

            match self.queue.dequeue(POLL_INTERVAL).await {
                Ok(Some(envelope)) => self.process(envelope).await,
                Ok(None) => {
                    debug!("no render tasks available");
                }
                Err(e) => {
                    error!(error = %e, "movie dequeue failed");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }

        info!("movie worker stopped");
    }

    async fn process(&self, mut envelope: Envelope<MovieTask>) {
        envelope.increment_attempts();
        let job_id = envelope.payload.job_id;
        let label = envelope.payload.label.clone();

        info!(%job_id, %label, attempt = envelope.attempts, "processing render task");

        match self.renderer.render(&envelope.payload).await {
            Ok(()) => {
                if let Err(e) = self.queue.complete(&envelope).await {
                    error!(%job_id, %label, error = %e, "failed to mark render task complete");
                }
            }
            Err(e) => {
                if envelope.should_retry() {
                    warn!(%job_id, %label, error = %e, "render failed, requeueing");
                    if let Err(requeue_err) = self.queue.requeue(envelope).await {
                        error!(%job_id, %label, error = %requeue_err, "failed to requeue render task");
                    }
                } else {
                    error!(%job_id, %label, error = %e, "render exhausted attempts");
                    let message = e.to_string();
                    if let Err(dlq_err) = self.queue.dead_letter(envelope, &message).await {
                        error!(%job_id, %label, error = %dlq_err, "failed to dead-letter render task");
                    }
                }
            }
        }
    }
}

/// Records that the queue gave up on a job after exhausting its delivery
/// attempts. Best-effort: the task is already dead-lettered.
async fn mark_job_failed(store: &dyn JobStore, job_id: Uuid) {
    match store.find_job(job_id).await {
        Ok(Some(mut job)) => {
            job.status = JobStatus::Failed;
            job.completed_at = Some(Utc::now());
            if let Err(e) = store.save_job(&job).await {
                warn!(%job_id, error = %e, "failed to record exhausted job");
            }
        }
        Ok(None) => warn!(%job_id, "exhausted task references a missing job"),
        Err(e) => warn!(%job_id, error = %e, "failed to load job for failure marking"),
    }
}

/// Non-blocking check of the shutdown channel.
fn shutdown_requested(rx: &mut broadcast::Receiver<()>) -> bool {
    match rx.try_recv() {
        Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
            info!("worker received shutdown signal");
            true
        }
        // Lagged still means a signal was sent at some point
        Err(broadcast::error::TryRecvError::Lagged(_)) => true,
        Err(broadcast::error::TryRecvError::Empty) => false,
    }
}
