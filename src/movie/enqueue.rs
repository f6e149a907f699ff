//! Discovery and enqueueing of movie render tasks.

use std::path::Path;
use std::sync::Arc;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::model::{AssetStatus, Job, MovieAsset, MovieSource, RenderSettings};
use crate::scheduler::{Envelope, MovieTask, QueueError, TaskQueue};
use crate::store::JobStore;

use super::{movie_task_key, MovieError};

fn run_dir_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^rg_\d+$").unwrap())
}

/// Queue operations the enqueuer depends on.
///
/// Production uses the Redis `TaskQueue`; tests substitute a recording
/// double so the idempotency contract can be verified without Redis.
#[async_trait]
pub trait RenderQueue: Send + Sync {
    /// Enqueues the envelope unless its task key is already in flight.
    ///
    /// Returns `true` when the task was actually enqueued.
    async fn enqueue_unique(&self, envelope: Envelope<MovieTask>) -> Result<bool, QueueError>;
}

#[async_trait]
impl RenderQueue for TaskQueue<MovieTask> {
    async fn enqueue_unique(&self, envelope: Envelope<MovieTask>) -> Result<bool, QueueError> {
        TaskQueue::enqueue_unique(self, envelope).await
    }
}

/// Scans a job's MD output and enqueues one render task per trajectory.
pub struct MovieEnqueuer {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn RenderQueue>,
    upload_dir: std::path::PathBuf,
    settings: RenderSettings,
    max_attempts: u32,
}

impl MovieEnqueuer {
    /// Creates an enqueuer.
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn RenderQueue>,
        upload_dir: impl Into<std::path::PathBuf>,
        settings: RenderSettings,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            queue,
            upload_dir: upload_dir.into(),
            settings,
            max_attempts,
        }
    }

    /// Discovers trajectory pairs under `<job>/md/` and enqueues render
    /// tasks for them.
    ///
    /// An absent `md` directory is a no-op (the job type may not produce
    /// trajectories). Incomplete pairs are skipped with a warning. Assets
    /// already `Ready` are left alone. Enqueueing uses stable task keys,
    /// so calling this repeatedly never duplicates in-flight work.
    ///
    /// # Returns
    ///
    /// The number of render tasks actually enqueued.
    pub async fn enqueue_movies(&self, job: &Job) -> Result<usize, MovieError> {
        let md_dir = self.upload_dir.join(job.id.to_string()).join("md");
        if tokio::fs::metadata(&md_dir).await.is_err() {
            debug!(job_id = %job.id, "no md directory, nothing to render");
            return Ok(0);
        }

        let pairs = scan_trajectory_pairs(&md_dir).await?;
        let mut enqueued = 0;

        for (label, source) in pairs {
            let asset = match self.store.find_movie_asset(job.id, &label).await? {
                Some(existing) if existing.status == AssetStatus::Ready => {
                    debug!(job_id = %job.id, label, "asset already rendered, skipping");
                    continue;
                }
                Some(mut existing) => {
                    existing.status = AssetStatus::Queued;
                    existing.source = source;
                    existing
                }
                None => MovieAsset::new(&label, source).with_settings(self.settings),
            };
            self.store.upsert_movie_asset(job.id, &asset).await?;

            let task = MovieTask {
                job_id: job.id,
                label: label.clone(),
            };
            let envelope = Envelope::new(task)
                .with_task_key(movie_task_key(job.id, &label))
                .with_max_attempts(self.max_attempts);

            if self.queue.enqueue_unique(envelope).await? {
                enqueued += 1;
            } else {
                debug!(job_id = %job.id, label, "render task already in flight");
            }
        }

        info!(job_id = %job.id, enqueued, "enqueued movie render tasks");
        Ok(enqueued)
    }
}

/// Finds `rg_*` run directories containing a complete `md.pdb`/`md.dcd`
/// pair, sorted by label.
pub(crate) async fn scan_trajectory_pairs(
    md_dir: &Path,
) -> Result<Vec<(String, MovieSource)>, MovieError> {
    let mut pairs = Vec::new();
    let mut entries = tokio::fs::read_dir(md_dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let label = entry.file_name().to_string_lossy().to_string();
        if !run_dir_re().is_match(&label) {
            continue;
        }

        let pdb = entry.path().join("md.pdb");
        let dcd = entry.path().join("md.dcd");
        let pdb_ok = tokio::fs::metadata(&pdb).await.is_ok();
        let dcd_ok = tokio::fs::metadata(&dcd).await.is_ok();
        if !pdb_ok || !dcd_ok {
            warn!(label, pdb_ok, dcd_ok, "incomplete trajectory pair, skipping");
            continue;
        }

        pairs.push((
            label,
            MovieSource {
                pdb: pdb.display().to_string(),
                dcd: dcd.display().to_string(),
            },
        ));
    }

    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(pairs)
}
