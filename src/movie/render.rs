//! Movie rendering worker logic.
//!
//! Renders a trajectory into an mp4 via PyMOL, then derives a poster
//! frame and thumbnail via ffmpeg. The mp4 is the asset; still extraction
//! is best-effort and never fails a render that produced a movie.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::exec::{run_checked, OutputSink, RunSpec};
use crate::model::{MovieAsset, MovieOutputs};
use crate::scheduler::MovieTask;
use crate::store::JobStore;

use super::MovieError;

/// Renders movie assets.
pub struct MovieRenderer {
    store: Arc<dyn JobStore>,
    config: WorkerConfig,
}

impl MovieRenderer {
    /// Creates a renderer.
    pub fn new(store: Arc<dyn JobStore>, config: WorkerConfig) -> Self {
        Self { store, config }
    }

    /// Processes one render task.
    ///
    /// Marks the asset running (counting the attempt), renders unless the
    /// mp4 already exists, extracts stills best-effort, and records the
    /// terminal asset state. Returns an error for the queue's retry logic
    /// when rendering fails.
    pub async fn render(&self, task: &MovieTask) -> Result<(), MovieError> {
        let mut asset = self
            .store
            .find_movie_asset(task.job_id, &task.label)
            .await?
            .ok_or_else(|| MovieError::AssetNotFound {
                job_id: task.job_id,
                label: task.label.clone(),
            })?;

        let job_dir = self.config.upload_dir.join(task.job_id.to_string());
        let movie_dir = job_dir
            .join("assets")
            .join("movies")
            .join(&task.label);
        let mp4 = movie_dir.join(format!("{}.mp4", task.label));

        if let Ok(meta) = tokio::fs::metadata(&mp4).await {
            info!(job_id = %task.job_id, label = %task.label, "movie already rendered");
            let (poster, thumb) = self.extract_stills(&mp4, &movie_dir, &task.label, &job_dir).await;
            asset.mark_ready(MovieOutputs {
                mp4: mp4.display().to_string(),
                poster,
                thumb,
                size_bytes: meta.len(),
            });
            self.store.upsert_movie_asset(task.job_id, &asset).await?;
            return Ok(());
        }

        asset.mark_running();
        self.store.upsert_movie_asset(task.job_id, &asset).await?;

        tokio::fs::create_dir_all(&movie_dir).await?;

        match self.run_pymol(&asset, &job_dir, &mp4).await {
            Ok(()) => {
                let size_bytes = tokio::fs::metadata(&mp4).await?.len();
                let (poster, thumb) =
                    self.extract_stills(&mp4, &movie_dir, &task.label, &job_dir).await;

                asset.mark_ready(MovieOutputs {
                    mp4: mp4.display().to_string(),
                    poster,
                    thumb,
                    size_bytes,
                });
                self.store.upsert_movie_asset(task.job_id, &asset).await?;
                info!(job_id = %task.job_id, label = %task.label, size_bytes, "movie rendered");
                Ok(())
            }
            Err(e) => {
                asset.mark_failed(e.to_string());
                if let Err(save_err) = self.store.upsert_movie_asset(task.job_id, &asset).await {
                    warn!(
                        job_id = %task.job_id,
                        label = %task.label,
                        error = %save_err,
                        "failed to record render failure"
                    );
                }
                Err(e)
            }
        }
    }

    /// Drives the PyMOL render script over the trajectory.
    async fn run_pymol(
        &self,
        asset: &MovieAsset,
        job_dir: &Path,
        mp4: &Path,
    ) -> Result<(), MovieError> {
        let script = self.config.scripts_dir.join("make_dcd_movie.py");
        let settings = &asset.settings;

        let mut spec = RunSpec::new(&self.config.pymol_bin, job_dir)
            .arg("-cqr")
            .arg(script.display().to_string())
            .arg("--")
            .arg("--pdb")
            .arg(&asset.source.pdb)
            .arg("--dcd")
            .arg(&asset.source.dcd)
            .arg("--out")
            .arg(mp4.display().to_string())
            .arg("--width")
            .arg(settings.width.to_string())
            .arg("--height")
            .arg(settings.height.to_string())
            .arg("--stride")
            .arg(settings.stride.to_string())
            .arg("--crf")
            .arg(settings.crf.to_string())
            .with_timeout(self.config.tool_timeout);
        if settings.ray {
            spec = spec.arg("--ray");
        }

        let stdout = OutputSink::File(job_dir.join(format!("movie_{}.log", asset.label)));
        let stderr = OutputSink::File(job_dir.join(format!("movie_{}_error.log", asset.label)));
        run_checked(&spec, stdout, stderr).await?;

        if tokio::fs::metadata(mp4).await.is_err() {
            return Err(MovieError::MissingOutput(mp4.to_path_buf()));
        }
        Ok(())
    }

    /// Extracts a poster frame and a short looping preview gif from the
    /// rendered movie.
    ///
    /// Failures here are logged only; the movie itself is the asset.
    async fn extract_stills(
        &self,
        mp4: &Path,
        movie_dir: &Path,
        label: &str,
        job_dir: &Path,
    ) -> (Option<String>, Option<String>) {
        let poster_path = movie_dir.join(format!("{}_poster.png", label));
        let poster = self
            .run_ffmpeg(poster_args(mp4, &poster_path), &poster_path, job_dir, label)
            .await;

        let thumb_path = movie_dir.join(format!("{}_thumb.gif", label));
        let thumb = self
            .run_ffmpeg(preview_args(mp4, &thumb_path), &thumb_path, job_dir, label)
            .await;

        (poster, thumb)
    }

    async fn run_ffmpeg(
        &self,
        args: Vec<String>,
        out: &PathBuf,
        job_dir: &Path,
        label: &str,
    ) -> Option<String> {
        let spec = RunSpec::new(&self.config.ffmpeg_bin, job_dir)
            .args(args)
            .with_timeout(std::time::Duration::from_secs(120));

        let stderr = OutputSink::File(job_dir.join(format!("movie_{}_error.log", label)));
        match run_checked(&spec, OutputSink::Null, stderr).await {
            Ok(_) => Some(out.display().to_string()),
            Err(e) => {
                warn!(label, error = %e, "still extraction failed");
                None
            }
        }
    }
}

/// ffmpeg arguments for a single poster frame.
fn poster_args(mp4: &Path, out: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-i".to_string(),
        mp4.display().to_string(),
        "-frames:v".to_string(),
        "1".to_string(),
        out.display().to_string(),
    ]
}

/// ffmpeg arguments for a short looping preview gif.
fn preview_args(mp4: &Path, out: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-i".to_string(),
        mp4.display().to_string(),
        "-t".to_string(),
        "3".to_string(),
        "-vf".to_string(),
        "fps=10,scale=320:-1".to_string(),
        "-loop".to_string(),
        "0".to_string(),
        out.display().to_string(),
    ]
}
