//! Command-line interface for the saxsflow worker.
//!
//! Provides the long-running worker process plus small operational
//! commands for submitting jobs and inspecting queue state.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};

use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::hpc::HttpHpcClient;
use crate::model::{Job, JobStatus, MdEngine, RgRange};
use crate::movie::{MovieEnqueuer, MovieRenderer, RenderQueue};
use crate::notify::Notifier;
use crate::pipeline::{initial_steps, Sequencer, ToolExecutor};
use crate::scheduler::{
    Envelope, MovieTask, MovieWorker, PipelineTask, PipelineWorker, TaskQueue,
};
use crate::store::{JobStore, PgJobStore, StoreError};

/// BilboMD-style SAXS/SANS pipeline worker.
#[derive(Parser)]
#[command(name = "saxsflow")]
#[command(about = "Molecular dynamics pipeline worker for SAXS/SANS analysis")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the pipeline and movie workers until interrupted.
    Worker,

    /// Submit a job described by a JSON file and enqueue it.
    Submit {
        /// Path to the job description file.
        file: PathBuf,
    },

    /// Show a job's status, step trail and movie assets.
    Show {
        /// Job identifier.
        job_id: Uuid,
    },

    /// Print queue statistics.
    Stats,
}

/// A job description as submitted from the command line.
#[derive(Debug, Deserialize)]
struct JobSubmission {
    title: String,
    #[serde(flatten)]
    payload: crate::model::JobPayload,
    data_file: String,
    #[serde(default)]
    md_engine: Option<MdEngine>,
    #[serde(default)]
    rg_range: Option<RgRange>,
    #[serde(default)]
    conformational_sampling: Option<u32>,
    #[serde(default)]
    recipient: Option<String>,
}

/// Parses command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parses arguments and runs the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Runs the selected command with pre-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Worker => run_worker().await,
        Commands::Submit { file } => run_submit(&file).await,
        Commands::Show { job_id } => run_show(job_id).await,
        Commands::Stats => run_stats().await,
    }
}

/// Starts both worker loops and blocks until Ctrl-C.
async fn run_worker() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env().context("loading worker configuration")?;
    config.validate().context("validating configuration")?;

    let store = Arc::new(
        PgJobStore::connect(&config.database_url)
            .await
            .context("connecting to PostgreSQL")?,
    );
    store
        .run_migrations()
        .await
        .context("running database migrations")?;

    let redis_client =
        redis::Client::open(config.redis_url.as_str()).context("opening Redis client")?;
    let redis = redis::aio::ConnectionManager::new(redis_client)
        .await
        .context("connecting to Redis")?;

    let pipeline_queue = Arc::new(TaskQueue::<PipelineTask>::from_connection(
        redis.clone(),
        &config.pipeline_queue,
    ));
    let movie_queue = Arc::new(TaskQueue::<MovieTask>::from_connection(
        redis.clone(),
        &config.movie_queue,
    ));

    // Reclaim tasks from a previous worker that died mid-processing
    for (name, recovered) in [
        ("pipeline", pipeline_queue.recover_processing().await?),
        ("movie", movie_queue.recover_processing().await?),
    ] {
        if recovered > 0 {
            info!(queue = name, recovered, "recovered stuck tasks");
        }
    }

    let mut executor = ToolExecutor::new(config.clone()).context("loading input-deck templates")?;
    if config.use_hpc {
        if let Some(base_url) = &config.hpc_base_url {
            executor = executor.with_hpc_client(Arc::new(HttpHpcClient::new(base_url)));
            info!(base_url, "MD stage will run on the remote HPC service");
        }
    }

    let enqueue_queue: Arc<dyn RenderQueue> = Arc::new(TaskQueue::<MovieTask>::from_connection(
        redis,
        &config.movie_queue,
    ));
    let enqueuer = Arc::new(MovieEnqueuer::new(
        store.clone() as Arc<dyn JobStore>,
        enqueue_queue,
        config.upload_dir.clone(),
        config.movie_settings,
        config.movie_max_attempts,
    ));

    let notifier = Arc::new(Notifier::new(config.notify_url.clone()));
    let sequencer = Arc::new(
        Sequencer::new(store.clone() as Arc<dyn JobStore>, executor, notifier)
            .with_movie_enqueuer(enqueuer),
    );
    let renderer = Arc::new(MovieRenderer::new(
        store.clone() as Arc<dyn JobStore>,
        config.clone(),
    ));

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let pipeline_handle = tokio::spawn(
        PipelineWorker::new(
            pipeline_queue.clone(),
            sequencer,
            store.clone() as Arc<dyn JobStore>,
            shutdown_tx.subscribe(),
        )
        .run(),
    );
    let movie_handle = tokio::spawn(
        MovieWorker::new(movie_queue.clone(), renderer, shutdown_tx.subscribe()).run(),
    );

    info!(
        pipeline_queue = %config.pipeline_queue,
        movie_queue = %config.movie_queue,
        upload_dir = %config.upload_dir.display(),
        "saxsflow worker started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received, draining workers");

    // Workers may already be gone if the channel closed
    let _ = shutdown_tx.send(());
    if let Err(e) = pipeline_handle.await {
        warn!(error = %e, "pipeline worker task panicked");
    }
    if let Err(e) = movie_handle.await {
        warn!(error = %e, "movie worker task panicked");
    }

    info!("saxsflow worker stopped");
    Ok(())
}

/// Creates a job from a submission file and enqueues it.
async fn run_submit(file: &std::path::Path) -> anyhow::Result<()> {
    let config = WorkerConfig::from_env().context("loading worker configuration")?;

    let body = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let submission: JobSubmission =
        serde_json::from_str(&body).context("parsing job description")?;

    let mut job = Job::new(submission.title, submission.payload, submission.data_file);
    if let Some(engine) = submission.md_engine {
        job = job.with_md_engine(engine);
    }
    if let Some(range) = submission.rg_range {
        job = job.with_rg_range(range.min, range.max);
    }
    if let Some(sampling) = submission.conformational_sampling {
        job = job.with_conformational_sampling(sampling);
    }
    if let Some(recipient) = submission.recipient {
        job = job.with_recipient(recipient);
    }
    job.steps = initial_steps(&job.payload);
    job.status = JobStatus::Pending;

    let store = PgJobStore::connect(&config.database_url)
        .await
        .context("connecting to PostgreSQL")?;
    store.run_migrations().await?;
    store.save_job(&job).await?;

    let queue = TaskQueue::<PipelineTask>::connect(&config.redis_url, &config.pipeline_queue)
        .await
        .context("connecting to Redis")?;
    let envelope =
        Envelope::new(PipelineTask { job_id: job.id }).with_max_attempts(config.max_attempts);
    queue.enqueue(envelope).await?;

    println!("submitted job {} ({})", job.id, job.payload.type_name());
    Ok(())
}

/// Prints one job's status, step trail and movie assets.
async fn run_show(job_id: Uuid) -> anyhow::Result<()> {
    let config = WorkerConfig::from_env().context("loading worker configuration")?;
    let store = PgJobStore::connect(&config.database_url)
        .await
        .context("connecting to PostgreSQL")?;

    let report = describe_job(&store, job_id).await?;
    print!("{report}");
    Ok(())
}

/// Renders a human-readable job report.
///
/// # Errors
///
/// Returns `StoreError::JobNotFound` for an unknown job ID.
async fn describe_job(store: &dyn JobStore, job_id: Uuid) -> Result<String, StoreError> {
    let job = store
        .find_job(job_id)
        .await?
        .ok_or(StoreError::JobNotFound(job_id))?;

    let mut report = format!(
        "job {} ({}) status={} progress={}%\n",
        job.id,
        job.payload.type_name(),
        job.status,
        job.progress
    );
    for record in job.steps.iter() {
        report.push_str(&format!(
            "  {:<10} {:<8} {}\n",
            record.stage.to_string(),
            record.state.to_string(),
            record.message
        ));
    }
    for asset in store.list_movie_assets(job_id).await? {
        report.push_str(&format!(
            "  movie {:<8} {:<8} attempts={}\n",
            asset.label,
            asset.status.to_string(),
            asset.attempts
        ));
    }
    Ok(report)
}

/// Prints pending/processing/dead-letter counts for both queues.
async fn run_stats() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env().context("loading worker configuration")?;

    let pipeline_queue =
        TaskQueue::<PipelineTask>::connect(&config.redis_url, &config.pipeline_queue)
            .await
            .context("connecting to Redis")?;
    let movie_queue = TaskQueue::<MovieTask>::connect(&config.redis_url, &config.movie_queue)
        .await
        .context("connecting to Redis")?;

    for stats in [pipeline_queue.stats().await?, movie_queue.stats().await?] {
        println!(
            "{}: {} pending, {} processing, {} dead-lettered",
            stats.queue_name, stats.pending_tasks, stats.processing_tasks, stats.dead_letter_tasks
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobPayload, MovieAsset, MovieSource, StageId, StepState};
    use crate::store::MemoryJobStore;

    #[tokio::test]
    async fn test_describe_missing_job() {
        let store = MemoryJobStore::new();
        let err = describe_job(&store, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_describe_lists_steps_and_assets() {
        let store = MemoryJobStore::new();
        let payload = JobPayload::ClassicCrd {
            crd_file: "m.crd".to_string(),
            psf_file: "m.psf".to_string(),
            const_inp_file: None,
        };
        let mut job = Job::new("inspect me", payload.clone(), "saxs.dat");
        job.steps = initial_steps(&payload);
        job.steps
            .set(StageId::Minimize, StepState::Success, "minimized");
        let id = job.id;
        store.seed_job(job).await;

        let asset = MovieAsset::new(
            "rg_27",
            MovieSource {
                pdb: "md/rg_27/md.pdb".to_string(),
                dcd: "md/rg_27/md.dcd".to_string(),
            },
        );
        store.upsert_movie_asset(id, &asset).await.unwrap();

        let report = describe_job(&store, id).await.unwrap();
        assert!(report.contains("classic_crd"));
        assert!(report.contains("minimize"));
        assert!(report.contains("minimized"));
        assert!(report.contains("movie rg_27"));
    }

    #[test]
    fn test_submission_parsing() {
        let body = r#"{
            "title": "lysozyme apo",
            "type": "classic_pdb",
            "pdb_file": "lysozyme.pdb",
            "data_file": "saxs.dat",
            "rg_range": { "min": 25, "max": 45 },
            "recipient": "researcher@example.org"
        }"#;

        let submission: JobSubmission = serde_json::from_str(body).unwrap();
        assert_eq!(submission.title, "lysozyme apo");
        assert_eq!(submission.data_file, "saxs.dat");
        assert_eq!(submission.rg_range, Some(RgRange { min: 25, max: 45 }));
        assert!(submission.md_engine.is_none());
        assert_eq!(
            submission.recipient.as_deref(),
            Some("researcher@example.org")
        );
    }

    #[test]
    fn test_submission_minimal() {
        let body = r#"{
            "title": "rna scoper",
            "type": "scoper",
            "pdb_file": "rna.pdb",
            "data_file": "saxs.dat"
        }"#;

        let submission: JobSubmission = serde_json::from_str(body).unwrap();
        assert!(submission.rg_range.is_none());
        assert!(submission.conformational_sampling.is_none());
    }
}
