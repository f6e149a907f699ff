//! Production stage executor.
//!
//! Renders CHARMM input decks from templates, supervises the scientific
//! binaries and Python stage scripts, and verifies the artifacts each
//! stage promises to the next one. All tool output is streamed to
//! per-stage log files inside the job's working directory.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use regex::Regex;
use serde::Deserialize;
use tera::Tera;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::WorkerConfig;
use crate::ensemble::{assemble_ensemble_pdb, parse_ensemble_file, Ensemble};
use crate::exec::{run_checked, OutputSink, RunSpec};
use crate::hpc::{wait_for_completion, HpcClient};
use crate::model::{Feedback, Job, JobPayload, JobResults, MdEngine, RgRange, StageId};

use super::{StageError, StageExecutor};

/// Coordinate file produced by the pdb2crd stage.
const GENERATED_CRD: &str = "pdb2crd.crd";
/// Topology file produced by the pdb2crd stage.
const GENERATED_PSF: &str = "pdb2crd.psf";

/// Poll interval while waiting on a remote HPC task.
const HPC_POLL_INTERVAL: Duration = Duration::from_secs(30);

fn ensembles_file_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^ensembles_size_(\d+)\.txt$").unwrap())
}

/// Rg values the MD stage fans out over, in Angstroms.
///
/// The range is divided into at most six runs: the step is a fifth of the
/// span, rounded, never less than one.
pub(crate) fn rg_values(range: RgRange) -> Vec<u32> {
    let span = range.max.saturating_sub(range.min);
    let step = ((span as f64 / 5.0).round() as u32).max(1);

    let mut values = Vec::new();
    let mut rg = range.min;
    while rg <= range.max {
        values.push(rg);
        rg += step;
    }
    values
}

/// Parsed output of the autorg stage script.
#[derive(Debug, Deserialize)]
struct AutoRgOutput {
    rg: f64,
    rg_min: u32,
    rg_max: u32,
}

/// Runs pipeline stages against the real tools.
pub struct ToolExecutor {
    config: WorkerConfig,
    tera: Tera,
    hpc: Option<Arc<dyn HpcClient>>,
}

impl ToolExecutor {
    /// Creates an executor, loading input-deck templates from the
    /// configured template directory.
    ///
    /// # Errors
    ///
    /// Returns an error when a template fails to parse.
    pub fn new(config: WorkerConfig) -> Result<Self, tera::Error> {
        let glob = format!("{}/**/*.inp", config.template_dir.display());
        let tera = Tera::new(&glob)?;
        Ok(Self {
            config,
            tera,
            hpc: None,
        })
    }

    /// Attaches a remote HPC client for the MD stage.
    pub fn with_hpc_client(mut self, client: Arc<dyn HpcClient>) -> Self {
        self.hpc = Some(client);
        self
    }

    fn job_dir(&self, job: &Job) -> PathBuf {
        self.config.upload_dir.join(job.id.to_string())
    }

    /// Per-stage log sinks inside the job directory.
    fn stage_sinks(&self, job_dir: &Path, stage: StageId) -> (OutputSink, OutputSink) {
        (
            OutputSink::File(job_dir.join(format!("{}.log", stage))),
            OutputSink::File(job_dir.join(format!("{}_error.log", stage))),
        )
    }

    /// Renders an input deck template into the job directory.
    async fn render_deck(
        &self,
        template: &str,
        context: &tera::Context,
        dest: &Path,
    ) -> Result<(), StageError> {
        let body = self.tera.render(template, context)?;
        tokio::fs::write(dest, body).await?;
        debug!(template, dest = %dest.display(), "rendered input deck");
        Ok(())
    }

    /// Runs CHARMM on a deck, relative to the job directory.
    async fn run_charmm(
        &self,
        job_dir: &Path,
        deck: &str,
        stage: StageId,
    ) -> Result<(), StageError> {
        let output = format!("{}.out", deck.trim_end_matches(".inp"));
        let spec = RunSpec::new(&self.config.charmm_bin, job_dir)
            .arg("-o")
            .arg(output)
            .arg("-i")
            .arg(deck)
            .with_timeout(self.config.tool_timeout);

        let (stdout, stderr) = self.stage_sinks(job_dir, stage);
        run_checked(&spec, stdout, stderr).await?;
        Ok(())
    }

    /// Runs a Python stage script, relative to the job directory.
    async fn run_python<I, S>(
        &self,
        job_dir: &Path,
        script: &str,
        args: I,
        stage: StageId,
    ) -> Result<(), StageError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let script_path = self.config.scripts_dir.join(script);
        let spec = RunSpec::new(&self.config.python_bin, job_dir)
            .arg(script_path.display().to_string())
            .args(args)
            .with_timeout(self.config.tool_timeout);

        let (stdout, stderr) = self.stage_sinks(job_dir, stage);
        run_checked(&spec, stdout, stderr).await?;
        Ok(())
    }

    /// Fails the stage unless the given path exists.
    async fn require_artifact(&self, path: &Path) -> Result<(), StageError> {
        if tokio::fs::metadata(path).await.is_err() {
            return Err(StageError::MissingArtifact(path.to_path_buf()));
        }
        Ok(())
    }

    /// The coordinate/topology pair the MD stages start from.
    ///
    /// CRD jobs bring their own; everything else uses the pdb2crd output.
    fn input_coordinates(job: &Job) -> (String, String) {
        match &job.payload {
            JobPayload::ClassicCrd {
                crd_file, psf_file, ..
            } => (crd_file.clone(), psf_file.clone()),
            _ => (GENERATED_CRD.to_string(), GENERATED_PSF.to_string()),
        }
    }

    /// Constraint file fed to the CHARMM decks, if any.
    fn constraint_file(job: &Job) -> Option<String> {
        match &job.payload {
            JobPayload::ClassicPdb { const_inp_file, .. }
            | JobPayload::ClassicCrd { const_inp_file, .. } => const_inp_file.clone(),
            JobPayload::Auto { .. } | JobPayload::Alphafold { .. } => {
                Some("const.inp".to_string())
            }
            JobPayload::Sans { .. } | JobPayload::Scoper { .. } => None,
        }
    }

    fn rg_range(job: &Job) -> Result<RgRange, StageError> {
        job.rg_range
            .ok_or_else(|| StageError::MissingInput("rg range is not set".to_string()))
    }

    async fn stage_pdb2crd(&self, job: &Job) -> Result<String, StageError> {
        let pdb = match &job.payload {
            JobPayload::ClassicPdb { pdb_file, .. }
            | JobPayload::Auto { pdb_file, .. }
            | JobPayload::Alphafold { pdb_file, .. }
            | JobPayload::Sans { pdb_file, .. } => pdb_file.clone(),
            JobPayload::ClassicCrd { .. } | JobPayload::Scoper { .. } => {
                return Err(StageError::MissingInput(
                    "job type does not convert a PDB structure".to_string(),
                ));
            }
        };

        let job_dir = self.job_dir(job);
        let mut context = tera::Context::new();
        context.insert("pdb_file", &pdb);
        context.insert("crd_file", GENERATED_CRD);
        context.insert("psf_file", GENERATED_PSF);
        self.render_deck("pdb2crd.inp", &context, &job_dir.join("pdb2crd.inp"))
            .await?;

        self.run_charmm(&job_dir, "pdb2crd.inp", StageId::Pdb2Crd)
            .await?;
        self.require_artifact(&job_dir.join(GENERATED_CRD)).await?;
        self.require_artifact(&job_dir.join(GENERATED_PSF)).await?;

        Ok(format!("converted {} to CHARMM coordinates", pdb))
    }

    async fn stage_pae(&self, job: &Job) -> Result<String, StageError> {
        let pae = match &job.payload {
            JobPayload::Auto { pae_file, .. } | JobPayload::Alphafold { pae_file, .. } => {
                pae_file.clone()
            }
            _ => {
                return Err(StageError::MissingInput(
                    "job type has no PAE matrix".to_string(),
                ));
            }
        };

        let out = match job.md_engine {
            MdEngine::Charmm => "const.inp",
            MdEngine::OpenMm => "openmm_const.yml",
        };

        let job_dir = self.job_dir(job);
        self.run_python(
            &job_dir,
            "pae_ratios.py",
            [pae.clone(), out.to_string()],
            StageId::Pae,
        )
        .await?;
        self.require_artifact(&job_dir.join(out)).await?;

        Ok(format!("derived {} from {}", out, pae))
    }

    async fn stage_autorg(&self, job: &mut Job) -> Result<String, StageError> {
        let job_dir = self.job_dir(job);
        self.run_python(
            &job_dir,
            "autorg.py",
            [job.data_file.clone(), "autorg.json".to_string()],
            StageId::AutoRg,
        )
        .await?;

        let report = job_dir.join("autorg.json");
        self.require_artifact(&report).await?;
        let body = tokio::fs::read_to_string(&report).await?;
        let parsed = Self::parse_autorg(&body)?;

        job.rg_range = Some(RgRange {
            min: parsed.rg_min,
            max: parsed.rg_max,
        });

        Ok(format!(
            "estimated Rg {:.1} A, sampling range {}..{} A",
            parsed.rg, parsed.rg_min, parsed.rg_max
        ))
    }

    /// Parses and validates the autorg report.
    ///
    /// An inverted range would make the MD fan-out empty, so it fails the
    /// stage here instead of surfacing as a confusing missing-conformer
    /// error several stages later.
    fn parse_autorg(body: &str) -> Result<AutoRgOutput, StageError> {
        let parsed: AutoRgOutput = serde_json::from_str(body)?;
        if parsed.rg_min > parsed.rg_max {
            return Err(StageError::InvalidArtifact(format!(
                "autorg reported an inverted Rg range {}..{}",
                parsed.rg_min, parsed.rg_max
            )));
        }
        Ok(parsed)
    }

    /// Minimize and heat share shape: one deck in, one coordinate set out.
    async fn stage_charmm_step(
        &self,
        job: &Job,
        stage: StageId,
        template: &str,
        input_crd: &str,
        output_crd: &str,
        openmm_script: &str,
        openmm_output: &str,
    ) -> Result<String, StageError> {
        let job_dir = self.job_dir(job);

        match job.md_engine {
            MdEngine::Charmm => {
                let (crd, psf) = Self::input_coordinates(job);
                let input = if stage == StageId::Minimize {
                    crd
                } else {
                    input_crd.to_string()
                };

                let mut context = tera::Context::new();
                context.insert("crd_file", &input);
                context.insert("psf_file", &psf);
                context.insert("output_file", output_crd);
                if let Some(const_inp) = Self::constraint_file(job) {
                    context.insert("const_inp_file", &const_inp);
                }

                let deck = format!("{}.inp", stage);
                self.render_deck(template, &context, &job_dir.join(&deck))
                    .await?;
                self.run_charmm(&job_dir, &deck, stage).await?;
                self.require_artifact(&job_dir.join(output_crd)).await?;

                Ok(format!("wrote {}", output_crd))
            }
            MdEngine::OpenMm => {
                self.run_python(&job_dir, openmm_script, Vec::<String>::new(), stage)
                    .await?;
                self.require_artifact(&job_dir.join(openmm_output)).await?;

                Ok(format!("wrote {}", openmm_output))
            }
        }
    }

    async fn stage_md(&self, job: &Job) -> Result<String, StageError> {
        // HPC offload replaces the whole fan-out when configured
        if self.config.use_hpc {
            if let Some(hpc) = &self.hpc {
                let task_id = hpc.submit_script("md", job.id).await?;
                info!(job_id = %job.id, task_id, "MD submitted to HPC");
                wait_for_completion(
                    hpc.as_ref(),
                    &task_id,
                    HPC_POLL_INTERVAL,
                    self.config.tool_timeout,
                )
                .await?;
                return Ok(format!("MD completed on HPC (task {})", task_id));
            }
        }

        let job_dir = self.job_dir(job);

        if job.md_engine == MdEngine::OpenMm {
            self.run_python(&job_dir, "openmm/md.py", Vec::<String>::new(), StageId::Md)
                .await?;
            return Ok("MD completed".to_string());
        }

        let range = Self::rg_range(job)?;
        let values = rg_values(range);
        let (_, psf) = Self::input_coordinates(job);
        let const_inp = Self::constraint_file(job);

        let mut runs = Vec::with_capacity(values.len());
        for rg in &values {
            let run_dir = job_dir.join("md").join(format!("rg_{}", rg));
            tokio::fs::create_dir_all(&run_dir).await?;

            let mut context = tera::Context::new();
            context.insert("crd_file", "heated.crd");
            context.insert("psf_file", &psf);
            context.insert("rg", rg);
            context.insert("run_dir", &format!("md/rg_{}", rg));
            context.insert("sampling", &job.conformational_sampling);
            if let Some(const_inp) = &const_inp {
                context.insert("const_inp_file", const_inp);
            }

            let deck = format!("md/rg_{}/md.inp", rg);
            self.render_deck("md.inp", &context, &job_dir.join(&deck))
                .await?;

            let spec = RunSpec::new(&self.config.charmm_bin, &job_dir)
                .arg("-o")
                .arg(format!("md/rg_{}/md.out", rg))
                .arg("-i")
                .arg(&deck)
                .with_timeout(self.config.tool_timeout);
            let stdout = OutputSink::File(run_dir.join("md.log"));
            let stderr = OutputSink::File(run_dir.join("md_error.log"));
            runs.push(async move { run_checked(&spec, stdout, stderr).await });
        }

        try_join_all(runs).await?;

        Ok(format!(
            "sampled {} Rg targets ({}..{} A)",
            values.len(),
            range.min,
            range.max
        ))
    }

    async fn stage_dcd2pdb(&self, job: &Job) -> Result<String, StageError> {
        let job_dir = self.job_dir(job);
        let range = Self::rg_range(job)?;
        let values = rg_values(range);
        let (_, psf) = Self::input_coordinates(job);

        let mut runs = Vec::with_capacity(values.len());
        for rg in &values {
            let out_dir = job_dir.join("foxs").join(format!("rg{}_run1", rg));
            tokio::fs::create_dir_all(&out_dir).await?;

            let mut context = tera::Context::new();
            context.insert("psf_file", &psf);
            context.insert("dcd_file", &format!("md/rg_{}/md.dcd", rg));
            context.insert("out_dir", &format!("foxs/rg{}_run1", rg));

            let deck = format!("foxs/rg{}_run1/dcd2pdb.inp", rg);
            self.render_deck("dcd2pdb.inp", &context, &job_dir.join(&deck))
                .await?;

            let spec = RunSpec::new(&self.config.charmm_bin, &job_dir)
                .arg("-o")
                .arg(format!("foxs/rg{}_run1/dcd2pdb.out", rg))
                .arg("-i")
                .arg(&deck)
                .with_timeout(self.config.tool_timeout);
            let stdout = OutputSink::File(out_dir.join("dcd2pdb.log"));
            let stderr = OutputSink::File(out_dir.join("dcd2pdb_error.log"));
            runs.push(async move { run_checked(&spec, stdout, stderr).await });
        }

        try_join_all(runs).await?;

        Ok(format!(
            "extracted conformations from {} trajectories",
            values.len()
        ))
    }

    /// Collects files under `root` whose name passes the filter, sorted.
    fn collect_files<F>(root: &Path, keep: F) -> Vec<PathBuf>
    where
        F: Fn(&str) -> bool,
    {
        let mut files: Vec<PathBuf> = WalkDir::new(root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| keep(&entry.file_name().to_string_lossy()))
            .map(|entry| entry.into_path())
            .collect();
        files.sort();
        files
    }

    async fn stage_foxs(&self, job: &Job) -> Result<String, StageError> {
        let job_dir = self.job_dir(job);
        let foxs_dir = job_dir.join("foxs");

        let mut processed = 0usize;
        let mut entries = tokio::fs::read_dir(&foxs_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let run_dir = entry.path();
            let pdbs = Self::collect_files(&run_dir, |name| name.ends_with(".pdb"));
            if pdbs.is_empty() {
                continue;
            }

            let names: Vec<String> = pdbs
                .iter()
                .filter_map(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string())
                .collect();
            processed += names.len();

            let spec = RunSpec::new(&self.config.foxs_bin, &run_dir)
                .args(names)
                .with_timeout(self.config.tool_timeout);
            let (stdout, stderr) = self.stage_sinks(&job_dir, StageId::Foxs);
            run_checked(&spec, stdout, stderr).await?;
        }

        if processed == 0 {
            return Err(StageError::MissingInput(
                "no extracted conformations under foxs/".to_string(),
            ));
        }

        Ok(format!("computed SAXS profiles for {} conformations", processed))
    }

    async fn stage_multifoxs(&self, job: &Job) -> Result<String, StageError> {
        let job_dir = self.job_dir(job);
        let multifoxs_dir = job_dir.join("multifoxs");
        tokio::fs::create_dir_all(&multifoxs_dir).await?;

        let profiles =
            Self::collect_files(&job_dir.join("foxs"), |name| name.ends_with(".pdb.dat"));
        if profiles.is_empty() {
            return Err(StageError::MissingInput(
                "no SAXS profiles under foxs/".to_string(),
            ));
        }

        let mut listing = String::new();
        for profile in &profiles {
            listing.push_str(&profile.display().to_string());
            listing.push('\n');
        }
        tokio::fs::write(multifoxs_dir.join("foxs_files.txt"), listing).await?;

        let data_file = job_dir.join(&job.data_file);
        let spec = RunSpec::new(&self.config.multifoxs_bin, &multifoxs_dir)
            .arg(data_file.display().to_string())
            .arg("foxs_files.txt")
            .with_timeout(self.config.tool_timeout);
        let (stdout, stderr) = self.stage_sinks(&job_dir, StageId::MultiFoxs);
        run_checked(&spec, stdout, stderr).await?;

        self.require_artifact(&multifoxs_dir.join("ensembles_size_1.txt"))
            .await?;

        Ok(format!(
            "selected ensembles from {} candidate profiles",
            profiles.len()
        ))
    }

    async fn stage_pepsisans(&self, job: &Job) -> Result<String, StageError> {
        let d2o = match &job.payload {
            JobPayload::Sans { d2o_fraction, .. } => *d2o_fraction,
            _ => {
                return Err(StageError::MissingInput(
                    "job type has no D2O fraction".to_string(),
                ));
            }
        };

        let job_dir = self.job_dir(job);
        let pdbs = Self::collect_files(&job_dir.join("foxs"), |name| name.ends_with(".pdb"));
        if pdbs.is_empty() {
            return Err(StageError::MissingInput(
                "no extracted conformations under foxs/".to_string(),
            ));
        }

        for pdb in &pdbs {
            let fit = format!("{}.fit", pdb.display());
            let spec = RunSpec::new(&self.config.pepsisans_bin, &job_dir)
                .arg(pdb.display().to_string())
                .arg(&job.data_file)
                .arg("-o")
                .arg(fit)
                .arg("--d2o")
                .arg(d2o.to_string())
                .with_timeout(self.config.tool_timeout);
            let (stdout, stderr) = self.stage_sinks(&job_dir, StageId::PepsiSans);
            run_checked(&spec, stdout, stderr).await?;
        }

        Ok(format!("fitted {} conformations at {} D2O", pdbs.len(), d2o))
    }

    async fn stage_gasans(&self, job: &Job) -> Result<String, StageError> {
        let job_dir = self.job_dir(job);
        let sans_dir = job_dir.join("sans");
        tokio::fs::create_dir_all(&sans_dir).await?;

        let fits = Self::collect_files(&job_dir.join("foxs"), |name| name.ends_with(".fit"));
        if fits.is_empty() {
            return Err(StageError::MissingInput(
                "no SANS fits under foxs/".to_string(),
            ));
        }

        let mut listing = String::new();
        for fit in &fits {
            listing.push_str(&fit.display().to_string());
            listing.push('\n');
        }
        tokio::fs::write(sans_dir.join("fit_files.txt"), listing).await?;

        let data_file = job_dir.join(&job.data_file);
        let spec = RunSpec::new(&self.config.gasans_bin, &sans_dir)
            .arg(data_file.display().to_string())
            .arg("fit_files.txt")
            .with_timeout(self.config.tool_timeout);
        let (stdout, stderr) = self.stage_sinks(&job_dir, StageId::GaSans);
        run_checked(&spec, stdout, stderr).await?;

        Ok(format!("analyzed {} SANS fits", fits.len()))
    }

    async fn stage_scoper(&self, job: &Job) -> Result<String, StageError> {
        let pdb = match &job.payload {
            JobPayload::Scoper { pdb_file } => pdb_file.clone(),
            _ => {
                return Err(StageError::MissingInput(
                    "job type is not a scoper run".to_string(),
                ));
            }
        };

        let job_dir = self.job_dir(job);
        self.run_python(
            &job_dir,
            "scoper.py",
            [pdb.clone(), job.data_file.clone()],
            StageId::Scoper,
        )
        .await?;

        Ok(format!("scored conformers for {}", pdb))
    }

    async fn stage_results(&self, job: &mut Job) -> Result<String, StageError> {
        let job_dir = self.job_dir(job);
        let results_dir = job_dir.join("results");
        tokio::fs::create_dir_all(&results_dir).await?;

        match &job.payload {
            JobPayload::ClassicPdb { .. }
            | JobPayload::ClassicCrd { .. }
            | JobPayload::Auto { .. }
            | JobPayload::Alphafold { .. } => {
                let multifoxs_dir = job_dir.join("multifoxs");
                let ensembles = self
                    .assemble_ensembles(&multifoxs_dir, &results_dir)
                    .await?;
                let count = ensembles.len();
                job.feedback = Self::best_fit(&ensembles);
                job.results = Some(JobResults { ensembles });
                Ok(format!("assembled {} ensemble models", count))
            }
            JobPayload::Sans { .. } => {
                let fits =
                    Self::collect_files(&job_dir.join("foxs"), |name| name.ends_with(".fit"));
                if fits.is_empty() {
                    return Err(StageError::MissingArtifact(job_dir.join("foxs")));
                }
                Ok(format!("collected {} SANS fits", fits.len()))
            }
            JobPayload::Scoper { .. } => {
                let mut entries = tokio::fs::read_dir(&results_dir).await?;
                if entries.next_entry().await?.is_none() {
                    return Err(StageError::MissingArtifact(results_dir));
                }
                Ok("collected scoper results".to_string())
            }
        }
    }

    /// Parses every ensemble report and assembles a representative PDB
    /// for the top-ranked model of each ensemble size.
    async fn assemble_ensembles(
        &self,
        multifoxs_dir: &Path,
        results_dir: &Path,
    ) -> Result<Vec<Ensemble>, StageError> {
        let mut reports: Vec<(u32, PathBuf)> = Vec::new();
        let mut entries = tokio::fs::read_dir(multifoxs_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(captures) = ensembles_file_re().captures(&name) {
                if let Ok(size) = captures[1].parse::<u32>() {
                    reports.push((size, entry.path()));
                }
            }
        }
        reports.sort_by_key(|(size, _)| *size);

        if reports.is_empty() {
            return Err(StageError::MissingArtifact(
                multifoxs_dir.join("ensembles_size_1.txt"),
            ));
        }

        let mut ensembles = Vec::with_capacity(reports.len());
        for (size, path) in reports {
            let content = tokio::fs::read_to_string(&path).await?;
            let ensemble = parse_ensemble_file(&content, size);
            assemble_ensemble_pdb(&ensemble, multifoxs_dir, results_dir).await?;
            ensembles.push(ensemble);
        }

        Ok(ensembles)
    }

    /// Picks the ensemble size whose top-ranked model has the lowest chi2.
    fn best_fit(ensembles: &[Ensemble]) -> Option<Feedback> {
        ensembles
            .iter()
            .filter_map(|e| e.models.first().map(|m| (e.size, m.chi2)))
            .filter(|(_, chi2)| chi2.is_finite())
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(size, chi2)| Feedback {
                best_ensemble_size: size,
                best_chi2: chi2,
            })
    }
}

#[async_trait]
impl StageExecutor for ToolExecutor {
    async fn execute(&self, job: &mut Job, stage: StageId) -> Result<String, StageError> {
        match stage {
            StageId::Pdb2Crd => self.stage_pdb2crd(job).await,
            StageId::Pae => self.stage_pae(job).await,
            StageId::AutoRg => self.stage_autorg(job).await,
            StageId::Minimize => {
                self.stage_charmm_step(
                    job,
                    StageId::Minimize,
                    "minimize.inp",
                    GENERATED_CRD,
                    "minimized.crd",
                    "openmm/minimize.py",
                    "minimized.pdb",
                )
                .await
            }
            StageId::Heat => {
                self.stage_charmm_step(
                    job,
                    StageId::Heat,
                    "heat.inp",
                    "minimized.crd",
                    "heated.crd",
                    "openmm/heat.py",
                    "heated.pdb",
                )
                .await
            }
            StageId::Md => self.stage_md(job).await,
            StageId::Dcd2Pdb => self.stage_dcd2pdb(job).await,
            StageId::Foxs => self.stage_foxs(job).await,
            StageId::MultiFoxs => self.stage_multifoxs(job).await,
            StageId::PepsiSans => self.stage_pepsisans(job).await,
            StageId::GaSans => self.stage_gasans(job).await,
            StageId::Scoper => self.stage_scoper(job).await,
            StageId::Results => self.stage_results(job).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn executor(upload_dir: &Path) -> ToolExecutor {
        let templates = TempDir::new().unwrap();
        let config = WorkerConfig::default()
            .with_upload_dir(upload_dir)
            .with_template_dir(templates.path());
        // Keep the temp dir alive for the duration of Tera::new only;
        // no template is rendered in these tests.
        ToolExecutor::new(config).unwrap()
    }

    fn job_with(payload: JobPayload) -> Job {
        Job::new("tools test", payload, "saxs.dat")
    }

    #[test]
    fn test_rg_values_spread_over_range() {
        let values = rg_values(RgRange { min: 25, max: 45 });
        assert_eq!(values, vec![25, 29, 33, 37, 41, 45]);
    }

    #[test]
    fn test_rg_values_degenerate_range() {
        assert_eq!(rg_values(RgRange { min: 30, max: 30 }), vec![30]);
        assert_eq!(rg_values(RgRange { min: 30, max: 32 }), vec![30, 31, 32]);
    }

    #[test]
    fn test_parse_autorg_accepts_a_sane_report() {
        let parsed =
            ToolExecutor::parse_autorg(r#"{"rg": 28.4, "rg_min": 25, "rg_max": 45}"#).unwrap();
        assert_eq!(parsed.rg_min, 25);
        assert_eq!(parsed.rg_max, 45);
    }

    #[test]
    fn test_parse_autorg_rejects_an_inverted_range() {
        let err =
            ToolExecutor::parse_autorg(r#"{"rg": 28.4, "rg_min": 45, "rg_max": 25}"#).unwrap_err();
        assert!(matches!(err, StageError::InvalidArtifact(_)));
        assert!(err.to_string().contains("45..25"));
    }

    #[test]
    fn test_input_coordinates_prefer_user_crd() {
        let job = job_with(JobPayload::ClassicCrd {
            crd_file: "mine.crd".to_string(),
            psf_file: "mine.psf".to_string(),
            const_inp_file: None,
        });
        assert_eq!(
            ToolExecutor::input_coordinates(&job),
            ("mine.crd".to_string(), "mine.psf".to_string())
        );

        let job = job_with(JobPayload::ClassicPdb {
            pdb_file: "model.pdb".to_string(),
            const_inp_file: None,
        });
        assert_eq!(
            ToolExecutor::input_coordinates(&job),
            (GENERATED_CRD.to_string(), GENERATED_PSF.to_string())
        );
    }

    #[test]
    fn test_constraint_file_by_job_type() {
        let job = job_with(JobPayload::Auto {
            pdb_file: "model.pdb".to_string(),
            pae_file: "pae.json".to_string(),
        });
        assert_eq!(
            ToolExecutor::constraint_file(&job),
            Some("const.inp".to_string())
        );

        let job = job_with(JobPayload::ClassicPdb {
            pdb_file: "model.pdb".to_string(),
            const_inp_file: Some("user_const.inp".to_string()),
        });
        assert_eq!(
            ToolExecutor::constraint_file(&job),
            Some("user_const.inp".to_string())
        );

        let job = job_with(JobPayload::Sans {
            pdb_file: "model.pdb".to_string(),
            d2o_fraction: 0.42,
        });
        assert_eq!(ToolExecutor::constraint_file(&job), None);
    }

    #[tokio::test]
    async fn test_pdb2crd_rejects_crd_jobs() {
        let tmp = TempDir::new().unwrap();
        let exec = executor(tmp.path());
        let mut job = job_with(JobPayload::ClassicCrd {
            crd_file: "mine.crd".to_string(),
            psf_file: "mine.psf".to_string(),
            const_inp_file: None,
        });

        let err = exec.execute(&mut job, StageId::Pdb2Crd).await.unwrap_err();
        assert!(matches!(err, StageError::MissingInput(_)));
    }

    #[tokio::test]
    async fn test_pae_rejects_jobs_without_matrix() {
        let tmp = TempDir::new().unwrap();
        let exec = executor(tmp.path());
        let mut job = job_with(JobPayload::ClassicPdb {
            pdb_file: "model.pdb".to_string(),
            const_inp_file: None,
        });

        let err = exec.execute(&mut job, StageId::Pae).await.unwrap_err();
        assert!(matches!(err, StageError::MissingInput(_)));
    }

    #[tokio::test]
    async fn test_md_requires_rg_range() {
        let tmp = TempDir::new().unwrap();
        let exec = executor(tmp.path());
        let mut job = job_with(JobPayload::ClassicPdb {
            pdb_file: "model.pdb".to_string(),
            const_inp_file: None,
        });
        assert!(job.rg_range.is_none());

        let err = exec.execute(&mut job, StageId::Md).await.unwrap_err();
        assert!(matches!(err, StageError::MissingInput(_)));
    }

    #[tokio::test]
    async fn test_results_assembles_ensembles_from_reports() {
        let tmp = TempDir::new().unwrap();
        let exec = executor(tmp.path());
        let mut job = job_with(JobPayload::ClassicPdb {
            pdb_file: "model.pdb".to_string(),
            const_inp_file: None,
        });

        let job_dir = tmp.path().join(job.id.to_string());
        let multifoxs_dir = job_dir.join("multifoxs");
        tokio::fs::create_dir_all(&multifoxs_dir).await.unwrap();

        tokio::fs::write(
            multifoxs_dir.join("snapshot1.pdb"),
            "ATOM      1  N   ALA A   1       0.000   0.000   0.000\nEND\n",
        )
        .await
        .unwrap();

        let report = "1 |  2.34 | x1 (1.050, 0.500)\n    \
                      2 | 1.000 (1.000, 0.000) | snapshot1.pdb.dat (0.999)\n";
        tokio::fs::write(multifoxs_dir.join("ensembles_size_1.txt"), report)
            .await
            .unwrap();

        let summary = exec.execute(&mut job, StageId::Results).await.unwrap();
        assert!(summary.contains("1 ensemble"));

        let results = job.results.as_ref().unwrap();
        assert_eq!(results.ensembles.len(), 1);
        assert_eq!(results.ensembles[0].size, 1);
        assert_eq!(results.ensembles[0].models[0].chi2, 2.34);

        let feedback = job.feedback.as_ref().unwrap();
        assert_eq!(feedback.best_ensemble_size, 1);
        assert_eq!(feedback.best_chi2, 2.34);

        let assembled = job_dir.join("results").join("ensemble_size_1_model.pdb");
        let body = tokio::fs::read_to_string(&assembled).await.unwrap();
        assert!(body.starts_with("MODEL       1"));
        assert!(body.contains("ENDMDL"));
    }

    #[tokio::test]
    async fn test_results_fails_without_reports() {
        let tmp = TempDir::new().unwrap();
        let exec = executor(tmp.path());
        let mut job = job_with(JobPayload::ClassicPdb {
            pdb_file: "model.pdb".to_string(),
            const_inp_file: None,
        });

        let job_dir = tmp.path().join(job.id.to_string());
        tokio::fs::create_dir_all(job_dir.join("multifoxs"))
            .await
            .unwrap();

        let err = exec.execute(&mut job, StageId::Results).await.unwrap_err();
        assert!(matches!(err, StageError::MissingArtifact(_)));
    }

    #[tokio::test]
    async fn test_scoper_results_require_output() {
        let tmp = TempDir::new().unwrap();
        let exec = executor(tmp.path());
        let mut job = job_with(JobPayload::Scoper {
            pdb_file: "rna.pdb".to_string(),
        });

        // results/ gets created but stays empty
        let err = exec.execute(&mut job, StageId::Results).await.unwrap_err();
        assert!(matches!(err, StageError::MissingArtifact(_)));
    }
}
