//! Assembly of multi-model ensemble PDB files.
//!
//! For each report the top-ranked ensemble's conformers are concatenated
//! into a single multi-model PDB under the results directory, with `MODEL`
//! records numbering the members and the terminal `END` of each conformer
//! rewritten to `ENDMDL`.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use super::Ensemble;

/// Errors that can occur while assembling an ensemble PDB.
#[derive(Debug, Error)]
pub enum AssembleError {
    /// The report had no model, or none of its conformer files exist.
    #[error("no usable conformer files for ensemble size {0}")]
    NoModelsFound(u32),

    /// Filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Assembles the top-ranked ensemble into a multi-model PDB.
///
/// Conformer paths from the report are resolved relative to `report_dir`.
/// Missing conformer files are skipped with a warning; the assembly only
/// fails if no file remains. The output is written to
/// `results_dir/ensemble_size_{N}_model.pdb`.
///
/// # Returns
///
/// The path of the written ensemble file.
pub async fn assemble_ensemble_pdb(
    ensemble: &Ensemble,
    report_dir: &Path,
    results_dir: &Path,
) -> Result<PathBuf, AssembleError> {
    let model = ensemble
        .models
        .iter()
        .min_by_key(|m| m.rank)
        .ok_or(AssembleError::NoModelsFound(ensemble.size))?;

    let mut existing: Vec<PathBuf> = Vec::new();
    for state in &model.states {
        if state.pdb.is_empty() {
            continue;
        }
        let path = if Path::new(&state.pdb).is_absolute() {
            PathBuf::from(&state.pdb)
        } else {
            report_dir.join(&state.pdb)
        };
        if tokio::fs::metadata(&path).await.is_ok() {
            existing.push(path);
        } else {
            warn!(path = %path.display(), "skipping missing conformer file");
        }
    }

    if existing.is_empty() {
        return Err(AssembleError::NoModelsFound(ensemble.size));
    }

    let mut sections: Vec<String> = Vec::with_capacity(existing.len() * 2);
    for (i, path) in existing.iter().enumerate() {
        let content = tokio::fs::read_to_string(path).await?;
        sections.push(format!("MODEL       {}", i + 1));
        sections.push(replace_terminal_end(&content));
    }

    let out_path = results_dir.join(format!("ensemble_size_{}_model.pdb", ensemble.size));
    tokio::fs::write(&out_path, sections.join("\n")).await?;
    info!(
        path = %out_path.display(),
        members = existing.len(),
        "assembled ensemble PDB"
    );

    Ok(out_path)
}

/// Rewrites a trailing `END` record to `ENDMDL`.
///
/// Only a terminal `END` on its own record is rewritten; `END` appearing
/// inside atom data is left alone.
fn replace_terminal_end(content: &str) -> String {
    let trimmed = content.trim_end_matches('\n');
    if let Some(stripped) = trimmed.strip_suffix("END") {
        if stripped.is_empty() || stripped.ends_with('\n') {
            return format!("{}ENDMDL", stripped);
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::{EnsembleModel, EnsembleState};
    use tempfile::TempDir;

    fn state(pdb: &str) -> EnsembleState {
        EnsembleState {
            pdb: pdb.to_string(),
            weight: 0.5,
            weight_avg: 0.5,
            weight_stddev: 0.0,
            fraction: 1.0,
        }
    }

    fn ensemble_with_states(size: u32, states: Vec<EnsembleState>) -> Ensemble {
        Ensemble {
            size,
            models: vec![EnsembleModel {
                rank: 1,
                chi2: 1.5,
                c1: 1.0,
                c2: 0.0,
                states,
            }],
        }
    }

    async fn write_conformer(dir: &Path, name: &str) {
        let body = "ATOM      1  N   ALA A   1      20.154  16.967  23.466  1.00 20.00\nEND";
        tokio::fs::write(dir.join(name), body).await.unwrap();
    }

    #[test]
    fn test_replace_terminal_end() {
        assert_eq!(replace_terminal_end("ATOM 1\nEND"), "ATOM 1\nENDMDL");
        assert_eq!(replace_terminal_end("ATOM 1\nEND\n"), "ATOM 1\nENDMDL");
        assert_eq!(replace_terminal_end("END"), "ENDMDL");
        // END embedded in a record is not a terminator
        assert_eq!(replace_terminal_end("ATOM BEND"), "ATOM BEND");
        assert_eq!(replace_terminal_end("ATOM 1\nENDMDL"), "ATOM 1\nENDMDL");
    }

    #[tokio::test]
    async fn test_assemble_counts_models() {
        let report_dir = TempDir::new().unwrap();
        let results_dir = TempDir::new().unwrap();
        write_conformer(report_dir.path(), "a.pdb").await;
        write_conformer(report_dir.path(), "b.pdb").await;

        let ensemble = ensemble_with_states(2, vec![state("a.pdb"), state("b.pdb")]);
        let out = assemble_ensemble_pdb(&ensemble, report_dir.path(), results_dir.path())
            .await
            .unwrap();

        assert_eq!(
            out.file_name().unwrap().to_str().unwrap(),
            "ensemble_size_2_model.pdb"
        );
        let body = tokio::fs::read_to_string(&out).await.unwrap();
        assert_eq!(body.matches("MODEL       ").count(), 2);
        assert_eq!(body.matches("ENDMDL").count(), 2);
        assert!(!body.contains("\nEND\n"));
    }

    #[tokio::test]
    async fn test_assemble_skips_missing_files() {
        let report_dir = TempDir::new().unwrap();
        let results_dir = TempDir::new().unwrap();
        write_conformer(report_dir.path(), "a.pdb").await;

        let ensemble = ensemble_with_states(2, vec![state("a.pdb"), state("missing.pdb")]);
        let out = assemble_ensemble_pdb(&ensemble, report_dir.path(), results_dir.path())
            .await
            .unwrap();

        let body = tokio::fs::read_to_string(&out).await.unwrap();
        assert_eq!(body.matches("MODEL       ").count(), 1);
    }

    #[tokio::test]
    async fn test_assemble_fails_when_nothing_remains() {
        let report_dir = TempDir::new().unwrap();
        let results_dir = TempDir::new().unwrap();

        let ensemble = ensemble_with_states(1, vec![state("missing.pdb")]);
        let err = assemble_ensemble_pdb(&ensemble, report_dir.path(), results_dir.path())
            .await
            .unwrap_err();

        assert!(matches!(err, AssembleError::NoModelsFound(1)));
    }

    #[tokio::test]
    async fn test_assemble_fails_without_models() {
        let report_dir = TempDir::new().unwrap();
        let results_dir = TempDir::new().unwrap();

        let ensemble = Ensemble {
            size: 3,
            models: vec![],
        };
        let err = assemble_ensemble_pdb(&ensemble, report_dir.path(), results_dir.path())
            .await
            .unwrap_err();

        assert!(matches!(err, AssembleError::NoModelsFound(3)));
    }
}
