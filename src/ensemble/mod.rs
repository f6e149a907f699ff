//! Parser for multi-state ensemble selection reports.
//!
//! The ensemble selection tool writes one report per ensemble size
//! (`ensembles_size_1.txt`, `ensembles_size_2.txt`, ...). Each report is a
//! flat list of candidate ensembles: a summary line per ensemble followed
//! by one state line per member conformer:
//!
//! ```text
//! 1 |  2.98 | x1 2.98 (1.05, -0.50)
//!     1   | 0.290 (0.290, 1.000) | ../foxs/rg26_run1/dcd2pdb_rg26_run1_60500.pdb.dat (0.125)
//!     3   | 0.470 (0.591, 0.121) | ../foxs/rg26_run1/dcd2pdb_rg26_run1_24500.pdb.dat (1.000)
//! ```
//!
//! The format is whitespace-heavy and the tool occasionally emits lines the
//! grammar does not cover, so the parser is total: malformed summary lines
//! are skipped, malformed state lines produce a zeroed record, and numeric
//! garbage inside an otherwise well-formed group parses to NaN. A report
//! never aborts the results stage.

mod assemble;

pub use assemble::{assemble_ensemble_pdb, AssembleError};

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A single conformer within a candidate ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleState {
    /// Conformer path with the profile extension stripped, as written in
    /// the report (usually relative to the report directory).
    pub pdb: String,
    /// Selected weight of this conformer.
    pub weight: f64,
    /// Mean weight across the selection runs.
    pub weight_avg: f64,
    /// Weight standard deviation across the selection runs.
    pub weight_stddev: f64,
    /// Fraction of selection runs that included this conformer.
    pub fraction: f64,
}

impl EnsembleState {
    fn zeroed() -> Self {
        Self {
            pdb: String::new(),
            weight: 0.0,
            weight_avg: 0.0,
            weight_stddev: 0.0,
            fraction: 0.0,
        }
    }
}

/// One candidate ensemble from a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleModel {
    /// Rank within the report, 1 is best.
    pub rank: u32,
    /// Chi-squared of the fit against the experimental profile.
    pub chi2: f64,
    /// Excluded volume adjustment parameter of the fit.
    pub c1: f64,
    /// Hydration layer density parameter of the fit.
    pub c2: f64,
    /// Member conformers, in report order.
    pub states: Vec<EnsembleState>,
}

/// A fully parsed report for one ensemble size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ensemble {
    /// The ensemble size this report covers.
    pub size: u32,
    /// Candidate ensembles, in report order (best first).
    pub models: Vec<EnsembleModel>,
}

fn state_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s+\d+\s*\|").unwrap())
}

fn model_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+\s*\|").unwrap())
}

fn paren_pair_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\(([^,()]*),([^()]*)\)").unwrap())
}

fn paren_single_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\(([^()]*)\)").unwrap())
}

fn pdb_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\s|]+\.pdb\.dat").unwrap())
}

/// Returns whether a report line is a state line.
///
/// State lines are indented (a summary line starts at column zero) and
/// always reference a conformer profile file.
pub fn is_state_line(line: &str) -> bool {
    state_line_re().is_match(line) && line.contains(".pdb.dat")
}

/// Parses a state line into an `EnsembleState`.
///
/// Total over arbitrary input: a line without at least three pipe-separated
/// fields yields a zeroed record, absent parenthesized groups yield 0.0,
/// and unparseable numbers inside present groups yield NaN.
pub fn parse_state_line(line: &str) -> EnsembleState {
    let parts: Vec<&str> = line.split('|').collect();
    if parts.len() < 3 {
        return EnsembleState::zeroed();
    }

    let weight_field = parts[1];
    let weight = weight_field
        .split_whitespace()
        .next()
        .map(|t| t.parse().unwrap_or(f64::NAN))
        .unwrap_or(f64::NAN);

    let (weight_avg, weight_stddev) = match paren_pair_re().captures(weight_field) {
        Some(caps) => (
            caps[1].trim().parse().unwrap_or(f64::NAN),
            caps[2].trim().parse().unwrap_or(f64::NAN),
        ),
        None => (0.0, 0.0),
    };

    let path_field = parts[2];
    let pdb = pdb_path_re()
        .find(path_field)
        .map(|m| m.as_str().trim_end_matches(".dat").to_string())
        .unwrap_or_default();

    let fraction = match paren_single_re().captures(path_field) {
        Some(caps) => caps[1].trim().parse().unwrap_or(f64::NAN),
        None => 0.0,
    };

    EnsembleState {
        pdb,
        weight,
        weight_avg,
        weight_stddev,
        fraction,
    }
}

/// Parses a summary line, returning `None` if the line does not match the
/// summary grammar (such lines are skipped by the file parser).
fn parse_model_line(line: &str) -> Option<EnsembleModel> {
    if !model_line_re().is_match(line) {
        return None;
    }

    let parts: Vec<&str> = line.split('|').collect();
    if parts.len() < 3 {
        return None;
    }

    let rank: u32 = parts[0].trim().parse().ok()?;
    let chi2: f64 = parts[1].trim().parse().ok()?;

    let (c1, c2) = match paren_pair_re().captures(parts[2]) {
        Some(caps) => (
            caps[1].trim().parse().unwrap_or(f64::NAN),
            caps[2].trim().parse().unwrap_or(f64::NAN),
        ),
        None => (0.0, 0.0),
    };

    Some(EnsembleModel {
        rank,
        chi2,
        c1,
        c2,
        states: Vec::new(),
    })
}

/// Parses a full report for the given ensemble size.
///
/// State lines are attached to the most recent summary line; state lines
/// appearing before any summary line are dropped, and lines matching
/// neither grammar are skipped.
pub fn parse_ensemble_file(content: &str, size: u32) -> Ensemble {
    let mut models: Vec<EnsembleModel> = Vec::new();

    for line in content.lines() {
        if is_state_line(line) {
            if let Some(model) = models.last_mut() {
                model.states.push(parse_state_line(line));
            }
        } else if let Some(model) = parse_model_line(line) {
            models.push(model);
        }
    }

    Ensemble { size, models }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_state_line_accepts_indented_state_lines() {
        let line =
            "    1   | 0.290 (0.290, 1.000) | ../foxs/rg26_run1/dcd2pdb_rg26_run1_60500.pdb.dat (0.125)";
        assert!(is_state_line(line));
        assert!(is_state_line(
            "  1 | 0.290 (0.290, 1.000) | file.pdb.dat (0.125)"
        ));
        assert!(is_state_line("\t\t1\t|\t0.290\t|\tfile.pdb.dat"));
    }

    #[test]
    fn test_is_state_line_rejects_summary_and_malformed_lines() {
        assert!(!is_state_line("1 |  2.98 | x1 2.98 (1.05, -0.50)"));
        assert!(!is_state_line("1|weight|file.pdb.dat"));
        assert!(!is_state_line("file.pdb.dat somewhere"));
        assert!(!is_state_line("| | file.pdb.dat"));
        assert!(!is_state_line(""));
        assert!(!is_state_line("   "));
    }

    #[test]
    fn test_parse_state_line_full() {
        let line =
            "    1   | 0.290 (0.290, 1.000) | ../foxs/rg26_run1/dcd2pdb_rg26_run1_60500.pdb.dat (0.125)";
        let state = parse_state_line(line);

        assert_eq!(state.pdb, "../foxs/rg26_run1/dcd2pdb_rg26_run1_60500.pdb");
        assert_eq!(state.weight, 0.29);
        assert_eq!(state.weight_avg, 0.29);
        assert_eq!(state.weight_stddev, 1.0);
        assert_eq!(state.fraction, 0.125);
    }

    #[test]
    fn test_parse_state_line_malformed_is_zeroed() {
        let state = parse_state_line("malformed line");
        assert_eq!(state, EnsembleState::zeroed());

        let state = parse_state_line("    1   | 0.290");
        assert_eq!(state, EnsembleState::zeroed());
    }

    #[test]
    fn test_parse_state_line_missing_groups_are_zero() {
        let state = parse_state_line("    1   | 0.290 | ../foxs/file.pdb.dat (0.125)");
        assert_eq!(state.weight, 0.29);
        assert_eq!(state.weight_avg, 0.0);
        assert_eq!(state.weight_stddev, 0.0);
        assert_eq!(state.fraction, 0.125);

        let state = parse_state_line("    1   | 0.290 (0.290, 1.000) | ../foxs/file.pdb.dat");
        assert_eq!(state.fraction, 0.0);
        assert_eq!(state.weight_stddev, 1.0);
    }

    #[test]
    fn test_parse_state_line_garbage_numbers_are_nan() {
        let state = parse_state_line("    1   | abc (def, ghi) | ../foxs/file.pdb.dat (jkl)");
        assert!(state.weight.is_nan());
        assert!(state.weight_avg.is_nan());
        assert!(state.weight_stddev.is_nan());
        assert!(state.fraction.is_nan());
        assert_eq!(state.pdb, "../foxs/file.pdb");
    }

    #[test]
    fn test_parse_state_line_no_pdb_path() {
        let state = parse_state_line("    1   | 0.290 (0.290, 1.000) | some other content (0.125)");
        assert_eq!(state.pdb, "");
        assert_eq!(state.weight, 0.29);
    }

    #[test]
    fn test_parse_ensemble_file_single_model() {
        let content = "1 |  2.98 | x1 2.98 (1.05, -0.50)\n          1   | 0.290 (0.290, 1.000) | ../foxs/rg26_run1/dcd2pdb_rg26_run1_60500.pdb.dat (0.125)\n          3   | 0.470 (0.591, 0.121) | ../foxs/rg26_run1/dcd2pdb_rg26_run1_24500.pdb.dat (1.000)";

        let ensemble = parse_ensemble_file(content, 2);

        assert_eq!(ensemble.size, 2);
        assert_eq!(ensemble.models.len(), 1);

        let model = &ensemble.models[0];
        assert_eq!(model.rank, 1);
        assert_eq!(model.chi2, 2.98);
        assert_eq!(model.c1, 1.05);
        assert_eq!(model.c2, -0.5);
        assert_eq!(model.states.len(), 2);
        assert_eq!(
            model.states[1].pdb,
            "../foxs/rg26_run1/dcd2pdb_rg26_run1_24500.pdb"
        );
        assert_eq!(model.states[1].weight_avg, 0.591);
    }

    #[test]
    fn test_parse_ensemble_file_multiple_models() {
        let content = "1 |  2.98 | x1 2.98 (1.05, -0.50)\n          1   | 0.290 (0.290, 1.000) | file1.pdb.dat (0.125)\n2 |  3.45 | x2 3.45 (1.20, -0.60)\n          1   | 0.400 (0.400, 0.900) | file2.pdb.dat (0.200)";

        let ensemble = parse_ensemble_file(content, 2);

        assert_eq!(ensemble.models.len(), 2);
        assert_eq!(ensemble.models[0].rank, 1);
        assert_eq!(ensemble.models[0].chi2, 2.98);
        assert_eq!(ensemble.models[0].states.len(), 1);
        assert_eq!(ensemble.models[1].rank, 2);
        assert_eq!(ensemble.models[1].chi2, 3.45);
        assert_eq!(ensemble.models[1].c1, 1.2);
    }

    #[test]
    fn test_parse_ensemble_file_empty_content() {
        let ensemble = parse_ensemble_file("", 1);
        assert_eq!(ensemble.size, 1);
        assert!(ensemble.models.is_empty());
    }

    #[test]
    fn test_parse_ensemble_file_model_with_no_states() {
        let content = "1 |  2.98 | x1 2.98 (1.05, -0.50)\n2 |  3.45 | x2 3.45 (1.20, -0.60)\n          1   | 0.400 (0.400, 0.900) | file2.pdb.dat (0.200)";

        let ensemble = parse_ensemble_file(content, 2);

        assert_eq!(ensemble.models.len(), 2);
        assert!(ensemble.models[0].states.is_empty());
        assert_eq!(ensemble.models[1].states.len(), 1);
    }

    #[test]
    fn test_parse_ensemble_file_skips_blank_and_malformed_lines() {
        let content = "malformed model line\n1 |  2.98 | x1 2.98 (1.05, -0.50)\n          \n          1   | 0.290 (0.290, 1.000) | file1.pdb.dat (0.125)\n   \ninvalid | model | line";

        let ensemble = parse_ensemble_file(content, 1);

        assert_eq!(ensemble.models.len(), 1);
        assert_eq!(ensemble.models[0].rank, 1);
        assert_eq!(ensemble.models[0].states.len(), 1);
    }

    #[test]
    fn test_parse_ensemble_file_realistic_report() {
        let content = "1 |  1.85 | x1 1.85 (0.95, -0.40)\n        2   | 0.150 (0.150, 0.850) | ../foxs/run1/file_001.pdb.dat (0.100)\n        4   | 0.350 (0.275, 0.125) | ../foxs/run1/file_002.pdb.dat (0.500)\n        7   | 0.500 (0.575, 0.025) | ../foxs/run1/file_003.pdb.dat (1.000)\n2 |  2.15 | x2 2.15 (1.10, -0.35)\n        1   | 0.200 (0.200, 0.800) | ../foxs/run2/file_001.pdb.dat (0.150)\n        3   | 0.800 (0.800, 0.200) | ../foxs/run2/file_002.pdb.dat (0.850)";

        let ensemble = parse_ensemble_file(content, 3);

        assert_eq!(ensemble.size, 3);
        assert_eq!(ensemble.models.len(), 2);
        assert_eq!(ensemble.models[0].states.len(), 3);
        assert_eq!(ensemble.models[1].states.len(), 2);
        assert!((ensemble.models[0].c1 - 0.95).abs() < 1e-9);
        assert!((ensemble.models[0].c2 + 0.4).abs() < 1e-9);
        assert!((ensemble.models[1].c1 - 1.1).abs() < 1e-9);
        assert!((ensemble.models[0].states[2].weight - 0.5).abs() < 1e-9);
    }
}
