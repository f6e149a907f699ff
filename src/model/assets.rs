//! Movie asset records for the render sub-pipeline.
//!
//! One asset exists per MD trajectory run directory (`rg_27`, `rg_32`, ...).
//! Assets are upserted by label so repeated enqueues update the existing
//! record instead of duplicating it, and `Ready` is a one-way door: a
//! rendered asset never transitions back to a non-ready state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a movie asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetStatus {
    /// Render task enqueued but not started.
    Queued,
    /// A render worker is processing the asset.
    Running,
    /// The movie exists on disk and the output paths are recorded.
    Ready,
    /// Rendering failed; `error` holds the reason.
    Failed,
}

impl std::fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssetStatus::Queued => write!(f, "queued"),
            AssetStatus::Running => write!(f, "running"),
            AssetStatus::Ready => write!(f, "ready"),
            AssetStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Trajectory inputs the movie is rendered from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovieSource {
    /// Topology PDB for the run.
    pub pdb: String,
    /// Trajectory file.
    pub dcd: String,
}

/// Render settings applied to a movie.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RenderSettings {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Keep every Nth trajectory frame.
    pub stride: u32,
    /// H.264 constant rate factor.
    pub crf: u32,
    /// Whether to ray-trace frames in PyMOL.
    pub ray: bool,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            stride: 10,
            crf: 22,
            ray: true,
        }
    }
}

/// Output files recorded once an asset is ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovieOutputs {
    /// Rendered movie path.
    pub mp4: String,
    /// Poster frame, if extraction succeeded.
    #[serde(default)]
    pub poster: Option<String>,
    /// Short looping preview gif, if extraction succeeded.
    #[serde(default)]
    pub thumb: Option<String>,
    /// Size of the mp4 in bytes.
    pub size_bytes: u64,
}

/// A movie asset attached to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovieAsset {
    /// Run directory label, e.g. `rg_27`.
    pub label: String,
    /// Current lifecycle status.
    pub status: AssetStatus,
    /// Trajectory inputs.
    pub source: MovieSource,
    /// Render settings.
    pub settings: RenderSettings,
    /// Outputs; present only when the asset is ready.
    #[serde(default)]
    pub outputs: Option<MovieOutputs>,
    /// Error text from the last failed render.
    #[serde(default)]
    pub error: Option<String>,
    /// Number of render attempts started.
    pub attempts: u32,
    /// When the asset was first created.
    pub created_at: DateTime<Utc>,
    /// When the asset was last updated.
    pub updated_at: DateTime<Utc>,
}

impl MovieAsset {
    /// Creates a queued asset with default render settings.
    pub fn new(label: impl Into<String>, source: MovieSource) -> Self {
        let now = Utc::now();
        Self {
            label: label.into(),
            status: AssetStatus::Queued,
            source,
            settings: RenderSettings::default(),
            outputs: None,
            error: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the render settings.
    pub fn with_settings(mut self, settings: RenderSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Marks the asset as running and counts the attempt.
    ///
    /// The counter is bumped here rather than on completion so a worker
    /// that dies mid-render still leaves evidence of the attempt.
    pub fn mark_running(&mut self) {
        if self.status == AssetStatus::Ready {
            return;
        }
        self.status = AssetStatus::Running;
        self.attempts += 1;
        self.updated_at = Utc::now();
    }

    /// Marks the asset as ready with its output files.
    pub fn mark_ready(&mut self, outputs: MovieOutputs) {
        self.status = AssetStatus::Ready;
        self.outputs = Some(outputs);
        self.error = None;
        self.updated_at = Utc::now();
    }

    /// Marks the asset as failed. Ready assets are left untouched.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        if self.status == AssetStatus::Ready {
            return;
        }
        self.status = AssetStatus::Failed;
        self.error = Some(error.into());
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_source() -> MovieSource {
        MovieSource {
            pdb: "md/rg_27/md.pdb".to_string(),
            dcd: "md/rg_27/md.dcd".to_string(),
        }
    }

    #[test]
    fn test_new_asset_is_queued() {
        let asset = MovieAsset::new("rg_27", sample_source());

        assert_eq!(asset.status, AssetStatus::Queued);
        assert_eq!(asset.attempts, 0);
        assert!(asset.outputs.is_none());
        assert_eq!(asset.settings, RenderSettings::default());
    }

    #[test]
    fn test_default_settings() {
        let settings = RenderSettings::default();
        assert_eq!(settings.width, 1280);
        assert_eq!(settings.height, 720);
        assert_eq!(settings.stride, 10);
        assert_eq!(settings.crf, 22);
        assert!(settings.ray);
    }

    #[test]
    fn test_mark_running_counts_attempts() {
        let mut asset = MovieAsset::new("rg_27", sample_source());

        asset.mark_running();
        assert_eq!(asset.status, AssetStatus::Running);
        assert_eq!(asset.attempts, 1);

        asset.mark_failed("pymol exited with code 1");
        asset.mark_running();
        assert_eq!(asset.attempts, 2);
    }

    #[test]
    fn test_mark_ready_clears_error() {
        let mut asset = MovieAsset::new("rg_27", sample_source());
        asset.mark_running();
        asset.mark_failed("transient failure");

        asset.mark_ready(MovieOutputs {
            mp4: "movies/rg_27.mp4".to_string(),
            poster: Some("movies/rg_27_poster.png".to_string()),
            thumb: None,
            size_bytes: 1024,
        });

        assert_eq!(asset.status, AssetStatus::Ready);
        assert!(asset.error.is_none());
        assert_eq!(asset.outputs.as_ref().unwrap().size_bytes, 1024);
    }

    #[test]
    fn test_ready_is_terminal() {
        let mut asset = MovieAsset::new("rg_27", sample_source());
        asset.mark_ready(MovieOutputs {
            mp4: "movies/rg_27.mp4".to_string(),
            poster: None,
            thumb: None,
            size_bytes: 42,
        });

        asset.mark_failed("late failure");
        assert_eq!(asset.status, AssetStatus::Ready);

        asset.mark_running();
        assert_eq!(asset.status, AssetStatus::Ready);
        assert_eq!(asset.attempts, 0);
    }

    #[test]
    fn test_asset_serialization_roundtrip() {
        let asset = MovieAsset::new("rg_32", sample_source());

        let json = serde_json::to_string(&asset).expect("serialization should work");
        let parsed: MovieAsset = serde_json::from_str(&json).expect("deserialization should work");

        assert_eq!(parsed, asset);
    }
}
