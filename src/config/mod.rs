//! Worker configuration.
//!
//! Configuration comes from the environment with sensible defaults for
//! everything except the Redis and PostgreSQL URLs. Builder methods exist
//! for tests and embedding.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::model::RenderSettings;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// A value could not be parsed or is out of range.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue {
        /// Which setting was invalid.
        key: String,
        /// What was wrong with it.
        message: String,
    },
}

/// Configuration for the pipeline worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Redis connection URL.
    pub redis_url: String,
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Name of the pipeline task queue.
    pub pipeline_queue: String,
    /// Name of the movie render task queue.
    pub movie_queue: String,
    /// Root directory holding one working directory per job.
    pub upload_dir: PathBuf,
    /// Directory of input-deck templates.
    pub template_dir: PathBuf,
    /// Directory of stage and render scripts.
    pub scripts_dir: PathBuf,
    /// CHARMM binary.
    pub charmm_bin: String,
    /// FoXS binary.
    pub foxs_bin: String,
    /// MultiFoXS binary.
    pub multifoxs_bin: String,
    /// Pepsi-SANS binary.
    pub pepsisans_bin: String,
    /// SANS ensemble analysis binary.
    pub gasans_bin: String,
    /// Python interpreter for stage scripts.
    pub python_bin: String,
    /// PyMOL binary for movie rendering.
    pub pymol_bin: String,
    /// ffmpeg binary for poster/thumbnail extraction.
    pub ffmpeg_bin: String,
    /// Completion notification webhook; notifications are disabled when
    /// unset.
    pub notify_url: Option<String>,
    /// Run the MD stage through the remote HPC service.
    pub use_hpc: bool,
    /// Base URL of the remote HPC service.
    pub hpc_base_url: Option<String>,
    /// Hard timeout for a single tool invocation.
    pub tool_timeout: Duration,
    /// Delivery attempts per pipeline job before dead-lettering.
    pub max_attempts: u32,
    /// Delivery attempts per movie render task before dead-lettering.
    pub movie_max_attempts: u32,
    /// Default movie render settings.
    pub movie_settings: RenderSettings,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            database_url: "postgres://localhost/saxsflow".to_string(),
            pipeline_queue: "saxsflow:pipeline".to_string(),
            movie_queue: "saxsflow:movies".to_string(),
            upload_dir: PathBuf::from("/data/uploads"),
            template_dir: PathBuf::from("./templates"),
            scripts_dir: PathBuf::from("./scripts"),
            charmm_bin: "charmm".to_string(),
            foxs_bin: "foxs".to_string(),
            multifoxs_bin: "multi_foxs".to_string(),
            pepsisans_bin: "Pepsi-SANS".to_string(),
            gasans_bin: "gasans".to_string(),
            python_bin: "python3".to_string(),
            pymol_bin: "pymol".to_string(),
            ffmpeg_bin: "ffmpeg".to_string(),
            notify_url: None,
            use_hpc: false,
            hpc_base_url: None,
            tool_timeout: Duration::from_secs(6 * 3600),
            max_attempts: 3,
            movie_max_attempts: 2,
            movie_settings: RenderSettings::default(),
        }
    }
}

impl WorkerConfig {
    /// Loads configuration from the environment.
    ///
    /// `REDIS_URL` and `DATABASE_URL` are required; everything else falls
    /// back to the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self {
            redis_url: require_env("REDIS_URL")?,
            database_url: require_env("DATABASE_URL")?,
            ..Self::default()
        };

        if let Ok(dir) = std::env::var("UPLOAD_DIR") {
            config.upload_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("TEMPLATE_DIR") {
            config.template_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("SCRIPTS_DIR") {
            config.scripts_dir = PathBuf::from(dir);
        }
        if let Ok(bin) = std::env::var("CHARMM_BIN") {
            config.charmm_bin = bin;
        }
        if let Ok(bin) = std::env::var("FOXS_BIN") {
            config.foxs_bin = bin;
        }
        if let Ok(bin) = std::env::var("MULTIFOXS_BIN") {
            config.multifoxs_bin = bin;
        }
        if let Ok(bin) = std::env::var("PEPSISANS_BIN") {
            config.pepsisans_bin = bin;
        }
        if let Ok(bin) = std::env::var("GASANS_BIN") {
            config.gasans_bin = bin;
        }
        if let Ok(bin) = std::env::var("PYTHON_BIN") {
            config.python_bin = bin;
        }
        if let Ok(bin) = std::env::var("PYMOL_BIN") {
            config.pymol_bin = bin;
        }
        if let Ok(bin) = std::env::var("FFMPEG_BIN") {
            config.ffmpeg_bin = bin;
        }
        if let Ok(url) = std::env::var("NOTIFY_URL") {
            config.notify_url = Some(url);
        }
        if let Ok(value) = std::env::var("USE_HPC") {
            config.use_hpc = value == "1" || value.eq_ignore_ascii_case("true");
        }
        if let Ok(url) = std::env::var("HPC_BASE_URL") {
            config.hpc_base_url = Some(url);
        }
        if let Ok(value) = std::env::var("TOOL_TIMEOUT_SECS") {
            let secs: u64 = value.parse().map_err(|_| ConfigError::InvalidValue {
                key: "TOOL_TIMEOUT_SECS".to_string(),
                message: format!("not a number: {value}"),
            })?;
            config.tool_timeout = Duration::from_secs(secs);
        }
        if let Ok(value) = std::env::var("MAX_ATTEMPTS") {
            config.max_attempts = value.parse().map_err(|_| ConfigError::InvalidValue {
                key: "MAX_ATTEMPTS".to_string(),
                message: format!("not a number: {value}"),
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.tool_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "TOOL_TIMEOUT_SECS".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if self.use_hpc && self.hpc_base_url.is_none() {
            return Err(ConfigError::InvalidValue {
                key: "HPC_BASE_URL".to_string(),
                message: "required when USE_HPC is enabled".to_string(),
            });
        }
        Ok(())
    }

    /// Sets the upload directory.
    pub fn with_upload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.upload_dir = dir.into();
        self
    }

    /// Sets the template directory.
    pub fn with_template_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.template_dir = dir.into();
        self
    }

    /// Sets the scripts directory.
    pub fn with_scripts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scripts_dir = dir.into();
        self
    }

    /// Sets the notification webhook URL.
    pub fn with_notify_url(mut self, url: impl Into<String>) -> Self {
        self.notify_url = Some(url.into());
        self
    }

    /// Sets the per-tool timeout.
    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }
}

fn require_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.movie_max_attempts, 2);
        assert!(config.notify_url.is_none());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let config = WorkerConfig {
            max_attempts: 0,
            ..WorkerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_validate_requires_hpc_url_when_enabled() {
        let config = WorkerConfig {
            use_hpc: true,
            hpc_base_url: None,
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = WorkerConfig {
            use_hpc: true,
            hpc_base_url: Some("https://hpc.example.org".to_string()),
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = WorkerConfig::default()
            .with_upload_dir("/tmp/jobs")
            .with_notify_url("https://api.example.org/notify")
            .with_tool_timeout(Duration::from_secs(60));

        assert_eq!(config.upload_dir, PathBuf::from("/tmp/jobs"));
        assert_eq!(
            config.notify_url.as_deref(),
            Some("https://api.example.org/notify")
        );
        assert_eq!(config.tool_timeout, Duration::from_secs(60));
    }
}
