use crate::driver::{FailurePolicy, OutputFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from ecgateway.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub source: SourceConfig,
    pub batch: BatchConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Gateway log to read. Usually given on the command line instead.
    pub log_file: Option<PathBuf>,
    /// Where the read offset is kept between runs.
    pub state_file: PathBuf,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct BatchConfig {
    pub on_error: FailurePolicy,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct MetricsConfig {
    pub prefix: String,
    pub suffix: String,
    pub format: OutputFormat,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            log_file: None,
            state_file: PathBuf::from(".ecgateway-metrics.state"),
        }
    }
}

impl AppConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "invalid config {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}
