//! Service configuration loaded from an optional TOML file.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable consulted for the configuration file path.
pub const CONFIG_ENV: &str = "DATASLOT_CONFIG";

/// Top-level configuration for the service and the CLI.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// HTTP listener settings.
    pub server: ServerSection,
    /// On-disk layout settings.
    pub storage: StorageSection,
    /// Upload limits.
    pub limits: LimitsSection,
    /// Query execution limits.
    pub query: QuerySection,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerSection {
    /// Interface to bind.
    pub host: IpAddr,
    /// Port to bind.
    pub port: u16,
    /// Origins allowed by the CORS layer.
    pub allow_origins: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: IpAddr::from([127, 0, 0, 1]),
            port: 8000,
            allow_origins: vec!["http://localhost:5173".to_string()],
        }
    }
}

/// On-disk layout settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageSection {
    /// Root directory holding both dataset stores.
    pub data_dir: PathBuf,
    /// Maximum rows per Parquet row group when materializing datasets.
    pub row_group_size: usize,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            row_group_size: 64 * 1024,
        }
    }
}

impl StorageSection {
    /// Directory of the single-dataset store.
    pub fn datasets_dir(&self) -> PathBuf {
        self.data_dir.join("datasets")
    }

    /// Directory of the multi-dataset workspace.
    pub fn workspace_dir(&self) -> PathBuf {
        self.data_dir.join("multifile")
    }
}

/// Upload limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsSection {
    /// Hard ceiling on the uploaded byte count.
    pub max_upload_bytes: u64,
    /// Ceiling checked against the declared size before reading the body.
    pub soft_max_upload_bytes: u64,
    /// Rows included in single-store upload samples.
    pub sample_rows: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_upload_bytes: 10 * 1024 * 1024,
            soft_max_upload_bytes: 50 * 1024 * 1024,
            sample_rows: 50,
        }
    }
}

/// Query execution limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QuerySection {
    /// Wall-clock budget per query, in milliseconds.
    pub timeout_ms: u64,
    /// Queries allowed to execute concurrently.
    pub workers: usize,
    /// Cell budget when the caller supplies none.
    pub default_max_cells: usize,
    /// Lower clamp for caller-supplied cell budgets.
    pub min_max_cells: usize,
    /// Upper clamp for caller-supplied cell budgets.
    pub max_max_cells: usize,
    /// Row limit when the caller supplies none.
    pub default_max_rows: usize,
    /// Upper clamp for caller-supplied row limits.
    pub hard_max_rows: usize,
    /// Ceiling applied to pipeline `limit` steps.
    pub pipeline_limit_ceiling: u64,
}

impl Default for QuerySection {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            workers: 4,
            default_max_cells: 20_000,
            min_max_cells: 1_000,
            max_max_cells: 200_000,
            default_max_rows: 500,
            hard_max_rows: 5_000,
            pipeline_limit_ceiling: 100_000,
        }
    }
}

impl QuerySection {
    /// Timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Failures while loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`ServiceConfig`].
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
}

impl ServiceConfig {
    /// Loads the configuration from `explicit`, or from [`CONFIG_ENV`], falling
    /// back to defaults when neither names an existing file.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
        match path {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Parses a specific TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults rooted at `data_dir`, handy for tests and embedding.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.storage.data_dir = data_dir.into();
        config
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|base| base.join("dataslot"))
        .unwrap_or_else(|| PathBuf::from("data"))
}
