//! Error taxonomy shared by the registry, storage, and query layers.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::query::PipelineError;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, DataslotError>;

/// Errors surfaced by the registry, storage, and query layers.
///
/// Every variant is scoped to a single request; none of them are retried
/// internally. [`DataslotError::code`] yields the stable machine-readable
/// code returned to HTTP and CLI callers.
#[derive(Debug, Error)]
pub enum DataslotError {
    /// Upload used an extension outside the allowlist.
    #[error("only .csv or .parquet files are allowed (got '{name}')")]
    BadExtension {
        /// Sanitized file name as uploaded.
        name: String,
    },
    /// Upload carried zero bytes.
    #[error("file is empty")]
    EmptyFile,
    /// Upload exceeded a size ceiling.
    #[error("file too large ({size} bytes > {max} bytes)")]
    FileTooLarge {
        /// Bytes received or declared.
        size: u64,
        /// Ceiling that was exceeded.
        max: u64,
        /// Whether the hard ceiling (checked on the actual bytes) was hit.
        hard: bool,
    },
    /// Upload bytes could not be parsed into a table.
    #[error("could not parse file: {0}")]
    Parse(String),
    /// Unknown dataset or slot id.
    #[error("dataset {0} not found")]
    NotFound(String),
    /// Workspace already holds the maximum number of datasets.
    #[error("workspace supports up to {max} datasets")]
    SlotsFull {
        /// Slot capacity.
        max: usize,
    },
    /// I/O failure while materializing or reading a dataset.
    #[error("storage failure at {path}: {message}")]
    Storage {
        /// Path being read or written.
        path: PathBuf,
        /// Underlying failure.
        message: String,
    },
    /// Pipeline step rejected before execution.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    /// Raw query text rejected before execution.
    #[error("{0}")]
    BadQuery(&'static str),
    /// No datasets are loaded into the workspace.
    #[error("no workspace datasets are loaded")]
    NoDatasets,
    /// Query output is wider than the cell budget allows.
    #[error("query returns {columns} columns which exceeds max_cells={max_cells}")]
    TooManyColumns {
        /// Output column count.
        columns: usize,
        /// Cell budget in force.
        max_cells: usize,
    },
    /// Engine-reported failure, message passed through.
    #[error("{0}")]
    QueryExecution(String),
    /// Wall-clock budget exceeded; cancellation was attempted.
    #[error("query exceeded {seconds:.0}s")]
    QueryTimeout {
        /// Budget that elapsed.
        seconds: f64,
    },
    /// Unexpected failure inside the service (worker crash, poisoned state).
    #[error("internal error: {0}")]
    Internal(String),
}

impl DataslotError {
    /// Returns the stable machine-readable code for the variant.
    pub fn code(&self) -> &'static str {
        match self {
            DataslotError::BadExtension { .. } => "BAD_EXTENSION",
            DataslotError::EmptyFile => "EMPTY_FILE",
            DataslotError::FileTooLarge { .. } => "FILE_TOO_LARGE",
            DataslotError::Parse(_) => "PARSING_FAILED",
            DataslotError::NotFound(_) => "DATASET_NOT_FOUND",
            DataslotError::SlotsFull { .. } => "SLOTS_FULL",
            DataslotError::Storage { .. } => "STORE_FAILED",
            DataslotError::Pipeline(_) => "OPS_VALIDATION_ERROR",
            DataslotError::BadQuery(_) => "BAD_SQL",
            DataslotError::NoDatasets => "NO_DATASETS",
            DataslotError::TooManyColumns { .. } => "TOO_MANY_COLUMNS",
            DataslotError::QueryExecution(_) => "SQL_ERROR",
            DataslotError::QueryTimeout { .. } => "SQL_TIMEOUT",
            DataslotError::Internal(_) => "INTERNAL",
        }
    }

    /// HTTP status code associated with the variant.
    pub fn status(&self) -> u16 {
        match self {
            DataslotError::FileTooLarge { hard: true, .. } => 413,
            DataslotError::BadExtension { .. }
            | DataslotError::EmptyFile
            | DataslotError::FileTooLarge { .. }
            | DataslotError::Parse(_)
            | DataslotError::Pipeline(_)
            | DataslotError::BadQuery(_)
            | DataslotError::NoDatasets
            | DataslotError::TooManyColumns { .. }
            | DataslotError::QueryExecution(_) => 400,
            DataslotError::NotFound(_) => 404,
            DataslotError::QueryTimeout { .. } => 408,
            DataslotError::SlotsFull { .. } => 409,
            DataslotError::Storage { .. } | DataslotError::Internal(_) => 500,
        }
    }

    /// True when the failure was caused by the caller's input.
    pub fn is_client_fault(&self) -> bool {
        self.status() < 500
    }

    pub(crate) fn storage(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        DataslotError::Storage {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub(crate) fn not_found(id: impl Into<String>) -> Self {
        DataslotError::NotFound(id.into())
    }
}

impl From<rusqlite::Error> for DataslotError {
    fn from(err: rusqlite::Error) -> Self {
        DataslotError::QueryExecution(err.to_string())
    }
}

/// Extension used to attach a path to raw I/O failures.
pub(crate) trait IoContext<T> {
    fn at(self, path: &std::path::Path) -> Result<T>;
}

impl<T> IoContext<T> for std::result::Result<T, io::Error> {
    fn at(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|err| DataslotError::storage(path, err))
    }
}
