//! On-disk layout of one content-addressed dataset directory.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::error::{DataslotError, IoContext, Result};
use crate::storage::{
    parse_table, write_parquet, ParquetDataset, RowGroupSource, ValidatedUpload, DATA_FILE,
};

/// Marker file holding the fingerprint the directory was built from.
pub const HASH_FILE: &str = ".content_hash";
/// Display metadata written after a successful materialization.
pub const METADATA_FILE: &str = ".metadata.json";

/// Display metadata kept beside a dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetMetadata {
    /// Name shown to users.
    pub display_name: Option<String>,
    /// RFC 3339 UTC upload time.
    pub uploaded_at: Option<String>,
}

/// Summary of a materialized dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSummary {
    /// Content fingerprint.
    pub dataset_id: String,
    /// Name shown to users; falls back to the id.
    pub display_name: String,
    /// Row count.
    pub n_rows: usize,
    /// Column count.
    pub n_cols: usize,
    /// Upload time, when recorded.
    pub uploaded_at: Option<String>,
}

/// Paths of a dataset directory under a store root.
#[derive(Debug, Clone)]
pub struct DatasetDir {
    id: String,
    path: PathBuf,
}

impl DatasetDir {
    /// Directory for `id` under `root`. The id must already be validated.
    pub fn new(root: &Path, id: &str) -> Self {
        Self {
            id: id.to_string(),
            path: root.join(id),
        }
    }

    /// Dataset id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Columnar file path.
    pub fn data_path(&self) -> PathBuf {
        self.path.join(DATA_FILE)
    }

    fn hash_path(&self) -> PathBuf {
        self.path.join(HASH_FILE)
    }

    fn metadata_path(&self) -> PathBuf {
        self.path.join(METADATA_FILE)
    }

    /// True when the directory holds a columnar file.
    pub fn is_materialized(&self) -> bool {
        self.path.is_dir() && self.data_path().is_file()
    }

    /// Fingerprint recorded in the marker file, if readable and non-empty.
    pub fn stored_fingerprint(&self) -> Option<String> {
        let text = fs::read_to_string(self.hash_path()).ok()?;
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }

    /// Discards the directory when its marker disagrees with `fingerprint`.
    /// Returns whether anything was removed.
    pub fn discard_if_mismatched(&self, fingerprint: &str) -> Result<bool> {
        match self.stored_fingerprint() {
            Some(stored) if stored != fingerprint => {
                warn!(
                    dataset_id = %self.id,
                    stored = %stored,
                    "registry.dataset.fingerprint_mismatch"
                );
                self.remove()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// True when a previous materialization of exactly `fingerprint` can be
    /// reused.
    pub fn reusable_for(&self, fingerprint: &str) -> bool {
        self.is_materialized() && self.stored_fingerprint().as_deref() == Some(fingerprint)
    }

    /// Lenient metadata read: missing or malformed files yield defaults.
    pub fn metadata(&self) -> DatasetMetadata {
        read_json(&self.metadata_path()).unwrap_or_default()
    }

    /// Opens the columnar file.
    pub fn open(&self) -> Result<ParquetDataset> {
        ParquetDataset::open(&self.data_path())
    }

    /// Row/column counts plus display metadata.
    pub fn summary(&self) -> Result<DatasetSummary> {
        let dataset = self.open()?;
        let metadata = self.metadata();
        Ok(DatasetSummary {
            dataset_id: self.id.clone(),
            display_name: metadata
                .display_name
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| self.id.clone()),
            n_rows: dataset.num_rows(),
            n_cols: dataset.num_columns(),
            uploaded_at: metadata.uploaded_at.filter(|at| !at.is_empty()),
        })
    }

    /// Writes the raw bytes, fingerprint marker, columnar file and metadata.
    ///
    /// Any failure removes the whole directory before the error is returned.
    pub fn materialize(
        &self,
        upload: &ValidatedUpload<'_>,
        fingerprint: &str,
        display_name: &str,
        row_group_size: usize,
    ) -> Result<DatasetMetadata> {
        match self.try_materialize(upload, fingerprint, display_name, row_group_size) {
            Ok(metadata) => {
                info!(
                    dataset_id = %self.id,
                    display_name,
                    bytes = upload.bytes.len(),
                    "registry.dataset.materialized"
                );
                Ok(metadata)
            }
            Err(err) => {
                warn!(
                    dataset_id = %self.id,
                    error = %err,
                    "registry.dataset.materialize_failed"
                );
                if let Err(cleanup) = self.remove() {
                    warn!(
                        dataset_id = %self.id,
                        error = %cleanup,
                        "registry.dataset.cleanup_failed"
                    );
                }
                Err(err)
            }
        }
    }

    fn try_materialize(
        &self,
        upload: &ValidatedUpload<'_>,
        fingerprint: &str,
        display_name: &str,
        row_group_size: usize,
    ) -> Result<DatasetMetadata> {
        fs::create_dir_all(&self.path).at(&self.path)?;
        let raw_path = self.path.join(upload.format.raw_file_name());
        fs::write(&raw_path, upload.bytes).at(&raw_path)?;
        let hash_path = self.hash_path();
        fs::write(&hash_path, fingerprint).at(&hash_path)?;

        let batch = parse_table(upload.format, upload.bytes)?;
        write_parquet(&self.data_path(), &batch, row_group_size)?;

        let metadata = DatasetMetadata {
            display_name: Some(display_name.to_string()),
            uploaded_at: Some(now_rfc3339()),
        };
        write_json_atomic(&self.metadata_path(), &metadata)?;
        Ok(metadata)
    }

    /// Deletes the directory; a missing directory is not an error.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(DataslotError::storage(&self.path, err)),
        }
    }
}

fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&Rfc3339).unwrap_or_else(|_| now.to_string())
}

/// Reads a JSON file, treating absence or malformed contents as `None`.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Serializes `value` to a sibling temp file, syncs it, and renames it over
/// `path`.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value).map_err(|err| DataslotError::storage(path, err))?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    if let Some(parent) = tmp.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .at(&tmp)?;
        file.write_all(&bytes).at(&tmp)?;
        file.sync_all().at(&tmp)?;
    }
    fs::rename(&tmp, path).at(path)
}
