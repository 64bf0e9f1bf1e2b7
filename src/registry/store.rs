//! Single-dataset store: every upload kept, deduplicated by content.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::dataset::DatasetDir;
use super::naming::unique_display_name;
use crate::codec::{encode, Cell};
use crate::config::{LimitsSection, ServiceConfig};
use crate::error::{DataslotError, IoContext, Result};
use crate::storage::{fingerprint, is_fingerprint, read_chunk, validate_upload, RowGroupSource};

/// Stored dataset as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDataset {
    /// Content fingerprint.
    pub dataset_id: String,
    /// Unique display name.
    pub display_name: String,
    /// Row count.
    pub n_rows: usize,
    /// Column count.
    pub n_cols: usize,
    /// Column names in storage order.
    pub columns: Vec<String>,
    /// Leading rows as column-to-cell records; upload responses only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<Vec<BTreeMap<String, Cell>>>,
}

/// Content-addressed store holding any number of datasets.
#[derive(Debug)]
pub struct DatasetStore {
    root: PathBuf,
    limits: LimitsSection,
    row_group_size: usize,
    naming: Mutex<()>,
}

impl DatasetStore {
    /// Opens (creating if needed) the store described by `config`.
    pub fn open(config: &ServiceConfig) -> Result<Self> {
        Self::with_root(
            &config.storage.datasets_dir(),
            config.limits.clone(),
            config.storage.row_group_size,
        )
    }

    /// Opens a store rooted at `root`.
    pub fn with_root(root: &Path, limits: LimitsSection, row_group_size: usize) -> Result<Self> {
        fs::create_dir_all(root).at(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            limits,
            row_group_size,
            naming: Mutex::new(()),
        })
    }

    /// Stores an upload (or finds the identical earlier one) and returns it
    /// with a sample of its leading rows.
    pub fn upload(&self, file_name: &str, bytes: &[u8]) -> Result<StoredDataset> {
        let upload = validate_upload(file_name, bytes, &self.limits)?;
        let id = fingerprint(bytes);
        let dir = DatasetDir::new(&self.root, &id);
        {
            let _naming = self.naming.lock();
            dir.discard_if_mismatched(&id)?;
            if !dir.reusable_for(&id) {
                let taken = self.display_names(&id)?;
                let name = unique_display_name(&upload.display_name, &taken);
                dir.materialize(&upload, &id, &name, self.row_group_size)?;
            }
        }
        self.describe(&dir, Some(self.limits.sample_rows))
    }

    /// Resolves a stored dataset without a sample.
    pub fn summary(&self, id: &str) -> Result<StoredDataset> {
        if !is_fingerprint(id) {
            return Err(DataslotError::not_found(id));
        }
        let dir = DatasetDir::new(&self.root, id);
        if !dir.is_materialized() {
            return Err(DataslotError::not_found(id));
        }
        self.describe(&dir, None)
    }

    fn describe(&self, dir: &DatasetDir, sample_rows: Option<usize>) -> Result<StoredDataset> {
        let summary = dir.summary()?;
        let dataset = dir.open()?;
        let columns = dataset.column_names();
        let sample = match sample_rows {
            Some(n) => {
                let grid = read_chunk(&dataset, &columns, 0, n)?;
                let records: Vec<BTreeMap<String, Cell>> = grid
                    .rows
                    .into_iter()
                    .map(|row| {
                        columns
                            .iter()
                            .cloned()
                            .zip(row.into_iter().map(encode))
                            .collect()
                    })
                    .collect();
                Some(records)
            }
            None => None,
        };
        Ok(StoredDataset {
            dataset_id: summary.dataset_id,
            display_name: summary.display_name,
            n_rows: summary.n_rows,
            n_cols: summary.n_cols,
            columns,
            sample,
        })
    }

    /// Display names of every stored dataset other than `except`.
    fn display_names(&self, except: &str) -> Result<HashSet<String>> {
        let mut names = HashSet::new();
        for entry in fs::read_dir(&self.root).at(&self.root)? {
            let entry = entry.at(&self.root)?;
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if id == except || !entry.path().is_dir() {
                continue;
            }
            if let Some(name) = DatasetDir::new(&self.root, &id).metadata().display_name {
                names.insert(name);
            }
        }
        Ok(names)
    }
}
