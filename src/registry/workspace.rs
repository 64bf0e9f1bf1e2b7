//! Multi-dataset workspace: up to [`MAX_SLOTS`] content-addressed datasets
//! loaded at once.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::dataset::{DatasetDir, DatasetSummary};
use super::slots::{SlotIndex, MAX_SLOTS};
use crate::config::{LimitsSection, ServiceConfig};
use crate::error::{DataslotError, IoContext, Result};
use crate::storage::{
    browse, fingerprint, is_fingerprint, validate_upload, Chunk, ChunkRequest, ParquetDataset,
};

/// Outcome of a workspace upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceUpload {
    /// Dataset the upload resolved to.
    #[serde(flatten)]
    pub dataset: DatasetSummary,
    /// True when the dataset already held a slot; nothing was changed.
    pub already_present: bool,
    /// Slots in use after the upload.
    pub slot_count: usize,
}

/// A current dataset bound to its query table name.
#[derive(Debug, Clone)]
pub struct BoundTable {
    /// Table name: `t1`, `t2`, `t3` in slot order.
    pub name: String,
    /// Dataset id behind the table.
    pub dataset_id: String,
    /// Columnar data.
    pub dataset: ParquetDataset,
}

/// Content-addressed dataset directories plus the slot index.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    slots: SlotIndex,
    limits: LimitsSection,
    row_group_size: usize,
}

impl Workspace {
    /// Opens (creating if needed) the workspace described by `config`.
    pub fn open(config: &ServiceConfig) -> Result<Self> {
        Self::with_root(
            &config.storage.workspace_dir(),
            config.limits.clone(),
            config.storage.row_group_size,
        )
    }

    /// Opens a workspace rooted at `root`.
    pub fn with_root(root: &Path, limits: LimitsSection, row_group_size: usize) -> Result<Self> {
        fs::create_dir_all(root).at(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            slots: SlotIndex::new(root),
            limits,
            row_group_size,
        })
    }

    /// Workspace directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validates the upload, then assigns it a slot, reusing an existing
    /// materialization when the content was seen before.
    pub fn register_or_reuse(&self, file_name: &str, bytes: &[u8]) -> Result<WorkspaceUpload> {
        let upload = validate_upload(file_name, bytes, &self.limits)?;
        let id = fingerprint(bytes);
        let dir = DatasetDir::new(&self.root, &id);

        let slots = self.slots.lock();
        let mut ids = slots.reconcile()?;
        if ids.contains(&id) {
            return Ok(WorkspaceUpload {
                dataset: dir.summary()?,
                already_present: true,
                slot_count: ids.len(),
            });
        }
        if ids.len() >= MAX_SLOTS {
            return Err(DataslotError::SlotsFull { max: MAX_SLOTS });
        }

        dir.discard_if_mismatched(&id)?;
        if dir.reusable_for(&id) {
            info!(dataset_id = %id, "registry.workspace.reuse");
        } else {
            dir.materialize(&upload, &id, &upload.display_name, self.row_group_size)?;
        }
        ids.push(id.clone());
        slots.persist(&ids)?;
        info!(dataset_id = %id, slot_count = ids.len(), "registry.workspace.loaded");

        Ok(WorkspaceUpload {
            dataset: dir.summary()?,
            already_present: false,
            slot_count: ids.len(),
        })
    }

    /// Current datasets in slot order.
    pub fn current(&self) -> Result<Vec<DatasetSummary>> {
        self.current_ids()?
            .iter()
            .map(|id| DatasetDir::new(&self.root, id).summary())
            .collect()
    }

    /// Current dataset ids in slot order, after pruning stale entries.
    pub fn current_ids(&self) -> Result<Vec<String>> {
        self.slots.lock().reconcile()
    }

    /// Evicts `id` from the slots, then deletes its directory. Returns the
    /// remaining slot count.
    pub fn remove(&self, id: &str) -> Result<usize> {
        let slots = self.slots.lock();
        let mut ids = slots.reconcile()?;
        let position = ids
            .iter()
            .position(|current| current == id)
            .ok_or_else(|| DataslotError::not_found(id))?;
        ids.remove(position);
        slots.persist(&ids)?;
        DatasetDir::new(&self.root, id).remove()?;
        info!(dataset_id = %id, slot_count = ids.len(), "registry.workspace.evicted");
        Ok(ids.len())
    }

    /// Evicts every current dataset and deletes their directories.
    pub fn remove_all(&self) -> Result<()> {
        let slots = self.slots.lock();
        let ids = slots.reconcile()?;
        slots.persist(&[])?;
        for id in &ids {
            DatasetDir::new(&self.root, id).remove()?;
        }
        info!(evicted = ids.len(), "registry.workspace.cleared");
        Ok(())
    }

    /// Resolves a stored dataset by id.
    pub fn dataset(&self, id: &str) -> Result<ParquetDataset> {
        let dir = self.existing(id)?;
        dir.open()
    }

    /// Clamped browse page of a stored dataset.
    pub fn chunk(&self, id: &str, request: ChunkRequest) -> Result<Chunk> {
        let dataset = self.dataset(id)?;
        browse(&dataset, id, request)
    }

    /// Current datasets bound to `t1`, `t2`, `t3` in slot order.
    pub fn bound_tables(&self) -> Result<Vec<BoundTable>> {
        self.current_ids()?
            .into_iter()
            .enumerate()
            .map(|(idx, id)| {
                let dataset = DatasetDir::new(&self.root, &id).open()?;
                Ok(BoundTable {
                    name: format!("t{}", idx + 1),
                    dataset_id: id,
                    dataset,
                })
            })
            .collect()
    }

    fn existing(&self, id: &str) -> Result<DatasetDir> {
        if !is_fingerprint(id) {
            return Err(DataslotError::not_found(id));
        }
        let dir = DatasetDir::new(&self.root, id);
        if dir.is_materialized() {
            Ok(dir)
        } else {
            Err(DataslotError::not_found(id))
        }
    }
}
