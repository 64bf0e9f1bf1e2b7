//! Persisted, ordered list of the workspace's current dataset ids.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use tracing::warn;

use super::dataset::{read_json, write_json_atomic, DatasetDir};
use crate::error::Result;
use crate::storage::is_fingerprint;

/// Maximum number of datasets loaded at once.
pub const MAX_SLOTS: usize = 3;
/// File name of the slot index inside the workspace root.
pub const INDEX_FILE: &str = "current.json";

/// Slot index file plus the lock serializing its read-modify-write cycles.
#[derive(Debug)]
pub struct SlotIndex {
    root: PathBuf,
    path: PathBuf,
    lock: Mutex<()>,
}

impl SlotIndex {
    /// Index for the workspace rooted at `root`.
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            path: root.join(INDEX_FILE),
            lock: Mutex::new(()),
        }
    }

    /// Location of the index file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Takes exclusive access to the index until the guard is dropped.
    pub fn lock(&self) -> SlotGuard<'_> {
        SlotGuard {
            index: self,
            _held: self.lock.lock(),
        }
    }

    fn read_raw(&self) -> Vec<String> {
        match read_json::<Value>(&self.path) {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(id) => Some(id),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    fn prune(&self, ids: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        ids.iter()
            .filter(|id| seen.insert(id.as_str()))
            .filter(|id| is_fingerprint(id) && DatasetDir::new(&self.root, id).is_materialized())
            .cloned()
            .collect()
    }
}

/// Exclusive view of the slot index.
pub struct SlotGuard<'a> {
    index: &'a SlotIndex,
    _held: MutexGuard<'a, ()>,
}

impl SlotGuard<'_> {
    /// Reads the persisted ids and drops duplicates and ids whose dataset is
    /// gone, rewriting the file when anything was dropped.
    pub fn reconcile(&self) -> Result<Vec<String>> {
        let raw = self.index.read_raw();
        let kept = self.index.prune(&raw);
        if kept != raw {
            warn!(
                path = %self.index.path.display(),
                dropped = raw.len() - kept.len(),
                "registry.slots.pruned"
            );
            self.persist(&kept)?;
        }
        Ok(kept)
    }

    /// Replaces the persisted ids.
    pub fn persist(&self, ids: &[String]) -> Result<()> {
        write_json_atomic(&self.index.path, ids)
    }
}
