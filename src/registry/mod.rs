//! Dataset directories, the workspace slot registry, and the single-dataset
//! store.

pub mod dataset;
mod naming;
pub mod slots;
pub mod store;
pub mod workspace;

pub use dataset::{DatasetDir, DatasetMetadata, DatasetSummary};
pub use naming::unique_display_name;
pub use slots::{SlotIndex, MAX_SLOTS};
pub use store::{DatasetStore, StoredDataset};
pub use workspace::{BoundTable, Workspace, WorkspaceUpload};
