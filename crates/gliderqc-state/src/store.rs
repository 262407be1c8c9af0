//! Storage traits for datasets and archival.
//!
//! - [`DatasetStore`]: dataset files plus their state sidecars. Synchronous,
//!   since QC runs on blocking worker threads.
//! - [`Archiver`]: relocation of completed datasets, awaited by the
//!   orchestrator.
//!
//! In-memory fakes live in [`crate::fakes`].

use async_trait::async_trait;
use gliderqc_core::{Dataset, DatasetId};

use crate::error::{ArchivalError, StorageResult};
use crate::record::DatasetState;

pub trait DatasetStore: Send + Sync {
    /// Pending dataset ids, sorted.
    fn list(&self) -> StorageResult<Vec<DatasetId>>;

    fn load(&self, id: &DatasetId) -> StorageResult<Dataset>;

    /// Replace the stored dataset. Must be atomic.
    fn save(&self, id: &DatasetId, dataset: &Dataset) -> StorageResult<()>;

    /// State of a dataset. A dataset without a recorded state is `incoming`.
    fn state(&self, id: &DatasetId) -> StorageResult<DatasetState>;

    /// Persist the state. Must be atomic.
    fn save_state(&self, id: &DatasetId, state: &DatasetState) -> StorageResult<()>;

    /// Take a dataset out of the queue without QC because its records are
    /// already queued elsewhere. It no longer appears in [`list`](Self::list).
    fn set_aside(&self, id: &DatasetId) -> StorageResult<()>;
}

/// Moves a `qc-complete` dataset out of the processing queue.
///
/// Relocating an already relocated dataset succeeds.
#[async_trait]
pub trait Archiver: Send + Sync {
    async fn relocate(&self, id: &DatasetId) -> Result<(), ArchivalError>;
}
