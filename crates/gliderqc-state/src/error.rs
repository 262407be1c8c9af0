//! Error types for gliderqc-state

use gliderqc_core::{DataIntegrityError, DatasetId, DatasetStatus};
use thiserror::Error;

/// Errors raised by dataset stores.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("dataset not found: {0}")]
    NotFound(DatasetId),

    /// The dataset file exists but cannot be read into the data model.
    #[error("dataset {id} is unreadable: {source}")]
    Integrity {
        id: DatasetId,
        #[source]
        source: DataIntegrityError,
    },

    #[error("corrupt state sidecar for {id}: {reason}")]
    CorruptState { id: DatasetId, reason: String },

    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition {
        from: DatasetStatus,
        to: DatasetStatus,
    },

    #[error("invalid deployment name {name:?}: {reason}")]
    InvalidDeployment { name: String, reason: String },
}

/// Relocation of a completed dataset failed. The dataset stays `qc-complete`.
#[derive(Error, Debug)]
pub enum ArchivalError {
    #[error("dataset {id} is {status}, only qc-complete datasets are archived")]
    NotComplete { id: DatasetId, status: DatasetStatus },

    #[error("dataset {0} is in neither the queue nor the archive")]
    NotFound(DatasetId),

    #[error("relocating {id} failed: {reason}")]
    Relocation { id: DatasetId, reason: String },
}

impl ArchivalError {
    pub(crate) fn relocation(id: &DatasetId, reason: impl std::fmt::Display) -> Self {
        ArchivalError::Relocation {
            id: id.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;
