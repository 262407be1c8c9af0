use std::path::PathBuf;

use gliderqc_core::QcError;
use gliderqc_state::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Qc(#[from] QcError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("cannot read QC config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse QC config {path}: {reason}")]
    ConfigParse { path: PathBuf, reason: String },
}

impl PipelineError {
    /// Whether the batch must stop scheduling datasets.
    pub fn is_fatal(&self) -> bool {
        match self {
            PipelineError::Qc(e) => e.is_fatal(),
            PipelineError::ConfigRead { .. } | PipelineError::ConfigParse { .. } => true,
            PipelineError::Storage(_) => false,
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
