//! Dataset persistence for glider QC.
//!
//! Provides the [`DatasetStore`] and [`Archiver`] traits, their filesystem
//! implementations, the persisted [`DatasetState`] sidecar and the
//! deployment directory layout. In-memory fakes are in [`fakes`].

pub mod error;
pub mod fakes;
pub mod fs;
pub mod layout;
pub mod record;
pub mod store;

pub use error::{ArchivalError, StorageError, StorageResult};
pub use fs::{FsArchiver, FsDatasetStore};
pub use layout::{DataLevel, DataMode, DeploymentLayout};
pub use record::DatasetState;
pub use store::{Archiver, DatasetStore};
