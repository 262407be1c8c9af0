//! Filesystem-backed dataset store and archiver.
//!
//! Layout of a queue (or archive) directory:
//!
//! ```text
//! <dir>/<dataset id>.json             dataset
//! <dir>/<dataset id>.qcstate.json     state sidecar
//! <dir>/<dataset id>.json.duplicate   dataset set aside as a duplicate
//! ```

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use gliderqc_core::{Dataset, DatasetId, DatasetStatus};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{ArchivalError, StorageError, StorageResult};
use crate::record::DatasetState;
use crate::store::{Archiver, DatasetStore};

const DATASET_SUFFIX: &str = ".json";
const SIDECAR_SUFFIX: &str = ".qcstate.json";
const DUPLICATE_SUFFIX: &str = ".duplicate";

pub fn dataset_path(dir: &Path, id: &DatasetId) -> PathBuf {
    dir.join(format!("{id}{DATASET_SUFFIX}"))
}

pub fn sidecar_path(dir: &Path, id: &DatasetId) -> PathBuf {
    dir.join(format!("{id}{SIDECAR_SUFFIX}"))
}

/// Where a dataset file goes when it is set aside.
pub fn duplicate_path(dir: &Path, id: &DatasetId) -> PathBuf {
    dir.join(format!("{id}{DATASET_SUFFIX}{DUPLICATE_SUFFIX}"))
}

/// Write to a temp file in `path`'s directory, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Dataset files in one directory, each with an optional state sidecar.
#[derive(Debug, Clone)]
pub struct FsDatasetStore {
    dir: PathBuf,
}

impl FsDatasetStore {
    /// Open the store at `dir`, creating the directory if needed.
    pub fn new(dir: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl DatasetStore for FsDatasetStore {
    fn list(&self) -> StorageResult<Vec<DatasetId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.ends_with(SIDECAR_SUFFIX) {
                continue;
            }
            if let Some(stem) = name.strip_suffix(DATASET_SUFFIX) {
                ids.push(DatasetId::new(stem));
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn load(&self, id: &DatasetId) -> StorageResult<Dataset> {
        let bytes = fs::read(dataset_path(&self.dir, id)).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                StorageError::NotFound(id.clone())
            } else {
                StorageError::Io(e)
            }
        })?;
        Dataset::from_json_slice(&bytes).map_err(|source| StorageError::Integrity {
            id: id.clone(),
            source,
        })
    }

    fn save(&self, id: &DatasetId, dataset: &Dataset) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(dataset)?;
        write_atomic(&dataset_path(&self.dir, id), &bytes)?;
        Ok(())
    }

    fn state(&self, id: &DatasetId) -> StorageResult<DatasetState> {
        match fs::read(sidecar_path(&self.dir, id)) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| StorageError::CorruptState {
                id: id.clone(),
                reason: e.to_string(),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if dataset_path(&self.dir, id).is_file() {
                    Ok(DatasetState::incoming())
                } else {
                    Err(StorageError::NotFound(id.clone()))
                }
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn save_state(&self, id: &DatasetId, state: &DatasetState) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(&sidecar_path(&self.dir, id), &bytes)?;
        Ok(())
    }

    fn set_aside(&self, id: &DatasetId) -> StorageResult<()> {
        let source = dataset_path(&self.dir, id);
        fs::rename(&source, duplicate_path(&self.dir, id)).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                StorageError::NotFound(id.clone())
            } else {
                StorageError::Io(e)
            }
        })?;
        match fs::remove_file(sidecar_path(&self.dir, id)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(dataset_id = %id, "dataset set aside as duplicate");
        Ok(())
    }
}

/// Moves completed datasets (and their sidecars) from a queue directory to
/// the directory they are published from.
#[derive(Debug, Clone)]
pub struct FsArchiver {
    queue_dir: PathBuf,
    archive_dir: PathBuf,
}

impl FsArchiver {
    pub fn new(queue_dir: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            queue_dir: queue_dir.into(),
            archive_dir: archive_dir.into(),
        }
    }
}

#[async_trait]
impl Archiver for FsArchiver {
    async fn relocate(&self, id: &DatasetId) -> Result<(), ArchivalError> {
        let source = dataset_path(&self.queue_dir, id);
        let target = dataset_path(&self.archive_dir, id);
        let fail = |e: std::io::Error| ArchivalError::relocation(id, e);

        if !tokio::fs::try_exists(&source).await.map_err(fail)? {
            return if tokio::fs::try_exists(&target).await.map_err(fail)? {
                debug!(dataset_id = %id, "dataset already archived");
                Ok(())
            } else {
                Err(ArchivalError::NotFound(id.clone()))
            };
        }

        let queued_sidecar = sidecar_path(&self.queue_dir, id);
        let mut state = match tokio::fs::read(&queued_sidecar).await {
            Ok(bytes) => serde_json::from_slice::<DatasetState>(&bytes)
                .map_err(|e| ArchivalError::relocation(id, e))?,
            Err(e) if e.kind() == ErrorKind::NotFound => DatasetState::incoming(),
            Err(e) => return Err(fail(e)),
        };
        if state.status != DatasetStatus::QcComplete {
            return Err(ArchivalError::NotComplete {
                id: id.clone(),
                status: state.status,
            });
        }

        tokio::fs::create_dir_all(&self.archive_dir).await.map_err(fail)?;

        state.archived_at = Some(Utc::now());
        state.last_error = None;
        let bytes = serde_json::to_vec_pretty(&state).map_err(|e| ArchivalError::relocation(id, e))?;
        let archived_sidecar = sidecar_path(&self.archive_dir, id);
        tokio::task::spawn_blocking(move || write_atomic(&archived_sidecar, &bytes))
            .await
            .map_err(|e| ArchivalError::relocation(id, e))?
            .map_err(fail)?;

        tokio::fs::rename(&source, &target).await.map_err(fail)?;
        match tokio::fs::remove_file(&queued_sidecar).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(fail(e)),
        }

        debug!(dataset_id = %id, archive = %self.archive_dir.display(), "dataset relocated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gliderqc_core::{RawProfile, RawRecord, RawTimestamp};

    fn make_store() -> (tempfile::TempDir, FsDatasetStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDatasetStore::new(dir.path().join("queue")).unwrap();
        (dir, store)
    }

    fn dataset() -> Dataset {
        let record = RawRecord::new(RawTimestamp::Text("2021-05-03T19:30:00Z".to_string()))
            .with_value("temperature", Some(12.5));
        Dataset::new("ru30-20210503T1929", vec![RawProfile::new("p1", vec![record])])
    }

    #[test]
    fn dataset_roundtrip() {
        let (_dir, store) = make_store();
        let id = DatasetId::new("ru30_0001");
        store.save(&id, &dataset()).unwrap();
        assert_eq!(store.load(&id).unwrap(), dataset());
    }

    #[test]
    fn list_skips_sidecars_and_sorts() {
        let (_dir, store) = make_store();
        for name in ["b", "a", "c"] {
            store.save(&DatasetId::new(name), &dataset()).unwrap();
        }
        store
            .save_state(&DatasetId::new("a"), &DatasetState::incoming())
            .unwrap();
        fs::write(store.dir().join("notes.txt"), b"ignored").unwrap();

        let ids: Vec<_> = store.list().unwrap().into_iter().map(|id| id.0).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn missing_sidecar_means_incoming() {
        let (_dir, store) = make_store();
        let id = DatasetId::new("fresh");
        store.save(&id, &dataset()).unwrap();
        assert_eq!(store.state(&id).unwrap().status, DatasetStatus::Incoming);

        let absent = store.state(&DatasetId::new("absent")).unwrap_err();
        assert!(matches!(absent, StorageError::NotFound(_)));
    }

    #[test]
    fn state_roundtrip() {
        let (_dir, store) = make_store();
        let id = DatasetId::new("d");
        store.save(&id, &dataset()).unwrap();
        let mut state = DatasetState::incoming();
        state.begin_attempt("cfg").unwrap();
        store.save_state(&id, &state).unwrap();
        assert_eq!(store.state(&id).unwrap(), state);
    }

    #[test]
    fn malformed_dataset_is_integrity_error() {
        let (_dir, store) = make_store();
        fs::write(store.dir().join("broken.json"), b"{ not json").unwrap();
        let err = store.load(&DatasetId::new("broken")).unwrap_err();
        assert!(matches!(err, StorageError::Integrity { .. }));
    }

    #[test]
    fn corrupt_sidecar_reported() {
        let (_dir, store) = make_store();
        let id = DatasetId::new("d");
        store.save(&id, &dataset()).unwrap();
        fs::write(sidecar_path(store.dir(), &id), b"[]").unwrap();
        assert!(matches!(store.state(&id), Err(StorageError::CorruptState { .. })));
    }

    #[test]
    fn set_aside_hides_dataset_from_queue() {
        let (_dir, store) = make_store();
        let id = DatasetId::new("ru30_0002");
        store.save(&id, &dataset()).unwrap();
        store.save_state(&id, &DatasetState::incoming()).unwrap();
        store.save(&DatasetId::new("ru30_0001"), &dataset()).unwrap();

        store.set_aside(&id).unwrap();

        assert_eq!(store.list().unwrap(), vec![DatasetId::new("ru30_0001")]);
        assert!(duplicate_path(store.dir(), &id).is_file());
        assert!(!sidecar_path(store.dir(), &id).exists());
        assert!(matches!(store.set_aside(&id), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn load_missing_is_not_found() {
        let (_dir, store) = make_store();
        match store.load(&DatasetId::new("nope")) {
            Err(StorageError::NotFound(id)) => assert_eq!(id.as_str(), "nope"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }
}
