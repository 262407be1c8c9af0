//! In-memory fakes for the storage traits (testing only).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use gliderqc_core::{Dataset, DatasetId, DatasetStatus};

use crate::error::{ArchivalError, StorageError, StorageResult};
use crate::record::DatasetState;
use crate::store::{Archiver, DatasetStore};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct Entries {
    datasets: BTreeMap<DatasetId, Dataset>,
    states: BTreeMap<DatasetId, DatasetState>,
}

/// Queue and archive held in `BTreeMap`s.
#[derive(Debug, Default)]
pub struct MemoryDatasetStore {
    queue: Mutex<Entries>,
    archive: Mutex<Entries>,
    duplicates: Mutex<BTreeMap<DatasetId, Dataset>>,
}

impl MemoryDatasetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an `incoming` dataset to the queue.
    pub fn insert(&self, id: impl Into<String>, dataset: Dataset) -> DatasetId {
        let id = DatasetId::new(id);
        lock(&self.queue).datasets.insert(id.clone(), dataset);
        id
    }

    pub fn archived(&self) -> Vec<DatasetId> {
        lock(&self.archive).datasets.keys().cloned().collect()
    }

    pub fn archived_dataset(&self, id: &DatasetId) -> Option<Dataset> {
        lock(&self.archive).datasets.get(id).cloned()
    }

    pub fn archived_state(&self, id: &DatasetId) -> Option<DatasetState> {
        lock(&self.archive).states.get(id).cloned()
    }

    pub fn set_aside_ids(&self) -> Vec<DatasetId> {
        lock(&self.duplicates).keys().cloned().collect()
    }

    /// Move a `qc-complete` dataset to the archive. Returns `false` when it
    /// was archived already.
    fn relocate(&self, id: &DatasetId) -> Result<bool, ArchivalError> {
        let mut queue = lock(&self.queue);
        let mut archive = lock(&self.archive);

        if !queue.datasets.contains_key(id) {
            return if archive.datasets.contains_key(id) {
                Ok(false)
            } else {
                Err(ArchivalError::NotFound(id.clone()))
            };
        }
        let mut state = queue.states.get(id).cloned().unwrap_or_default();
        if state.status != DatasetStatus::QcComplete {
            return Err(ArchivalError::NotComplete {
                id: id.clone(),
                status: state.status,
            });
        }

        if let Some(dataset) = queue.datasets.remove(id) {
            archive.datasets.insert(id.clone(), dataset);
        }
        queue.states.remove(id);
        state.archived_at = Some(Utc::now());
        state.last_error = None;
        archive.states.insert(id.clone(), state);
        Ok(true)
    }
}

impl DatasetStore for MemoryDatasetStore {
    fn list(&self) -> StorageResult<Vec<DatasetId>> {
        Ok(lock(&self.queue).datasets.keys().cloned().collect())
    }

    fn load(&self, id: &DatasetId) -> StorageResult<Dataset> {
        lock(&self.queue)
            .datasets
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(id.clone()))
    }

    fn save(&self, id: &DatasetId, dataset: &Dataset) -> StorageResult<()> {
        lock(&self.queue).datasets.insert(id.clone(), dataset.clone());
        Ok(())
    }

    fn state(&self, id: &DatasetId) -> StorageResult<DatasetState> {
        let queue = lock(&self.queue);
        match queue.states.get(id) {
            Some(state) => Ok(state.clone()),
            None if queue.datasets.contains_key(id) => Ok(DatasetState::incoming()),
            None => Err(StorageError::NotFound(id.clone())),
        }
    }

    fn save_state(&self, id: &DatasetId, state: &DatasetState) -> StorageResult<()> {
        lock(&self.queue).states.insert(id.clone(), state.clone());
        Ok(())
    }

    fn set_aside(&self, id: &DatasetId) -> StorageResult<()> {
        let mut queue = lock(&self.queue);
        let dataset = queue
            .datasets
            .remove(id)
            .ok_or_else(|| StorageError::NotFound(id.clone()))?;
        queue.states.remove(id);
        lock(&self.duplicates).insert(id.clone(), dataset);
        Ok(())
    }
}

/// Archiver over a [`MemoryDatasetStore`] that records every call and can be
/// told to fail.
#[derive(Debug)]
pub struct MemoryArchiver {
    store: Arc<MemoryDatasetStore>,
    calls: Mutex<Vec<DatasetId>>,
    failures_remaining: AtomicUsize,
}

impl MemoryArchiver {
    pub fn new(store: Arc<MemoryDatasetStore>) -> Self {
        Self {
            store,
            calls: Mutex::new(Vec::new()),
            failures_remaining: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` relocations fail.
    pub fn fail_next(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<DatasetId> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl Archiver for MemoryArchiver {
    async fn relocate(&self, id: &DatasetId) -> Result<(), ArchivalError> {
        lock(&self.calls).push(id.clone());

        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ArchivalError::relocation(id, "injected failure"));
        }

        self.store.relocate(id).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gliderqc_core::RawProfile;

    fn dataset() -> Dataset {
        Dataset::new("ru30-20210503T1929", vec![RawProfile::new("p1", vec![])])
    }

    fn complete(store: &MemoryDatasetStore, id: &DatasetId) {
        let mut state = store.state(id).unwrap();
        state.begin_attempt("cfg").unwrap();
        state.complete("digest".to_string()).unwrap();
        store.save_state(id, &state).unwrap();
    }

    #[tokio::test]
    async fn archiver_moves_completed_dataset() {
        let store = Arc::new(MemoryDatasetStore::new());
        let id = store.insert("d1", dataset());
        complete(&store, &id);

        let archiver = MemoryArchiver::new(store.clone());
        archiver.relocate(&id).await.unwrap();

        assert!(store.list().unwrap().is_empty());
        assert_eq!(store.archived(), vec![id.clone()]);
        assert!(store.archived_state(&id).unwrap().is_archived());

        // Idempotent.
        archiver.relocate(&id).await.unwrap();
        assert_eq!(archiver.calls().len(), 2);
    }

    #[tokio::test]
    async fn archiver_refuses_incomplete_dataset() {
        let store = Arc::new(MemoryDatasetStore::new());
        let id = store.insert("d1", dataset());

        let err = MemoryArchiver::new(store.clone()).relocate(&id).await.unwrap_err();
        assert!(matches!(
            err,
            ArchivalError::NotComplete {
                status: DatasetStatus::Incoming,
                ..
            }
        ));
        assert_eq!(store.list().unwrap(), vec![id]);
    }

    #[test]
    fn set_aside_leaves_the_queue() {
        let store = MemoryDatasetStore::new();
        let kept = store.insert("d1", dataset());
        let duplicate = store.insert("d2", dataset());

        store.set_aside(&duplicate).unwrap();
        assert_eq!(store.list().unwrap(), vec![kept]);
        assert_eq!(store.set_aside_ids(), vec![duplicate.clone()]);
        assert!(matches!(store.state(&duplicate), Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = Arc::new(MemoryDatasetStore::new());
        let id = store.insert("d1", dataset());
        complete(&store, &id);

        let archiver = MemoryArchiver::new(store.clone());
        archiver.fail_next(1);
        assert!(archiver.relocate(&id).await.is_err());
        assert_eq!(store.state(&id).unwrap().status, DatasetStatus::QcComplete);
        archiver.relocate(&id).await.unwrap();
        assert_eq!(store.archived(), vec![id]);
    }
}
