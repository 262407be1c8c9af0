//! Queue-level duplicate check, run before any dataset enters QC.
//!
//! Telemetry is sometimes queued twice, whole or in part. Neighbouring
//! `incoming` datasets are compared by their record timestamps and a dataset
//! whose timestamps all reappear in its neighbour is set aside.

use gliderqc_core::{covered_neighbours, obs, DatasetId, DatasetStatus};
use gliderqc_state::{DatasetStore, StorageError};
use tracing::{debug, warn};

/// A dataset taken out of the queue and the neighbour holding its records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetAside {
    pub id: DatasetId,
    pub covered_by: DatasetId,
}

/// Set aside every `incoming` dataset among `ids` (queue order) whose
/// timestamps are all present in the next or previous `incoming` dataset.
///
/// Unreadable datasets are left for QC to fail. A dataset that cannot be set
/// aside stays queued and is processed normally.
pub fn set_aside_duplicates(store: &dyn DatasetStore, ids: &[DatasetId]) -> Vec<SetAside> {
    let candidates: Vec<&DatasetId> = ids
        .iter()
        .filter(|id| matches!(store.state(id), Ok(state) if state.status == DatasetStatus::Incoming))
        .collect();

    let mut timestamps = Vec::with_capacity(candidates.len());
    for id in &candidates {
        let loaded = store
            .load(id)
            .and_then(|dataset| {
                dataset.timestamps().map_err(|source| StorageError::Integrity {
                    id: (*id).clone(),
                    source,
                })
            });
        match loaded {
            Ok(set) => timestamps.push(Some(set)),
            Err(e) => {
                debug!(dataset_id = %id, error = %e, "dataset left out of duplicate check");
                timestamps.push(None);
            }
        }
    }

    let mut set_aside = Vec::new();
    for (index, neighbour) in covered_neighbours(&timestamps) {
        let id = candidates[index];
        let covered_by = candidates[neighbour];
        if let Err(e) = store.set_aside(id) {
            warn!(dataset_id = %id, error = %e, "cannot set duplicate dataset aside");
            continue;
        }
        obs::emit_dataset_set_aside(id.as_str(), covered_by.as_str());
        set_aside.push(SetAside {
            id: id.clone(),
            covered_by: covered_by.clone(),
        });
    }
    set_aside
}
