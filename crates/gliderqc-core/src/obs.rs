//! Structured lifecycle events for QC runs.
//!
//! Each dataset gets its own span via [`DatasetSpan`]; lifecycle transitions
//! are emitted as `info!` events carrying an `event` field so they can be
//! filtered out of JSON logs.

use tracing::{info, warn};

/// RAII guard entering a dataset-scoped span.
///
/// ```ignore
/// let _span = DatasetSpan::enter(&run_id, "ru30_profile_0001");
/// ```
pub struct DatasetSpan {
    _span: tracing::span::EnteredSpan,
}

impl DatasetSpan {
    pub fn enter(run_id: &str, dataset_id: &str) -> Self {
        let span = tracing::info_span!("gliderqc.dataset", run_id = %run_id, dataset_id = %dataset_id);
        Self {
            _span: span.entered(),
        }
    }
}

pub fn emit_batch_started(run_id: &str, datasets: usize, workers: usize, config_digest: &str) {
    info!(
        event = "batch.started",
        run_id = %run_id,
        datasets = datasets,
        workers = workers,
        config_digest = %config_digest,
    );
}

/// Emit event: dataset entered `qc-in-progress`.
pub fn emit_dataset_started(dataset_id: &str, attempt: u32, profiles: usize) {
    info!(
        event = "dataset.started",
        dataset_id = %dataset_id,
        attempt = attempt,
        profiles = profiles,
    );
}

/// Emit event: one stage finished on one profile.
pub fn emit_stage_finished(dataset_id: &str, profile_id: &str, stage: &str, flags: usize) {
    tracing::debug!(
        event = "stage.finished",
        dataset_id = %dataset_id,
        profile_id = %profile_id,
        stage = %stage,
        flags = flags,
    );
}

/// Emit event: a profile failed and was isolated (warning level).
pub fn emit_profile_failed(dataset_id: &str, profile_id: &str, stage: &str, error: &dyn std::fmt::Display) {
    warn!(
        event = "profile.failed",
        dataset_id = %dataset_id,
        profile_id = %profile_id,
        stage = %stage,
        error = %error,
    );
}

/// Emit event: dataset reached a final QC state.
pub fn emit_dataset_finished(
    dataset_id: &str,
    status: &str,
    profiles_ok: usize,
    profiles_failed: usize,
    duration_ms: u64,
) {
    info!(
        event = "dataset.finished",
        dataset_id = %dataset_id,
        status = %status,
        profiles_ok = profiles_ok,
        profiles_failed = profiles_failed,
        duration_ms = duration_ms,
    );
}

/// Emit event: archival attempted for a completed dataset.
pub fn emit_archival(dataset_id: &str, success: bool, error: Option<&dyn std::fmt::Display>) {
    match error {
        None => info!(event = "dataset.archived", dataset_id = %dataset_id, success = success),
        Some(error) => warn!(
            event = "dataset.archival_failed",
            dataset_id = %dataset_id,
            success = success,
            error = %error,
        ),
    }
}

/// Emit event: a queued dataset was set aside because a neighbour holds all its records.
pub fn emit_dataset_set_aside(dataset_id: &str, covered_by: &str) {
    info!(
        event = "dataset.set_aside",
        dataset_id = %dataset_id,
        covered_by = %covered_by,
    );
}

pub fn emit_batch_finished(run_id: &str, datasets: usize, aborted: bool, duration_ms: u64) {
    info!(
        event = "batch.finished",
        run_id = %run_id,
        datasets = datasets,
        aborted = aborted,
        duration_ms = duration_ms,
    );
}
