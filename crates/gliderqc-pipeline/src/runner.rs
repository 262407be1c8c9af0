//! Per-dataset QC: lifecycle transitions around the profile stages.
//!
//! Runs on a blocking worker thread. The worker owns the dataset from the
//! moment it enters `qc-in-progress` until its final state is committed.

use std::sync::Arc;
use std::time::Instant;

use gliderqc_core::obs::{self, DatasetSpan};
use gliderqc_core::{
    summary_digest, DatasetId, DatasetStatus, DuplicateTimestampDetector, Profile, QcError,
    RawProfile, METRICS,
};
use gliderqc_state::{DatasetStore, StorageError};
use tokio::sync::watch;
use tracing::warn;

use crate::config::QcPlan;
use crate::error::PipelineResult;
use crate::stage::QcStage;

/// How a QC pass over one dataset ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QcVerdict {
    Complete { summary_digest: String },
    Failed { reason: String },
    /// Shutdown requested; the dataset was left `qc-in-progress`.
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QcRun {
    pub verdict: QcVerdict,
    pub profiles_ok: usize,
    pub profiles_failed: usize,
    pub duplicates_removed: usize,
    pub flags_written: usize,
}

impl QcRun {
    fn new(verdict: QcVerdict) -> Self {
        Self {
            verdict,
            profiles_ok: 0,
            profiles_failed: 0,
            duplicates_removed: 0,
            flags_written: 0,
        }
    }

    pub fn status(&self) -> DatasetStatus {
        match self.verdict {
            QcVerdict::Complete { .. } => DatasetStatus::QcComplete,
            QcVerdict::Failed { .. } => DatasetStatus::QcFailed,
            QcVerdict::Interrupted => DatasetStatus::QcInProgress,
        }
    }
}

enum ProfileError {
    Stage(QcStage, QcError),
    Cancelled,
}

struct ProfileStats {
    duplicates_removed: usize,
    flags_written: usize,
}

/// Runs the QC stages of a batch on individual datasets.
#[derive(Clone)]
pub struct DatasetWorker {
    store: Arc<dyn DatasetStore>,
    plan: Arc<QcPlan>,
    run_id: String,
}

impl DatasetWorker {
    pub fn new(store: Arc<dyn DatasetStore>, plan: Arc<QcPlan>, run_id: impl Into<String>) -> Self {
        Self {
            store,
            plan,
            run_id: run_id.into(),
        }
    }

    /// Take the dataset through one QC pass and commit its final state.
    ///
    /// Errors leave the dataset `qc-failed` where the state can still be
    /// written. A configuration error is returned as an error after the
    /// dataset has been failed, so the caller can stop scheduling.
    pub fn process(&self, id: &DatasetId, shutdown: &watch::Receiver<bool>) -> PipelineResult<QcRun> {
        let _span = DatasetSpan::enter(&self.run_id, id.as_str());
        let started = Instant::now();

        let mut state = self.store.state(id)?;
        state.begin_attempt(self.plan.digest())?;
        self.store.save_state(id, &state)?;

        let result = self.run_stages(id, state.attempts, shutdown);
        let run = match result {
            Ok(run) => run,
            Err(e) => {
                let committed = state
                    .fail(e.to_string())
                    .and_then(|_| self.store.save_state(id, &state));
                if let Err(se) = committed {
                    warn!(dataset_id = %id, error = %se, "could not mark dataset qc-failed");
                }
                METRICS.inc_datasets_failed();
                obs::emit_dataset_finished(id.as_str(), "qc-failed", 0, 0, elapsed_ms(started));
                return Err(e);
            }
        };

        match &run.verdict {
            QcVerdict::Complete { summary_digest } => {
                state.complete(summary_digest.clone())?;
                self.store.save_state(id, &state)?;
            }
            QcVerdict::Failed { reason } => {
                state.fail(reason.clone())?;
                self.store.save_state(id, &state)?;
                METRICS.inc_datasets_failed();
            }
            QcVerdict::Interrupted => {
                warn!(dataset_id = %id, "shutdown requested, dataset left qc-in-progress");
            }
        }

        METRICS.inc_datasets_processed();
        METRICS.add_duplicates_removed(run.duplicates_removed as u64);
        METRICS.add_flags_written(run.flags_written as u64);
        obs::emit_dataset_finished(
            id.as_str(),
            run.status().as_str(),
            run.profiles_ok,
            run.profiles_failed,
            elapsed_ms(started),
        );
        Ok(run)
    }

    fn run_stages(
        &self,
        id: &DatasetId,
        attempt: u32,
        shutdown: &watch::Receiver<bool>,
    ) -> PipelineResult<QcRun> {
        let mut dataset = match self.store.load(id) {
            Ok(dataset) => dataset,
            Err(StorageError::Integrity { source, .. }) => {
                return Ok(QcRun::new(QcVerdict::Failed {
                    reason: source.to_string(),
                }));
            }
            Err(e) => return Err(e.into()),
        };
        dataset.reset_qc();
        obs::emit_dataset_started(id.as_str(), attempt, dataset.profiles.len());

        let mut run = QcRun::new(QcVerdict::Interrupted);
        let mut completed = Vec::with_capacity(dataset.profiles.len());
        let mut first_error: Option<String> = None;
        let mut fatal: Option<QcError> = None;

        for raw in &mut dataset.profiles {
            if *shutdown.borrow() {
                return Ok(run);
            }
            match self.run_profile(id, raw, shutdown) {
                Ok((profile, stats)) => {
                    run.profiles_ok += 1;
                    run.duplicates_removed += stats.duplicates_removed;
                    run.flags_written += stats.flags_written;
                    completed.push(profile);
                }
                Err(ProfileError::Cancelled) => return Ok(run),
                Err(ProfileError::Stage(stage, e)) => {
                    let reason = format!("{stage}: {e}");
                    raw.qc_error = Some(reason.clone());
                    obs::emit_profile_failed(id.as_str(), &raw.profile_id, stage.as_str(), &e);
                    METRICS.inc_profiles_failed();

                    if e.is_fatal() {
                        fatal = Some(e);
                        break;
                    }
                    run.profiles_failed += 1;
                    if first_error.is_none() {
                        first_error = Some(format!("profile {}: {reason}", raw.profile_id));
                    }
                }
            }
        }

        self.store.save(id, &dataset)?;
        if let Some(e) = fatal {
            return Err(e.into());
        }

        run.verdict = match first_error {
            None => QcVerdict::Complete {
                summary_digest: summary_digest(&completed),
            },
            Some(first) => QcVerdict::Failed {
                reason: format!(
                    "{} of {} profiles failed; first: {first}",
                    run.profiles_failed,
                    run.profiles_failed + run.profiles_ok
                ),
            },
        };
        Ok(run)
    }

    /// Parse and flag one profile. Flags written before a stage error are
    /// kept in `raw`.
    fn run_profile(
        &self,
        id: &DatasetId,
        raw: &mut RawProfile,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(Profile, ProfileStats), ProfileError> {
        let mut profile = Profile::from_raw(raw).map_err(|e| ProfileError::Stage(QcStage::Parse, e.into()))?;

        let dedup = DuplicateTimestampDetector::new().run(&mut profile);
        raw.duplicates_removed = Some(raw.duplicates_removed.unwrap_or(0) + dedup.removed);
        obs::emit_stage_finished(id.as_str(), &profile.profile_id, QcStage::Dedup.as_str(), 0);

        let result = self.flag_profile(id, &mut profile, shutdown);
        profile.write_into(raw);
        let flags_written = result?;

        Ok((
            profile,
            ProfileStats {
                duplicates_removed: dedup.removed,
                flags_written,
            },
        ))
    }

    fn flag_profile(
        &self,
        id: &DatasetId,
        profile: &mut Profile,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<usize, ProfileError> {
        let mut total = 0;
        for stage in QcStage::FLAGGING {
            if *shutdown.borrow() {
                return Err(ProfileError::Cancelled);
            }
            let written = match stage {
                QcStage::Qartod => self.plan.runner().run(profile).map(|r| r.total()),
                QcStage::Hysteresis => match self.plan.hysteresis() {
                    Some(test) => test.run(profile).map(|r| r.counts.values().sum()),
                    None => Ok(0),
                },
                QcStage::Summary => self.plan.summarizer().summarize(profile).map(|r| r.written()),
                QcStage::Parse | QcStage::Dedup => Ok(0),
            }
            .map_err(|e| ProfileError::Stage(stage, e))?;

            obs::emit_stage_finished(id.as_str(), &profile.profile_id, stage.as_str(), written);
            total += written;
        }
        Ok(total)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
