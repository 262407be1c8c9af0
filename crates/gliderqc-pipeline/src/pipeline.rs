//! Batch orchestration over the datasets of one queue.
//!
//! Before QC, datasets whose records are all queued in a neighbour are set
//! aside. Every remaining dataset gets its own task. A semaphore bounds how
//! many run QC at once; the QC itself runs on a blocking thread. Completed datasets
//! are handed to the [`Archiver`] exactly once per batch. A configuration
//! error stops further scheduling; datasets already running finish.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use gliderqc_core::obs;
use gliderqc_core::{DatasetId, DatasetStatus, METRICS};
use gliderqc_state::{Archiver, DatasetStore};
use tokio::sync::{watch, Semaphore};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::config::QcPlan;
use crate::duplicates::{set_aside_duplicates, SetAside};
use crate::error::PipelineResult;
use crate::report::{BatchReport, DatasetOutcome, OutcomeStatus};
use crate::runner::{DatasetWorker, QcVerdict};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Maximum number of datasets under QC at the same time.
    pub max_workers: usize,
    /// Reprocess datasets left `qc-failed` by an earlier batch.
    pub retry_failed: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_workers: 4,
            retry_failed: false,
        }
    }
}

pub struct QcPipeline {
    store: Arc<dyn DatasetStore>,
    archiver: Arc<dyn Archiver>,
    plan: Option<Arc<QcPlan>>,
    options: PipelineOptions,
}

impl QcPipeline {
    pub fn new(
        store: Arc<dyn DatasetStore>,
        archiver: Arc<dyn Archiver>,
        plan: QcPlan,
        options: PipelineOptions,
    ) -> Self {
        Self {
            store,
            archiver,
            plan: Some(Arc::new(plan)),
            options,
        }
    }

    /// A pipeline that only relocates datasets already `qc-complete`.
    pub fn archive_only(store: Arc<dyn DatasetStore>, archiver: Arc<dyn Archiver>) -> Self {
        Self {
            store,
            archiver,
            plan: None,
            options: PipelineOptions::default(),
        }
    }

    /// Process every dataset in the queue once.
    ///
    /// Setting `shutdown` to `true` stops scheduling and asks running workers
    /// to stop between profiles; interrupted datasets stay `qc-in-progress`.
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> PipelineResult<BatchReport> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let started = Instant::now();

        let mut ids = self.store.list()?;
        let set_aside = self.set_aside_duplicates(&ids, &shutdown).await;
        ids.retain(|id| !set_aside.iter().any(|s| &s.id == id));
        let config_digest = self.plan.as_ref().map(|plan| plan.digest().to_string());
        let workers = self.options.max_workers.max(1);
        obs::emit_batch_started(
            &run_id,
            ids.len(),
            workers,
            config_digest.as_deref().unwrap_or("none"),
        );

        let (abort_tx, _abort_rx) = watch::channel(false);
        let abort = Arc::new(abort_tx);
        let semaphore = Arc::new(Semaphore::new(workers));

        let mut tasks = Vec::with_capacity(ids.len());
        for id in &ids {
            let task = DatasetTask {
                id: id.clone(),
                store: Arc::clone(&self.store),
                archiver: Arc::clone(&self.archiver),
                worker: self
                    .plan
                    .as_ref()
                    .map(|plan| DatasetWorker::new(Arc::clone(&self.store), Arc::clone(plan), run_id.clone())),
                retry_failed: self.options.retry_failed,
                semaphore: Arc::clone(&semaphore),
                shutdown: shutdown.clone(),
                abort: Arc::clone(&abort),
            };
            tasks.push(tokio::spawn(task.run()));
        }

        let mut outcomes = Vec::with_capacity(ids.len() + set_aside.len());
        for duplicate in set_aside {
            let mut outcome = DatasetOutcome::new(duplicate.id, OutcomeStatus::Duplicate);
            outcome.qc_status = Some(DatasetStatus::Incoming);
            outcome.covered_by = Some(duplicate.covered_by);
            outcomes.push(outcome);
        }
        for (id, joined) in ids.into_iter().zip(join_all(tasks).await) {
            let outcome = joined.unwrap_or_else(|e| {
                warn!(dataset_id = %id, error = %e, "dataset task did not finish");
                DatasetOutcome::new(id, OutcomeStatus::Interrupted).with_error(e)
            });
            outcomes.push(outcome);
        }
        outcomes.sort_by(|a, b| a.dataset_id.cmp(&b.dataset_id));

        let aborted = *abort.borrow();
        METRICS.flush();
        obs::emit_batch_finished(
            &run_id,
            outcomes.len(),
            aborted,
            started.elapsed().as_millis() as u64,
        );

        Ok(BatchReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            config_digest,
            aborted,
            outcomes,
        })
    }

    /// Only QC batches check for duplicates; archive-only batches never touch
    /// `incoming` datasets.
    async fn set_aside_duplicates(&self, ids: &[DatasetId], shutdown: &watch::Receiver<bool>) -> Vec<SetAside> {
        if self.plan.is_none() || *shutdown.borrow() {
            return Vec::new();
        }
        let store = Arc::clone(&self.store);
        let ids = ids.to_vec();
        match tokio::task::spawn_blocking(move || set_aside_duplicates(&*store, &ids)).await {
            Ok(set_aside) => set_aside,
            Err(e) => {
                warn!(error = %e, "duplicate check did not finish, queue processed as listed");
                Vec::new()
            }
        }
    }
}

/// Everything one dataset needs, owned so it can move into a task.
struct DatasetTask {
    id: DatasetId,
    store: Arc<dyn DatasetStore>,
    archiver: Arc<dyn Archiver>,
    worker: Option<DatasetWorker>,
    retry_failed: bool,
    semaphore: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
    abort: Arc<watch::Sender<bool>>,
}

impl DatasetTask {
    async fn run(self) -> DatasetOutcome {
        let Ok(_permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
            return self.not_started();
        };
        if *self.shutdown.borrow() || *self.abort.borrow() {
            return self.not_started();
        }

        let state = match self.store.state(&self.id) {
            Ok(state) => state,
            Err(e) => {
                warn!(dataset_id = %self.id, error = %e, "cannot read dataset state");
                return DatasetOutcome::new(self.id.clone(), OutcomeStatus::Failed).with_error(e);
            }
        };

        let mut outcome = DatasetOutcome::new(self.id.clone(), OutcomeStatus::Skipped);
        outcome.qc_status = Some(state.status);
        outcome.summary_digest = state.summary_digest.clone();

        match state.status {
            DatasetStatus::QcComplete => return self.archive(outcome).await,
            DatasetStatus::QcFailed if !self.retry_failed => return outcome,
            _ => {}
        }
        let Some(worker) = self.worker.clone() else {
            return outcome;
        };

        let id = self.id.clone();
        let shutdown = self.shutdown.clone();
        let processed = tokio::task::spawn_blocking(move || worker.process(&id, &shutdown)).await;

        let run = match processed {
            Err(e) => {
                warn!(dataset_id = %self.id, error = %e, "QC worker crashed");
                outcome.status = OutcomeStatus::Interrupted;
                outcome.qc_status = Some(DatasetStatus::QcInProgress);
                return outcome.with_error(e);
            }
            Ok(Err(e)) => {
                if e.is_fatal() {
                    warn!(dataset_id = %self.id, error = %e, "configuration error, no further datasets will be started");
                    self.abort.send_replace(true);
                }
                outcome.status = OutcomeStatus::Failed;
                outcome.qc_status = Some(DatasetStatus::QcFailed);
                return outcome.with_error(e);
            }
            Ok(Ok(run)) => run,
        };

        outcome.qc_status = Some(run.status());
        outcome.profiles_ok = run.profiles_ok;
        outcome.profiles_failed = run.profiles_failed;
        outcome.duplicates_removed = run.duplicates_removed;

        match run.verdict {
            QcVerdict::Complete { summary_digest } => {
                outcome.summary_digest = Some(summary_digest);
                self.archive(outcome).await
            }
            QcVerdict::Failed { reason } => {
                outcome.status = OutcomeStatus::Failed;
                outcome.summary_digest = None;
                outcome.with_error(reason)
            }
            QcVerdict::Interrupted => {
                outcome.status = OutcomeStatus::Interrupted;
                outcome.summary_digest = None;
                outcome
            }
        }
    }

    async fn archive(&self, mut outcome: DatasetOutcome) -> DatasetOutcome {
        outcome.qc_status = Some(DatasetStatus::QcComplete);
        match self.archiver.relocate(&self.id).await {
            Ok(()) => {
                obs::emit_archival(self.id.as_str(), true, None);
                outcome.status = OutcomeStatus::Archived;
                outcome.archived = true;
                outcome
            }
            Err(e) => {
                obs::emit_archival(self.id.as_str(), false, Some(&e));
                METRICS.inc_archivals_failed();
                let noted = self.store.state(&self.id).and_then(|mut state| {
                    state.note_error(format!("archival: {e}"));
                    self.store.save_state(&self.id, &state)
                });
                if let Err(se) = noted {
                    warn!(dataset_id = %self.id, error = %se, "cannot record archival failure");
                }
                outcome.status = OutcomeStatus::ArchivalPending;
                outcome.with_error(e)
            }
        }
    }

    fn not_started(&self) -> DatasetOutcome {
        let mut outcome = DatasetOutcome::new(self.id.clone(), OutcomeStatus::NotStarted);
        outcome.qc_status = self.store.state(&self.id).ok().map(|state| state.status);
        outcome
    }
}
