//! Per-dataset outcomes of one batch.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use gliderqc_core::{DatasetId, DatasetStatus};
use serde::{Deserialize, Serialize};

/// What happened to one dataset during a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// QC complete and relocated.
    Archived,
    /// QC complete; relocation failed and can be retried.
    ArchivalPending,
    /// QC failed; the dataset stays in the queue.
    Failed,
    /// Not eligible in this batch (e.g. `qc-failed` without retry).
    Skipped,
    /// Never scheduled because the batch stopped early.
    NotStarted,
    /// Left `qc-in-progress` by cancellation or a worker crash.
    Interrupted,
    /// Set aside before QC; a neighbouring dataset holds all its records.
    Duplicate,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeStatus::Archived => "archived",
            OutcomeStatus::ArchivalPending => "archival-pending",
            OutcomeStatus::Failed => "failed",
            OutcomeStatus::Skipped => "skipped",
            OutcomeStatus::NotStarted => "not-started",
            OutcomeStatus::Interrupted => "interrupted",
            OutcomeStatus::Duplicate => "duplicate",
        }
    }

    /// Whether the dataset ended the batch in a settled state.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            OutcomeStatus::Archived
                | OutcomeStatus::ArchivalPending
                | OutcomeStatus::Failed
                | OutcomeStatus::Skipped
                | OutcomeStatus::Duplicate
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetOutcome {
    pub dataset_id: DatasetId,
    pub status: OutcomeStatus,
    /// Lifecycle state recorded for the dataset at the end of the batch.
    pub qc_status: Option<DatasetStatus>,
    pub archived: bool,
    pub profiles_ok: usize,
    pub profiles_failed: usize,
    pub duplicates_removed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// For a duplicate, the dataset that holds its records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub covered_by: Option<DatasetId>,
}

impl DatasetOutcome {
    pub fn new(dataset_id: DatasetId, status: OutcomeStatus) -> Self {
        Self {
            dataset_id,
            status,
            qc_status: None,
            archived: false,
            profiles_ok: 0,
            profiles_failed: 0,
            duplicates_removed: 0,
            summary_digest: None,
            error: None,
            covered_by: None,
        }
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub config_digest: Option<String>,
    /// Scheduling stopped on a configuration error.
    pub aborted: bool,
    pub outcomes: Vec<DatasetOutcome>,
}

impl BatchReport {
    /// True when no configuration error occurred and every dataset settled.
    pub fn is_clean(&self) -> bool {
        !self.aborted && self.outcomes.iter().all(|o| o.status.is_settled())
    }

    pub fn count(&self, status: OutcomeStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn outcome(&self, id: &str) -> Option<&DatasetOutcome> {
        self.outcomes.iter().find(|o| o.dataset_id.as_str() == id)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Plain-text table, one row per dataset, followed by a totals line.
    pub fn render_table(&self) -> String {
        let width = self
            .outcomes
            .iter()
            .map(|o| o.dataset_id.as_str().len())
            .max()
            .unwrap_or(0)
            .max("DATASET".len());

        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<width$}  {:<16}  {:>5}  {:>6}  {:>5}  NOTE",
            "DATASET", "OUTCOME", "OK", "FAILED", "DUPS"
        );
        for o in &self.outcomes {
            let note = match (&o.error, &o.covered_by) {
                (Some(error), _) => error.clone(),
                (None, Some(neighbour)) => format!("records also in {neighbour}"),
                (None, None) => "-".to_string(),
            };
            let _ = writeln!(
                out,
                "{:<width$}  {:<16}  {:>5}  {:>6}  {:>5}  {}",
                o.dataset_id.as_str(),
                o.status.as_str(),
                o.profiles_ok,
                o.profiles_failed,
                o.duplicates_removed,
                note,
            );
        }
        let _ = writeln!(
            out,
            "{} datasets: {} archived, {} archival-pending, {} failed, {} skipped, {} duplicate, {} interrupted{}",
            self.outcomes.len(),
            self.count(OutcomeStatus::Archived),
            self.count(OutcomeStatus::ArchivalPending),
            self.count(OutcomeStatus::Failed),
            self.count(OutcomeStatus::Skipped),
            self.count(OutcomeStatus::Duplicate),
            self.count(OutcomeStatus::Interrupted) + self.count(OutcomeStatus::NotStarted),
            if self.aborted { " (aborted)" } else { "" },
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(statuses: &[OutcomeStatus], aborted: bool) -> BatchReport {
        BatchReport {
            run_id: "run".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            config_digest: None,
            aborted,
            outcomes: statuses
                .iter()
                .enumerate()
                .map(|(i, s)| DatasetOutcome::new(DatasetId::new(format!("d{i}")), *s))
                .collect(),
        }
    }

    #[test]
    fn test_clean_batches() {
        use OutcomeStatus::*;
        assert!(report(&[Archived, ArchivalPending, Failed, Skipped, Duplicate], false).is_clean());
        assert!(report(&[], false).is_clean());
        assert!(!report(&[Archived, Interrupted], false).is_clean());
        assert!(!report(&[NotStarted], false).is_clean());
        assert!(!report(&[Archived], true).is_clean());
    }

    #[test]
    fn test_table_lists_every_dataset() {
        let mut r = report(&[OutcomeStatus::Archived, OutcomeStatus::Failed], false);
        r.outcomes[1].error = Some("profile p2 unreadable".to_string());
        let table = r.render_table();
        assert!(table.contains("d0"));
        assert!(table.contains("archived"));
        assert!(table.contains("profile p2 unreadable"));
        assert!(table.contains("2 datasets: 1 archived"));
    }

    #[test]
    fn test_table_names_the_covering_dataset() {
        let mut r = report(&[OutcomeStatus::Archived, OutcomeStatus::Duplicate], false);
        r.outcomes[1].covered_by = Some(DatasetId::new("d0"));
        let table = r.render_table();
        assert!(table.contains("records also in d0"));
        assert!(table.contains("1 duplicate"));

        let json: serde_json::Value = serde_json::from_str(&r.to_json().unwrap()).unwrap();
        assert_eq!(json["outcomes"][1]["status"], "duplicate");
        assert_eq!(json["outcomes"][1]["covered_by"], "d0");
    }

    #[test]
    fn test_json_shape() {
        let r = report(&[OutcomeStatus::ArchivalPending], false);
        let json: serde_json::Value = serde_json::from_str(&r.to_json().unwrap()).unwrap();
        assert_eq!(json["outcomes"][0]["status"], "archival_pending");
        assert_eq!(json["outcomes"][0]["dataset_id"], "d0");
    }
}
