//! Persisted QC state of one dataset.

use chrono::{DateTime, Utc};
use gliderqc_core::DatasetStatus;
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Contents of a dataset's state sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetState {
    pub status: DatasetStatus,
    pub updated_at: DateTime<Utc>,

    /// Number of QC passes started on this dataset.
    #[serde(default)]
    pub attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_digest: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_digest: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Default for DatasetState {
    fn default() -> Self {
        Self::incoming()
    }
}

impl DatasetState {
    /// State of a dataset that has never been touched.
    pub fn incoming() -> Self {
        Self {
            status: DatasetStatus::Incoming,
            updated_at: Utc::now(),
            attempts: 0,
            config_digest: None,
            summary_digest: None,
            archived_at: None,
            last_error: None,
        }
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: DatasetStatus) -> StorageResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(StorageError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Enter `qc-in-progress` for a fresh QC pass.
    pub fn begin_attempt(&mut self, config_digest: &str) -> StorageResult<()> {
        self.transition(DatasetStatus::QcInProgress)?;
        self.attempts += 1;
        self.config_digest = Some(config_digest.to_string());
        self.summary_digest = None;
        self.last_error = None;
        Ok(())
    }

    pub fn complete(&mut self, summary_digest: String) -> StorageResult<()> {
        self.transition(DatasetStatus::QcComplete)?;
        self.summary_digest = Some(summary_digest);
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> StorageResult<()> {
        self.transition(DatasetStatus::QcFailed)?;
        self.last_error = Some(reason.into());
        Ok(())
    }

    /// Record a problem without changing status (archival failures).
    pub fn note_error(&mut self, reason: impl Into<String>) {
        self.last_error = Some(reason.into());
        self.updated_at = Utc::now();
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_lifecycle() {
        let mut state = DatasetState::incoming();
        state.begin_attempt("abc").unwrap();
        assert_eq!(state.status, DatasetStatus::QcInProgress);
        assert_eq!(state.attempts, 1);

        state.fail("profile p2 unreadable").unwrap();
        assert_eq!(state.status, DatasetStatus::QcFailed);

        state.begin_attempt("abc").unwrap();
        assert_eq!(state.attempts, 2);
        assert!(state.last_error.is_none());

        state.complete("digest".to_string()).unwrap();
        assert_eq!(state.summary_digest.as_deref(), Some("digest"));
    }

    #[test]
    fn test_complete_is_terminal_for_qc() {
        let mut state = DatasetState::incoming();
        state.begin_attempt("abc").unwrap();
        state.complete("d".to_string()).unwrap();

        let err = state.begin_attempt("abc").unwrap_err();
        assert!(matches!(
            err,
            StorageError::InvalidTransition {
                from: DatasetStatus::QcComplete,
                to: DatasetStatus::QcInProgress
            }
        ));
    }

    #[test]
    fn test_incoming_cannot_complete() {
        let mut state = DatasetState::incoming();
        assert!(state.complete("d".to_string()).is_err());
        assert_eq!(state.status, DatasetStatus::Incoming);
    }

    #[test]
    fn test_sidecar_serde() {
        let mut state = DatasetState::incoming();
        state.begin_attempt("cfg").unwrap();
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["status"], "qc-in-progress");
        assert!(json.get("archived_at").is_none());

        let back: DatasetState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
