//! Dataset lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Processing state of a dataset.
///
/// `incoming → qc-in-progress → qc-complete | qc-failed`. `qc-in-progress` is
/// re-entrant so a crashed run can be resumed from scratch, and `qc-failed`
/// may re-enter `qc-in-progress` on retry. `qc-complete` is terminal for QC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatasetStatus {
    Incoming,
    QcInProgress,
    QcComplete,
    QcFailed,
}

impl DatasetStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DatasetStatus::Incoming => "incoming",
            DatasetStatus::QcInProgress => "qc-in-progress",
            DatasetStatus::QcComplete => "qc-complete",
            DatasetStatus::QcFailed => "qc-failed",
        }
    }

    pub fn can_transition_to(self, next: DatasetStatus) -> bool {
        use DatasetStatus::*;
        matches!(
            (self, next),
            (Incoming, QcInProgress)
                | (QcInProgress, QcInProgress)
                | (QcInProgress, QcComplete)
                | (QcInProgress, QcFailed)
                | (QcFailed, QcInProgress)
        )
    }

    /// Whether QC has reached a final verdict.
    pub fn is_terminal(self) -> bool {
        matches!(self, DatasetStatus::QcComplete | DatasetStatus::QcFailed)
    }
}

impl fmt::Display for DatasetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
