//! Error taxonomy for glider QC.
//!
//! - [`QcError::Configuration`]: invalid or unknown test configuration. Fatal.
//! - [`DataIntegrityError`]: a profile cannot be parsed into the data model.
//!   Recoverable at profile/dataset granularity.
//! - [`TestEvaluationError`]: a test could not compute a flag. Absorbed as
//!   `NOT_EVALUATED` unless it reports a misconfigured test.

/// A profile (or dataset) could not be turned into the QC data model.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DataIntegrityError {
    #[error("profile {profile_id} record {index}: unparseable timestamp {value:?}")]
    UnparseableTimestamp {
        profile_id: String,
        index: usize,
        value: String,
    },

    #[error("profile {profile_id} record {index}: timestamp earlier than the previous record")]
    NonMonotonicTimestamp { profile_id: String, index: usize },

    #[error("profile {profile_id} record {index}: belongs to profile {found}")]
    ProfileMismatch {
        profile_id: String,
        index: usize,
        found: String,
    },

    #[error("profile {profile_id} record {index}: variable {variable} is not numeric")]
    NonNumericValue {
        profile_id: String,
        index: usize,
        variable: String,
    },

    #[error("malformed dataset: {0}")]
    Malformed(String),
}

/// A single test could not evaluate an observation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TestEvaluationError {
    #[error("{test} cannot evaluate record {index}: {reason}")]
    Uncomputable {
        test: String,
        index: usize,
        reason: String,
    },

    #[error("{test} is misconfigured: {reason}")]
    Misconfigured { test: String, reason: String },
}

impl TestEvaluationError {
    /// Whether this error must escalate to a configuration error.
    pub fn is_misconfiguration(&self) -> bool {
        matches!(self, TestEvaluationError::Misconfigured { .. })
    }
}

/// Glider QC domain errors.
#[derive(Debug, thiserror::Error)]
pub enum QcError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("data integrity error: {0}")]
    DataIntegrity(#[from] DataIntegrityError),

    #[error("test evaluation error: {0}")]
    TestEvaluation(#[from] TestEvaluationError),

    #[error("flag for test {test} on variable {variable} already recorded at record {index}")]
    FlagConflict {
        variable: String,
        test: String,
        index: usize,
    },

    #[error("profile {profile_id} record {index}: variable {variable} was configured for testing but carries no flags")]
    UnflaggedPair {
        profile_id: String,
        index: usize,
        variable: String,
    },

    #[error("profile {profile_id} record {index}: summary flags already written")]
    SummaryAlreadyWritten { profile_id: String, index: usize },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QcError {
    /// Configuration errors abort the batch; everything else is isolated.
    pub fn is_fatal(&self) -> bool {
        match self {
            QcError::Configuration(_) => true,
            QcError::TestEvaluation(e) => e.is_misconfiguration(),
            _ => false,
        }
    }
}

/// Result type for glider QC domain operations.
pub type Result<T> = std::result::Result<T, QcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_integrity_display() {
        let err = DataIntegrityError::UnparseableTimestamp {
            profile_id: "p1".to_string(),
            index: 3,
            value: "yesterday".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("p1"));
        assert!(msg.contains("yesterday"));

        let err: QcError = err.into();
        assert!(err.to_string().contains("data integrity error"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_configuration_is_fatal() {
        assert!(QcError::Configuration("unknown test".to_string()).is_fatal());

        let misconfigured: QcError = TestEvaluationError::Misconfigured {
            test: "spike".to_string(),
            reason: "negative threshold".to_string(),
        }
        .into();
        assert!(misconfigured.is_fatal());

        let uncomputable: QcError = TestEvaluationError::Uncomputable {
            test: "rate_of_change".to_string(),
            index: 1,
            reason: "zero time step".to_string(),
        }
        .into();
        assert!(!uncomputable.is_fatal());
    }

    #[test]
    fn test_unflagged_pair_display() {
        let err = QcError::UnflaggedPair {
            profile_id: "p7".to_string(),
            index: 0,
            variable: "temperature".to_string(),
        };
        assert!(err.to_string().contains("carries no flags"));
    }
}
