//! Glider QC core library.
//!
//! Data model, flag algebra and the QC stages applied to each profile:
//! duplicate-timestamp resolution, QARTOD tests, the hysteresis test and the
//! flag summarizer. Orchestration lives in `gliderqc-pipeline`.

pub mod dedup;
pub mod error;
pub mod flag;
pub mod hysteresis;
pub mod metrics;
pub mod model;
pub mod obs;
pub mod qartod;
pub mod status;
pub mod summary;
pub mod telemetry;

pub use dedup::{covered_neighbours, DedupReport, DuplicateTimestampDetector};
pub use error::{DataIntegrityError, QcError, Result, TestEvaluationError};
pub use flag::{merge_severity, Flag, FlagTable};
pub use hysteresis::{
    HysteresisConfig, HysteresisReport, HysteresisTest, HysteresisThresholds, HYSTERESIS_TEST_NAME,
};
pub use metrics::METRICS;
pub use model::{
    CastDirection, Dataset, DatasetId, Observation, Profile, RawProfile, RawRecord, RawTimestamp,
};
pub use qartod::{ConfiguredTest, QartodReport, QartodTest, QartodTestRunner};
pub use status::DatasetStatus;
pub use summary::{summary_digest, ExpectedTests, FlagSummarizer, SummaryReport};
pub use telemetry::init_tracing;
