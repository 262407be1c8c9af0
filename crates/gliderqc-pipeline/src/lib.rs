//! Glider QC pipeline.
//!
//! Loads the QC configuration, sets aside datasets queued twice, runs every
//! pending dataset of a queue through the profile stages with bounded
//! concurrency, commits lifecycle state, relocates completed datasets and
//! reports per-dataset outcomes.

pub mod config;
pub mod duplicates;
pub mod error;
pub mod pipeline;
pub mod report;
pub mod runner;
pub mod stage;

pub use config::{QcPlan, RawQcConfig, RawTestConfig};
pub use duplicates::{set_aside_duplicates, SetAside};
pub use error::{PipelineError, PipelineResult};
pub use pipeline::{PipelineOptions, QcPipeline};
pub use report::{BatchReport, DatasetOutcome, OutcomeStatus};
pub use runner::{DatasetWorker, QcRun, QcVerdict};
pub use stage::QcStage;
