//! QARTOD-style single-variable tests.
//!
//! Every test is a pure function of a profile's raw values (and timestamps)
//! plus its parameters. Tests never read flags, so the configured set can be
//! evaluated in any order or in parallel with identical results.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Datelike, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{QcError, TestEvaluationError};
use crate::flag::Flag;
use crate::model::Profile;

pub const GROSS_RANGE: &str = "gross_range";
pub const SPIKE: &str = "spike";
pub const RATE_OF_CHANGE: &str = "rate_of_change";
pub const FLAT_LINE: &str = "flat_line";
pub const CLIMATOLOGY: &str = "climatology";

/// Outcome of evaluating one observation.
pub type Evaluation = std::result::Result<Flag, TestEvaluationError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrossRangeParams {
    pub min: f64,
    pub max: f64,
    pub suspect_min: Option<f64>,
    pub suspect_max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeParams {
    pub suspect_threshold: f64,
    pub fail_threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateOfChangeParams {
    /// Largest acceptable change per second.
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatLineParams {
    pub tolerance: f64,
    pub suspect_seconds: f64,
    pub fail_seconds: f64,
}

/// One climatology window: months and an optional depth band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClimatologyPeriod {
    /// Calendar months (1-12) this period covers. Empty covers the whole year.
    #[serde(default)]
    pub months: Vec<u32>,
    #[serde(default)]
    pub depth_min: Option<f64>,
    #[serde(default)]
    pub depth_max: Option<f64>,
    pub suspect_min: f64,
    pub suspect_max: f64,
    #[serde(default)]
    pub fail_min: Option<f64>,
    #[serde(default)]
    pub fail_max: Option<f64>,
}

impl ClimatologyPeriod {
    fn has_depth_band(&self) -> bool {
        self.depth_min.is_some() || self.depth_max.is_some()
    }

    fn matches(&self, month: u32, depth: Option<f64>) -> bool {
        if !self.months.is_empty() && !self.months.contains(&month) {
            return false;
        }
        if !self.has_depth_band() {
            return true;
        }
        match depth {
            Some(d) => {
                self.depth_min.map_or(true, |lo| d >= lo) && self.depth_max.map_or(true, |hi| d < hi)
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClimatologyParams {
    pub depth_variable: String,
    pub periods: Vec<ClimatologyPeriod>,
}

/// A QARTOD test and its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "test", rename_all = "snake_case")]
pub enum QartodTest {
    GrossRange(GrossRangeParams),
    Spike(SpikeParams),
    RateOfChange(RateOfChangeParams),
    FlatLine(FlatLineParams),
    Climatology(ClimatologyParams),
}

type Builder = fn(&Params<'_>) -> Result<QartodTest, QcError>;

/// Test name to constructor.
const CATALOG: &[(&str, Builder)] = &[
    (GROSS_RANGE, build_gross_range),
    (SPIKE, build_spike),
    (RATE_OF_CHANGE, build_rate_of_change),
    (FLAT_LINE, build_flat_line),
    (CLIMATOLOGY, build_climatology),
];

/// Names accepted by [`QartodTest::from_parameters`].
pub fn catalog_names() -> impl Iterator<Item = &'static str> {
    CATALOG.iter().map(|(name, _)| *name)
}

impl QartodTest {
    /// Build a test from its configured name and parameter mapping.
    ///
    /// Unknown names, unknown or missing parameters and invalid values are
    /// configuration errors.
    pub fn from_parameters(name: &str, parameters: &Map<String, Value>) -> Result<Self, QcError> {
        let (_, build) = CATALOG
            .iter()
            .find(|(known, _)| *known == name)
            .ok_or_else(|| {
                QcError::Configuration(format!(
                    "unknown test {name:?} (expected one of: {})",
                    catalog_names().collect::<Vec<_>>().join(", ")
                ))
            })?;
        let test = build(&Params {
            test: name,
            map: parameters,
        })?;
        test.validate()
            .map_err(|e| QcError::Configuration(e.to_string()))?;
        Ok(test)
    }

    pub fn name(&self) -> &'static str {
        match self {
            QartodTest::GrossRange(_) => GROSS_RANGE,
            QartodTest::Spike(_) => SPIKE,
            QartodTest::RateOfChange(_) => RATE_OF_CHANGE,
            QartodTest::FlatLine(_) => FLAT_LINE,
            QartodTest::Climatology(_) => CLIMATOLOGY,
        }
    }

    /// Check parameter consistency.
    pub fn validate(&self) -> Result<(), TestEvaluationError> {
        let problem = match self {
            QartodTest::GrossRange(p) => validate_gross_range(p),
            QartodTest::Spike(p) => {
                if !(p.suspect_threshold.is_finite() && p.fail_threshold.is_finite()) {
                    Some("thresholds must be finite".to_string())
                } else if p.suspect_threshold <= 0.0 {
                    Some("suspect_threshold must be positive".to_string())
                } else if p.suspect_threshold > p.fail_threshold {
                    Some("suspect_threshold exceeds fail_threshold".to_string())
                } else {
                    None
                }
            }
            QartodTest::RateOfChange(p) => {
                (!(p.threshold.is_finite() && p.threshold > 0.0))
                    .then(|| "threshold must be a positive number".to_string())
            }
            QartodTest::FlatLine(p) => {
                if !(p.tolerance.is_finite() && p.tolerance >= 0.0) {
                    Some("tolerance must be non-negative".to_string())
                } else if !(p.suspect_seconds.is_finite() && p.suspect_seconds > 0.0) {
                    Some("suspect_seconds must be positive".to_string())
                } else if !p.fail_seconds.is_finite() || p.suspect_seconds > p.fail_seconds {
                    Some("suspect_seconds exceeds fail_seconds".to_string())
                } else {
                    None
                }
            }
            QartodTest::Climatology(p) => validate_climatology(p),
        };

        match problem {
            Some(reason) => Err(TestEvaluationError::Misconfigured {
                test: self.name().to_string(),
                reason,
            }),
            None => Ok(()),
        }
    }

    /// Evaluate every observation of `profile` for `variable`.
    ///
    /// Returns one entry per observation. The outer error reports a
    /// misconfigured test.
    pub fn evaluate(
        &self,
        profile: &Profile,
        variable: &str,
    ) -> Result<Vec<Evaluation>, TestEvaluationError> {
        self.validate()?;
        let values = profile.series(variable);
        let flags = match self {
            QartodTest::GrossRange(p) => gross_range(&values, p),
            QartodTest::Spike(p) => spike(&values, p),
            QartodTest::RateOfChange(p) => rate_of_change(&profile.timestamps(), &values, p),
            QartodTest::FlatLine(p) => flat_line(&profile.timestamps(), &values, p),
            QartodTest::Climatology(p) => climatology(
                &profile.timestamps(),
                &values,
                &profile.series(&p.depth_variable),
                p,
            ),
        };
        Ok(flags)
    }
}

fn validate_gross_range(p: &GrossRangeParams) -> Option<String> {
    if !(p.min.is_finite() && p.max.is_finite()) {
        return Some("min and max must be finite".to_string());
    }
    if p.min > p.max {
        return Some(format!("min {} exceeds max {}", p.min, p.max));
    }
    if let Some(lo) = p.suspect_min {
        if lo < p.min || lo > p.max {
            return Some("suspect_min lies outside the fail span".to_string());
        }
    }
    if let Some(hi) = p.suspect_max {
        if hi > p.max || hi < p.min {
            return Some("suspect_max lies outside the fail span".to_string());
        }
    }
    if let (Some(lo), Some(hi)) = (p.suspect_min, p.suspect_max) {
        if lo > hi {
            return Some("suspect_min exceeds suspect_max".to_string());
        }
    }
    None
}

fn validate_climatology(p: &ClimatologyParams) -> Option<String> {
    if p.depth_variable.is_empty() {
        return Some("depth_variable must not be empty".to_string());
    }
    if p.periods.is_empty() {
        return Some("at least one period is required".to_string());
    }
    for (i, period) in p.periods.iter().enumerate() {
        if period.months.iter().any(|m| !(1..=12).contains(m)) {
            return Some(format!("period {i}: months must be within 1-12"));
        }
        if let (Some(lo), Some(hi)) = (period.depth_min, period.depth_max) {
            if lo > hi {
                return Some(format!("period {i}: depth_min exceeds depth_max"));
            }
        }
        if period.suspect_min > period.suspect_max {
            return Some(format!("period {i}: suspect_min exceeds suspect_max"));
        }
        if period.fail_min.map_or(false, |lo| lo > period.suspect_min)
            || period.fail_max.map_or(false, |hi| hi < period.suspect_max)
        {
            return Some(format!("period {i}: fail span must contain the suspect span"));
        }
    }
    None
}

fn gross_range(values: &[Option<f64>], p: &GrossRangeParams) -> Vec<Evaluation> {
    values
        .iter()
        .map(|value| {
            let Some(v) = *value else {
                return Ok(Flag::NotEvaluated);
            };
            if v < p.min || v > p.max {
                Ok(Flag::Bad)
            } else if p.suspect_min.map_or(false, |lo| v < lo)
                || p.suspect_max.map_or(false, |hi| v > hi)
            {
                Ok(Flag::Suspect)
            } else {
                Ok(Flag::Good)
            }
        })
        .collect()
}

fn spike(values: &[Option<f64>], p: &SpikeParams) -> Vec<Evaluation> {
    let n = values.len();
    (0..n)
        .map(|i| {
            if i == 0 || i + 1 == n {
                return Ok(Flag::NotEvaluated);
            }
            let (Some(prev), Some(v), Some(next)) = (values[i - 1], values[i], values[i + 1]) else {
                return Ok(Flag::NotEvaluated);
            };
            let deviation = (v - (prev + next) / 2.0).abs();
            if deviation > p.fail_threshold {
                Ok(Flag::Bad)
            } else if deviation > p.suspect_threshold {
                Ok(Flag::Suspect)
            } else {
                Ok(Flag::Good)
            }
        })
        .collect()
}

fn seconds_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 1000.0
}

fn rate_of_change(
    times: &[DateTime<Utc>],
    values: &[Option<f64>],
    p: &RateOfChangeParams,
) -> Vec<Evaluation> {
    let mut previous: Option<(usize, f64)> = None;
    values
        .iter()
        .enumerate()
        .map(|(i, value)| {
            let Some(v) = *value else {
                return Ok(Flag::NotEvaluated);
            };
            let last = previous.replace((i, v));
            let Some((j, pv)) = last else {
                return Ok(Flag::NotEvaluated);
            };
            let dt = seconds_between(times[j], times[i]);
            if dt <= 0.0 {
                return Err(TestEvaluationError::Uncomputable {
                    test: RATE_OF_CHANGE.to_string(),
                    index: i,
                    reason: format!("non-positive time step since record {j}"),
                });
            }
            if (v - pv).abs() / dt > p.threshold {
                Ok(Flag::Suspect)
            } else {
                Ok(Flag::Good)
            }
        })
        .collect()
}

/// A repeated value inherits the run start of its predecessor. Otherwise the
/// run is scanned backwards, stopping once it spans `fail_seconds`.
fn flat_line(times: &[DateTime<Utc>], values: &[Option<f64>], p: &FlatLineParams) -> Vec<Evaluation> {
    let mut flags = Vec::with_capacity(values.len());
    let mut run_start = 0;
    for i in 0..values.len() {
        let Some(v) = values[i] else {
            flags.push(Ok(Flag::NotEvaluated));
            continue;
        };
        let repeated = i > 0 && values[i - 1] == Some(v);
        if !repeated {
            run_start = i;
            while run_start > 0 && seconds_between(times[run_start], times[i]) < p.fail_seconds {
                match values[run_start - 1] {
                    Some(w) if (w - v).abs() <= p.tolerance => run_start -= 1,
                    _ => break,
                }
            }
        }

        let duration = seconds_between(times[run_start], times[i]);
        flags.push(if duration >= p.fail_seconds {
            Ok(Flag::Bad)
        } else if duration >= p.suspect_seconds {
            Ok(Flag::Suspect)
        } else {
            Ok(Flag::Good)
        });
    }
    flags
}

fn climatology(
    times: &[DateTime<Utc>],
    values: &[Option<f64>],
    depths: &[Option<f64>],
    p: &ClimatologyParams,
) -> Vec<Evaluation> {
    values
        .iter()
        .enumerate()
        .map(|(i, value)| {
            let Some(v) = *value else {
                return Ok(Flag::NotEvaluated);
            };
            let month = times[i].month();
            let Some(period) = p.periods.iter().find(|period| period.matches(month, depths[i])) else {
                return Ok(Flag::NotEvaluated);
            };
            if period.fail_min.map_or(false, |lo| v < lo) || period.fail_max.map_or(false, |hi| v > hi) {
                Ok(Flag::Bad)
            } else if v < period.suspect_min || v > period.suspect_max {
                Ok(Flag::Suspect)
            } else {
                Ok(Flag::Good)
            }
        })
        .collect()
}

/// Typed view over a test's parameter mapping.
struct Params<'a> {
    test: &'a str,
    map: &'a Map<String, Value>,
}

impl Params<'_> {
    fn error(&self, reason: impl std::fmt::Display) -> QcError {
        QcError::Configuration(format!("{}: {}", self.test, reason))
    }

    fn allow_only(&self, allowed: &[&str]) -> Result<(), QcError> {
        match self.map.keys().find(|key| !allowed.contains(&key.as_str())) {
            Some(key) => Err(self.error(format!("unknown parameter {key:?}"))),
            None => Ok(()),
        }
    }

    fn optional(&self, key: &str) -> Result<Option<f64>, QcError> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_f64()
                .map(Some)
                .ok_or_else(|| self.error(format!("parameter {key:?} must be a number"))),
        }
    }

    fn required(&self, key: &str) -> Result<f64, QcError> {
        self.optional(key)?
            .ok_or_else(|| self.error(format!("missing parameter {key:?}")))
    }
}

fn build_gross_range(p: &Params<'_>) -> Result<QartodTest, QcError> {
    p.allow_only(&["min", "max", "suspect_min", "suspect_max"])?;
    Ok(QartodTest::GrossRange(GrossRangeParams {
        min: p.required("min")?,
        max: p.required("max")?,
        suspect_min: p.optional("suspect_min")?,
        suspect_max: p.optional("suspect_max")?,
    }))
}

fn build_spike(p: &Params<'_>) -> Result<QartodTest, QcError> {
    p.allow_only(&["suspect_threshold", "fail_threshold"])?;
    Ok(QartodTest::Spike(SpikeParams {
        suspect_threshold: p.required("suspect_threshold")?,
        fail_threshold: p.required("fail_threshold")?,
    }))
}

fn build_rate_of_change(p: &Params<'_>) -> Result<QartodTest, QcError> {
    p.allow_only(&["threshold"])?;
    Ok(QartodTest::RateOfChange(RateOfChangeParams {
        threshold: p.required("threshold")?,
    }))
}

fn build_flat_line(p: &Params<'_>) -> Result<QartodTest, QcError> {
    p.allow_only(&["tolerance", "suspect_seconds", "fail_seconds"])?;
    Ok(QartodTest::FlatLine(FlatLineParams {
        tolerance: p.required("tolerance")?,
        suspect_seconds: p.required("suspect_seconds")?,
        fail_seconds: p.required("fail_seconds")?,
    }))
}

fn build_climatology(p: &Params<'_>) -> Result<QartodTest, QcError> {
    p.allow_only(&["depth_variable", "periods"])?;
    let depth_variable = match p.map.get("depth_variable") {
        None => "depth".to_string(),
        Some(Value::String(name)) => name.clone(),
        Some(_) => return Err(p.error("parameter \"depth_variable\" must be a string")),
    };
    let periods = p
        .map
        .get("periods")
        .ok_or_else(|| p.error("missing parameter \"periods\""))?;
    let periods: Vec<ClimatologyPeriod> =
        serde_json::from_value(periods.clone()).map_err(|e| p.error(e))?;
    Ok(QartodTest::Climatology(ClimatologyParams {
        depth_variable,
        periods,
    }))
}

/// A test bound to the variable it checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfiguredTest {
    pub variable: String,
    #[serde(flatten)]
    pub test: QartodTest,
}

impl ConfiguredTest {
    pub fn new(variable: impl Into<String>, test: QartodTest) -> Self {
        Self {
            variable: variable.into(),
            test,
        }
    }

    pub fn name(&self) -> &'static str {
        self.test.name()
    }
}

/// Flags written by one runner pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QartodReport {
    pub counts: BTreeMap<Flag, usize>,
    /// Observations recorded as NOT_EVALUATED because a test could not compute.
    pub evaluation_errors: usize,
}

impl QartodReport {
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}

/// Runs the configured QARTOD tests against a profile.
#[derive(Debug, Clone, Default)]
pub struct QartodTestRunner {
    tests: Vec<ConfiguredTest>,
}

impl QartodTestRunner {
    /// A runner for `tests`. Each (variable, test name) pair may appear once.
    pub fn new(tests: Vec<ConfiguredTest>) -> Result<Self, QcError> {
        let mut seen = BTreeSet::new();
        for configured in &tests {
            if !seen.insert((configured.variable.as_str(), configured.name())) {
                return Err(QcError::Configuration(format!(
                    "{} configured more than once for {}",
                    configured.name(),
                    configured.variable
                )));
            }
        }
        Ok(Self { tests })
    }

    pub fn tests(&self) -> &[ConfiguredTest] {
        &self.tests
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Evaluate all tests and record one flag per test per observation.
    ///
    /// Tests are evaluated in parallel; flags are recorded in configuration
    /// order. Uncomputable observations are recorded as NOT_EVALUATED; a
    /// misconfigured test fails the run with a configuration error.
    pub fn run(&self, profile: &mut Profile) -> Result<QartodReport, QcError> {
        let evaluations: Vec<Result<Vec<Evaluation>, TestEvaluationError>> = {
            let snapshot: &Profile = profile;
            self.tests
                .par_iter()
                .map(|configured| configured.test.evaluate(snapshot, &configured.variable))
                .collect()
        };

        let mut report = QartodReport::default();
        for (configured, evaluation) in self.tests.iter().zip(evaluations) {
            let outcomes = evaluation.map_err(|e| QcError::Configuration(e.to_string()))?;
            for (index, (obs, outcome)) in profile
                .observations_mut()
                .iter_mut()
                .zip(outcomes)
                .enumerate()
            {
                let flag = match outcome {
                    Ok(flag) => flag,
                    Err(e) if e.is_misconfiguration() => {
                        return Err(QcError::Configuration(e.to_string()))
                    }
                    Err(e) => {
                        debug!(variable = %configured.variable, error = %e, "recording NOT_EVALUATED");
                        report.evaluation_errors += 1;
                        Flag::NotEvaluated
                    }
                };
                obs.flags
                    .record(&configured.variable, configured.name(), flag, index)?;
                *report.counts.entry(flag).or_default() += 1;
            }
        }
        Ok(report)
    }
}
