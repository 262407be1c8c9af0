//! CTD thermal-lag hysteresis test.
//!
//! Compares each observation with the nearest-pressure observation of the
//! opposite cast. Unlike the QARTOD tests this needs the whole down/up pair,
//! so it runs as its own stage.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::QcError;
use crate::flag::Flag;
use crate::model::{CastDirection, Profile};

/// Test name under which hysteresis flags are recorded.
pub const HYSTERESIS_TEST_NAME: &str = "hysteresis";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HysteresisThresholds {
    pub suspect_threshold: f64,
    pub fail_threshold: f64,
}

fn default_pressure_variable() -> String {
    "pressure".to_string()
}

fn default_min_pressure_range() -> f64 {
    5.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HysteresisConfig {
    #[serde(default = "default_pressure_variable")]
    pub pressure_variable: String,

    /// Profiles spanning no more than this (dbar) are not evaluated.
    #[serde(default = "default_min_pressure_range")]
    pub min_pressure_range: f64,

    /// Largest pressure difference accepted for a cross-cast match.
    #[serde(default)]
    pub max_pressure_gap: Option<f64>,

    pub variables: BTreeMap<String, HysteresisThresholds>,
}

impl HysteresisConfig {
    pub fn validate(&self) -> Result<(), QcError> {
        let fail = |reason: String| -> Result<(), QcError> {
            Err(QcError::Configuration(format!(
                "{HYSTERESIS_TEST_NAME}: {reason}"
            )))
        };

        if self.pressure_variable.is_empty() {
            return fail("pressure_variable must not be empty".to_string());
        }
        if !(self.min_pressure_range.is_finite() && self.min_pressure_range >= 0.0) {
            return fail("min_pressure_range must be non-negative".to_string());
        }
        if let Some(gap) = self.max_pressure_gap {
            if !(gap.is_finite() && gap > 0.0) {
                return fail("max_pressure_gap must be positive".to_string());
            }
        }
        if self.variables.is_empty() {
            return fail("no variables configured".to_string());
        }
        for (variable, t) in &self.variables {
            if !(t.suspect_threshold.is_finite() && t.fail_threshold.is_finite()) || t.suspect_threshold <= 0.0 {
                return fail(format!("{variable}: thresholds must be positive numbers"));
            }
            if t.suspect_threshold > t.fail_threshold {
                return fail(format!("{variable}: suspect_threshold exceeds fail_threshold"));
            }
        }
        Ok(())
    }
}

/// Flags written by one hysteresis pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HysteresisReport {
    pub counts: BTreeMap<Flag, usize>,
    /// Why the profile as a whole was not evaluated.
    pub skipped: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HysteresisTest {
    config: HysteresisConfig,
}

impl HysteresisTest {
    pub fn new(config: HysteresisConfig) -> Result<Self, QcError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &HysteresisConfig {
        &self.config
    }

    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.config.variables.keys().map(String::as_str)
    }

    /// Record one hysteresis flag per configured variable per observation.
    pub fn run(&self, profile: &mut Profile) -> Result<HysteresisReport, QcError> {
        let mut report = HysteresisReport::default();
        if profile.is_empty() {
            return Ok(report);
        }

        let pressure = profile.series(&self.config.pressure_variable);
        let casts = assign_casts(profile, &pressure);
        report.skipped = self.skip_reason(&casts, &pressure);

        for (variable, thresholds) in &self.config.variables {
            let flags = match &report.skipped {
                Some(_) => vec![Flag::NotEvaluated; profile.len()],
                None => self.compare_casts(&profile.series(variable), &pressure, &casts, thresholds),
            };
            for (index, (obs, flag)) in profile.observations_mut().iter_mut().zip(flags).enumerate() {
                obs.flags.record(variable, HYSTERESIS_TEST_NAME, flag, index)?;
                *report.counts.entry(flag).or_default() += 1;
            }
        }

        if let Some(reason) = &report.skipped {
            debug!(profile_id = %profile.profile_id, reason = %reason, "hysteresis not evaluated");
        }
        Ok(report)
    }

    fn skip_reason(&self, casts: &[Option<CastDirection>], pressure: &[Option<f64>]) -> Option<String> {
        let has = |dir| casts.iter().any(|c| *c == Some(dir));
        if !has(CastDirection::Down) || !has(CastDirection::Up) {
            return Some("profile lacks a down/up cast pair".to_string());
        }

        let clamped = pressure.iter().flatten().map(|p| p.max(0.0));
        let (lo, hi) = clamped.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| (lo.min(p), hi.max(p)));
        let range = hi - lo;
        if !range.is_finite() || range <= self.config.min_pressure_range {
            return Some(format!(
                "pressure range below {} dbar",
                self.config.min_pressure_range
            ));
        }
        None
    }

    fn compare_casts(
        &self,
        values: &[Option<f64>],
        pressure: &[Option<f64>],
        casts: &[Option<CastDirection>],
        thresholds: &HysteresisThresholds,
    ) -> Vec<Flag> {
        let down = CastSamples::collect(values, pressure, casts, CastDirection::Down);
        let up = CastSamples::collect(values, pressure, casts, CastDirection::Up);

        (0..values.len())
            .map(|i| {
                let Some(v) = values[i] else {
                    return Flag::Missing;
                };
                let (Some(cast), Some(p)) = (casts[i], pressure[i]) else {
                    return Flag::NotEvaluated;
                };
                let opposite = match cast.opposite() {
                    CastDirection::Down => &down,
                    CastDirection::Up => &up,
                };
                let Some((matched_p, matched_v)) = opposite.nearest(p) else {
                    return Flag::NotEvaluated;
                };
                if self.config.max_pressure_gap.map_or(false, |gap| (matched_p - p).abs() > gap) {
                    return Flag::NotEvaluated;
                }

                let difference = (v - matched_v).abs();
                if difference > thresholds.fail_threshold {
                    Flag::Bad
                } else if difference > thresholds.suspect_threshold {
                    Flag::Suspect
                } else {
                    Flag::Good
                }
            })
            .collect()
    }
}

/// Cast of each observation. Explicit directions win; otherwise the profile is
/// split at its deepest point.
fn assign_casts(profile: &Profile, pressure: &[Option<f64>]) -> Vec<Option<CastDirection>> {
    let labelled: Vec<Option<CastDirection>> = profile.observations().iter().map(|o| o.direction).collect();
    if labelled.iter().any(Option::is_some) {
        return labelled;
    }

    let deepest = pressure
        .iter()
        .enumerate()
        .filter_map(|(i, p)| p.map(|p| (i, p)))
        .fold(None, |best: Option<(usize, f64)>, (i, p)| match best {
            Some((_, bp)) if bp >= p => best,
            _ => Some((i, p)),
        });

    match deepest {
        Some((turn, _)) => (0..pressure.len())
            .map(|i| Some(if i <= turn { CastDirection::Down } else { CastDirection::Up }))
            .collect(),
        None => vec![None; pressure.len()],
    }
}

/// Valid (pressure, value) samples of one cast, sorted by pressure.
struct CastSamples(Vec<(f64, f64)>);

impl CastSamples {
    fn collect(
        values: &[Option<f64>],
        pressure: &[Option<f64>],
        casts: &[Option<CastDirection>],
        direction: CastDirection,
    ) -> Self {
        let mut samples: Vec<(f64, f64)> = (0..values.len())
            .filter(|&i| casts[i] == Some(direction))
            .filter_map(|i| Some((pressure[i]?, values[i]?)))
            .collect();
        samples.sort_by(|a, b| a.0.total_cmp(&b.0));
        CastSamples(samples)
    }

    fn nearest(&self, pressure: f64) -> Option<(f64, f64)> {
        let split = self.0.partition_point(|(p, _)| *p < pressure);
        let below = split.checked_sub(1).map(|i| self.0[i]);
        let above = self.0.get(split).copied();
        match (below, above) {
            (Some(b), Some(a)) => {
                if (pressure - b.0).abs() <= (a.0 - pressure).abs() {
                    Some(b)
                } else {
                    Some(a)
                }
            }
            (b, a) => b.or(a),
        }
    }
}
