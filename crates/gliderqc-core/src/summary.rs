//! Worst-case merge of per-test flags into one summary flag per variable.

use std::collections::{BTreeMap, BTreeSet};

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::QcError;
use crate::flag::{merge_severity, Flag};
use crate::model::Profile;

/// Tests configured per variable. Every observation must carry a flag from
/// each of them by the time the profile is summarized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExpectedTests(BTreeMap<String, BTreeSet<String>>);

impl ExpectedTests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect(&mut self, variable: impl Into<String>, test: impl Into<String>) {
        self.0.entry(variable.into()).or_default().insert(test.into());
    }

    pub fn tests_for(&self, variable: &str) -> Option<&BTreeSet<String>> {
        self.0.get(variable)
    }

    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryReport {
    /// Summary flags by value.
    pub counts: BTreeMap<Flag, usize>,
    /// Configured tests that stayed silent and were filled with NOT_EVALUATED.
    pub filled: usize,
}

impl SummaryReport {
    /// Summary flags plus the NOT_EVALUATED test flags filled in.
    pub fn written(&self) -> usize {
        self.counts.values().sum::<usize>() + self.filled
    }
}

#[derive(Debug, Clone, Default)]
pub struct FlagSummarizer {
    expected: ExpectedTests,
}

impl FlagSummarizer {
    pub fn new(expected: ExpectedTests) -> Self {
        Self { expected }
    }

    /// Write the summary flags of every observation in `profile`.
    ///
    /// Covers every variable that is either configured or carries a flag.
    /// Fails without writing anything when a configured variable has no flag
    /// at all on some observation, or when summaries already exist.
    pub fn summarize(&self, profile: &mut Profile) -> Result<SummaryReport, QcError> {
        for (index, obs) in profile.observations().iter().enumerate() {
            if obs.has_summary() {
                return Err(QcError::SummaryAlreadyWritten {
                    profile_id: profile.profile_id.clone(),
                    index,
                });
            }
            if let Some(variable) = self
                .expected
                .variables()
                .find(|variable| obs.flags.tests_for(variable).next().is_none())
            {
                return Err(QcError::UnflaggedPair {
                    profile_id: profile.profile_id.clone(),
                    index,
                    variable: variable.to_string(),
                });
            }
        }

        let mut report = SummaryReport::default();
        for (index, obs) in profile.observations_mut().iter_mut().enumerate() {
            let variables: BTreeSet<String> = self
                .expected
                .variables()
                .chain(obs.flags.variables())
                .map(str::to_string)
                .collect();

            let mut summary = BTreeMap::new();
            for variable in variables {
                for test in self.expected.tests_for(&variable).into_iter().flatten() {
                    if obs.flags.get(&variable, test).is_none() {
                        obs.flags.record(&variable, test, Flag::NotEvaluated, index)?;
                        report.filled += 1;
                    }
                }
                let merged = merge_severity(obs.flags.tests_for(&variable).map(|(_, flag)| flag));
                *report.counts.entry(merged).or_default() += 1;
                summary.insert(variable, merged);
            }
            obs.write_summary(summary, index)?;
        }

        if report.filled > 0 {
            warn!(
                profile_id = %profile.profile_id,
                filled = report.filled,
                "configured tests left observations unflagged; recorded NOT_EVALUATED"
            );
        }
        Ok(report)
    }
}

/// SHA-256 over every summary flag of `profiles`, in order.
///
/// Identical inputs and configuration give identical digests, which is how
/// reruns are checked for determinism.
pub fn summary_digest<'a, I>(profiles: I) -> String
where
    I: IntoIterator<Item = &'a Profile>,
{
    let mut hasher = Sha256::new();
    for profile in profiles {
        hasher.update(profile.profile_id.as_bytes());
        hasher.update([0u8]);
        for obs in profile.observations() {
            hasher.update(obs.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true).as_bytes());
            for (variable, flag) in obs.summary() {
                hasher.update(b"\t");
                hasher.update(variable.as_bytes());
                hasher.update([flag.qartod_code()]);
            }
            hasher.update(b"\n");
        }
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Observation;
    use chrono::{TimeZone, Utc};

    fn obs(i: i64) -> Observation {
        Observation::new(Utc.timestamp_opt(1_620_070_200 + i, 0).unwrap(), "p1")
            .with_value("temperature", Some(10.0))
    }

    fn expected(pairs: &[(&str, &str)]) -> ExpectedTests {
        let mut expected = ExpectedTests::new();
        for (variable, test) in pairs {
            expected.expect(*variable, *test);
        }
        expected
    }

    #[test]
    fn test_worst_flag_wins() {
        let mut o = obs(0);
        o.flags.record("temperature", "gross_range", Flag::Good, 0).unwrap();
        o.flags.record("temperature", "spike", Flag::Suspect, 0).unwrap();
        o.flags.record("temperature", "hysteresis", Flag::Missing, 0).unwrap();
        let mut profile = Profile::new("p1", vec![o]);

        let summarizer = FlagSummarizer::new(expected(&[
            ("temperature", "gross_range"),
            ("temperature", "spike"),
            ("temperature", "hysteresis"),
        ]));
        let report = summarizer.summarize(&mut profile).unwrap();

        assert_eq!(report.filled, 0);
        assert_eq!(report.written(), 1);
        assert_eq!(profile.observations()[0].summary_flag("temperature"), Some(Flag::Missing));
    }

    #[test]
    fn test_silent_test_filled_with_not_evaluated() {
        let mut o = obs(0);
        o.flags.record("temperature", "gross_range", Flag::Good, 0).unwrap();
        let mut profile = Profile::new("p1", vec![o]);

        let summarizer = FlagSummarizer::new(expected(&[
            ("temperature", "gross_range"),
            ("temperature", "spike"),
        ]));
        let report = summarizer.summarize(&mut profile).unwrap();

        assert_eq!(report.filled, 1);
        assert_eq!(report.written(), 2);
        let o = &profile.observations()[0];
        assert_eq!(o.flags.get("temperature", "spike"), Some(Flag::NotEvaluated));
        assert_eq!(o.summary_flag("temperature"), Some(Flag::NotEvaluated));
    }

    #[test]
    fn test_unflagged_configured_pair_fails_loudly() {
        let mut flagged = obs(0);
        flagged.flags.record("temperature", "spike", Flag::Good, 0).unwrap();
        let mut profile = Profile::new("p1", vec![flagged, obs(1)]);

        let err = FlagSummarizer::new(expected(&[("temperature", "spike")]))
            .summarize(&mut profile)
            .unwrap_err();

        assert!(matches!(err, QcError::UnflaggedPair { index: 1, .. }));
        assert!(!profile.observations()[0].has_summary());
    }

    #[test]
    fn test_unconfigured_flagged_variable_still_summarized() {
        let mut o = obs(0);
        o.flags.record("salinity", "gross_range", Flag::Bad, 0).unwrap();
        let mut profile = Profile::new("p1", vec![o]);

        FlagSummarizer::default().summarize(&mut profile).unwrap();
        assert_eq!(profile.observations()[0].summary_flag("salinity"), Some(Flag::Bad));
        assert_eq!(profile.observations()[0].summary_flag("temperature"), None);
    }

    #[test]
    fn test_summary_is_immutable() {
        let mut o = obs(0);
        o.flags.record("temperature", "spike", Flag::Good, 0).unwrap();
        let mut profile = Profile::new("p1", vec![o]);
        let summarizer = FlagSummarizer::new(expected(&[("temperature", "spike")]));

        summarizer.summarize(&mut profile).unwrap();
        assert!(matches!(
            summarizer.summarize(&mut profile),
            Err(QcError::SummaryAlreadyWritten { .. })
        ));
    }

    #[test]
    fn test_digest_tracks_summary_flags() {
        let build = |flag| {
            let mut o = obs(0);
            o.flags.record("temperature", "spike", flag, 0).unwrap();
            let mut profile = Profile::new("p1", vec![o]);
            FlagSummarizer::default().summarize(&mut profile).unwrap();
            profile
        };

        let a = summary_digest([&build(Flag::Good)]);
        let b = summary_digest([&build(Flag::Good)]);
        let c = summary_digest([&build(Flag::Bad)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
