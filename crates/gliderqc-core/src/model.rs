//! Glider profile data model.
//!
//! On disk a dataset holds [`RawProfile`]s made of [`RawRecord`]s. A raw
//! profile is parsed into a [`Profile`] of [`Observation`]s before QC, and the
//! QC result (deduplicated observations plus their flags) is written back into
//! the raw form when the dataset is saved.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DataIntegrityError, QcError};
use crate::flag::{Flag, FlagTable};

/// Identifier of a dataset within a store (the file stem for file stores).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetId(pub String);

impl DatasetId {
    pub fn new(id: impl Into<String>) -> Self {
        DatasetId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Vertical direction of the cast an observation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CastDirection {
    Down,
    Up,
}

impl CastDirection {
    pub fn opposite(self) -> CastDirection {
        match self {
            CastDirection::Down => CastDirection::Up,
            CastDirection::Up => CastDirection::Down,
        }
    }
}

/// Timestamp as found on disk: RFC 3339 text or epoch seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Epoch(f64),
    Text(String),
}

impl RawTimestamp {
    pub fn parse(&self) -> Option<DateTime<Utc>> {
        match self {
            RawTimestamp::Epoch(secs) => {
                if !secs.is_finite() {
                    return None;
                }
                let whole = secs.floor();
                let nanos = ((secs - whole) * 1e9).round() as u32;
                Utc.timestamp_opt(whole as i64, nanos.min(999_999_999)).single()
            }
            RawTimestamp::Text(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }

    fn describe(&self) -> String {
        match self {
            RawTimestamp::Epoch(secs) => secs.to_string(),
            RawTimestamp::Text(text) => text.clone(),
        }
    }
}

impl From<DateTime<Utc>> for RawTimestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        RawTimestamp::Text(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }
}

/// One record of a raw profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub timestamp: RawTimestamp,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<CastDirection>,

    /// Variable values; `null` marks a missing value.
    #[serde(default)]
    pub values: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "FlagTable::is_empty")]
    pub flags: FlagTable,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub summary: BTreeMap<String, Flag>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub duplicate_resolved: bool,
}

impl RawRecord {
    pub fn new(timestamp: RawTimestamp) -> Self {
        Self {
            timestamp,
            profile_id: None,
            direction: None,
            values: BTreeMap::new(),
            flags: FlagTable::new(),
            summary: BTreeMap::new(),
            duplicate_resolved: false,
        }
    }

    pub fn with_value(mut self, name: &str, value: Option<f64>) -> Self {
        self.values.insert(name.to_string(), option_to_json(value));
        self
    }

    pub fn with_direction(mut self, direction: CastDirection) -> Self {
        self.direction = Some(direction);
        self
    }

    /// Drop flags and summaries. The duplicate marker is provenance and stays.
    fn clear_qc(&mut self) {
        self.flags.clear();
        self.summary.clear();
    }
}

/// A profile as stored in a dataset file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawProfile {
    pub profile_id: String,

    #[serde(default)]
    pub records: Vec<RawRecord>,

    /// Duplicates removed from this profile over all QC passes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicates_removed: Option<usize>,

    /// Why the last QC pass failed on this profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qc_error: Option<String>,
}

impl RawProfile {
    pub fn new(profile_id: impl Into<String>, records: Vec<RawRecord>) -> Self {
        Self {
            profile_id: profile_id.into(),
            records,
            duplicates_removed: None,
            qc_error: None,
        }
    }

    /// Remove the QC flags previously written into this profile.
    ///
    /// Duplicate resolution already applied to the records cannot be undone,
    /// so `duplicates_removed` and the per-record markers are kept.
    pub fn reset_qc(&mut self) {
        self.qc_error = None;
        for record in &mut self.records {
            record.clear_qc();
        }
    }
}

/// A file-like unit of one or more profiles plus deployment metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub deployment_id: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,

    #[serde(default)]
    pub profiles: Vec<RawProfile>,
}

impl Dataset {
    pub fn new(deployment_id: impl Into<String>, profiles: Vec<RawProfile>) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            metadata: BTreeMap::new(),
            profiles,
        }
    }

    /// Clear QC output so the dataset can be reprocessed from scratch.
    pub fn reset_qc(&mut self) {
        for profile in &mut self.profiles {
            profile.reset_qc();
        }
    }

    /// Every record timestamp across all profiles.
    pub fn timestamps(&self) -> Result<BTreeSet<DateTime<Utc>>, DataIntegrityError> {
        let mut timestamps = BTreeSet::new();
        for profile in &self.profiles {
            for (index, record) in profile.records.iter().enumerate() {
                let timestamp = record.timestamp.parse().ok_or_else(|| {
                    DataIntegrityError::UnparseableTimestamp {
                        profile_id: profile.profile_id.clone(),
                        index,
                        value: record.timestamp.describe(),
                    }
                })?;
                timestamps.insert(timestamp);
            }
        }
        Ok(timestamps)
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, DataIntegrityError> {
        serde_json::from_slice(bytes).map_err(|e| DataIntegrityError::Malformed(e.to_string()))
    }

    pub fn to_json_vec(&self) -> Result<Vec<u8>, QcError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

/// One sensor reading at a timestamp within a profile.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    pub profile_id: String,
    pub direction: Option<CastDirection>,
    pub values: BTreeMap<String, Option<f64>>,
    pub flags: FlagTable,
    pub duplicate_resolved: bool,
    summary: BTreeMap<String, Flag>,
}

impl Observation {
    pub fn new(timestamp: DateTime<Utc>, profile_id: impl Into<String>) -> Self {
        Self {
            timestamp,
            profile_id: profile_id.into(),
            direction: None,
            values: BTreeMap::new(),
            flags: FlagTable::new(),
            duplicate_resolved: false,
            summary: BTreeMap::new(),
        }
    }

    /// Set a variable value. NaN is stored as missing.
    pub fn with_value(mut self, name: &str, value: Option<f64>) -> Self {
        self.values
            .insert(name.to_string(), value.filter(|v| !v.is_nan()));
        self
    }

    pub fn with_direction(mut self, direction: CastDirection) -> Self {
        self.direction = Some(direction);
        self
    }

    /// Finite value of `name`, or `None` when absent or missing.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.values
            .get(name)
            .copied()
            .flatten()
            .filter(|v| v.is_finite())
    }

    /// How many of `variables` have no finite value here. A variable the
    /// observation does not carry at all counts as missing.
    pub fn missing_count(&self, variables: &BTreeSet<String>) -> usize {
        variables
            .iter()
            .filter(|name| self.value(name).is_none())
            .count()
    }

    pub fn summary(&self) -> &BTreeMap<String, Flag> {
        &self.summary
    }

    pub fn summary_flag(&self, variable: &str) -> Option<Flag> {
        self.summary.get(variable).copied()
    }

    pub fn has_summary(&self) -> bool {
        !self.summary.is_empty()
    }

    /// Write the summary flags. Summaries are written once.
    pub(crate) fn write_summary(
        &mut self,
        summary: BTreeMap<String, Flag>,
        index: usize,
    ) -> Result<(), QcError> {
        if self.has_summary() {
            return Err(QcError::SummaryAlreadyWritten {
                profile_id: self.profile_id.clone(),
                index,
            });
        }
        self.summary = summary;
        Ok(())
    }

    fn to_raw(&self) -> RawRecord {
        RawRecord {
            timestamp: self.timestamp.into(),
            profile_id: Some(self.profile_id.clone()),
            direction: self.direction,
            values: self
                .values
                .iter()
                .map(|(name, value)| (name.clone(), option_to_json(*value)))
                .collect(),
            flags: self.flags.clone(),
            summary: self.summary.clone(),
            duplicate_resolved: self.duplicate_resolved,
        }
    }
}

/// Ordered sequence of observations sharing a profile identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub profile_id: String,
    observations: Vec<Observation>,
}

impl Profile {
    pub fn new(profile_id: impl Into<String>, observations: Vec<Observation>) -> Self {
        Self {
            profile_id: profile_id.into(),
            observations,
        }
    }

    /// Parse a raw profile, enforcing the data model invariants.
    pub fn from_raw(raw: &RawProfile) -> Result<Self, DataIntegrityError> {
        let profile_id = raw.profile_id.clone();
        let mut observations = Vec::with_capacity(raw.records.len());
        let mut previous: Option<DateTime<Utc>> = None;

        for (index, record) in raw.records.iter().enumerate() {
            let timestamp = record.timestamp.parse().ok_or_else(|| {
                DataIntegrityError::UnparseableTimestamp {
                    profile_id: profile_id.clone(),
                    index,
                    value: record.timestamp.describe(),
                }
            })?;

            if let Some(prev) = previous {
                if timestamp < prev {
                    return Err(DataIntegrityError::NonMonotonicTimestamp {
                        profile_id: profile_id.clone(),
                        index,
                    });
                }
            }
            previous = Some(timestamp);

            if let Some(found) = &record.profile_id {
                if found != &profile_id {
                    return Err(DataIntegrityError::ProfileMismatch {
                        profile_id: profile_id.clone(),
                        index,
                        found: found.clone(),
                    });
                }
            }

            let mut observation = Observation::new(timestamp, profile_id.clone());
            observation.direction = record.direction;
            observation.duplicate_resolved = record.duplicate_resolved;
            for (name, value) in &record.values {
                let parsed = match value {
                    Value::Null => None,
                    Value::Number(n) => n.as_f64(),
                    _ => {
                        return Err(DataIntegrityError::NonNumericValue {
                            profile_id: profile_id.clone(),
                            index,
                            variable: name.clone(),
                        })
                    }
                };
                observation = observation.with_value(name, parsed);
            }
            observations.push(observation);
        }

        Ok(Self {
            profile_id,
            observations,
        })
    }

    /// Replace the raw records with this profile's observations and flags.
    pub fn write_into(&self, raw: &mut RawProfile) {
        raw.records = self.observations.iter().map(Observation::to_raw).collect();
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn observations_mut(&mut self) -> &mut [Observation] {
        &mut self.observations
    }

    pub(crate) fn replace_observations(&mut self, observations: Vec<Observation>) {
        self.observations = observations;
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Union of variable names across all observations.
    pub fn variables(&self) -> BTreeSet<String> {
        self.observations
            .iter()
            .flat_map(|obs| obs.values.keys().cloned())
            .collect()
    }

    /// Values of `variable` in observation order.
    pub fn series(&self, variable: &str) -> Vec<Option<f64>> {
        self.observations.iter().map(|obs| obs.value(variable)).collect()
    }

    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.observations.iter().map(|obs| obs.timestamp).collect()
    }
}

fn option_to_json(value: Option<f64>) -> Value {
    value
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(records: Value) -> RawProfile {
        serde_json::from_value(json!({ "profile_id": "p1", "records": records })).unwrap()
    }

    #[test]
    fn test_parse_rfc3339_and_epoch() {
        let profile = Profile::from_raw(&raw(json!([
            { "timestamp": "2021-05-03T19:30:00Z", "values": { "temperature": 10.5 } },
            { "timestamp": 1620070260.0, "values": { "temperature": null } },
        ])))
        .unwrap();

        assert_eq!(profile.len(), 2);
        assert_eq!(profile.observations()[0].value("temperature"), Some(10.5));
        assert_eq!(profile.observations()[1].value("temperature"), None);
        assert_eq!(profile.observations()[1].missing_count(&profile.variables()), 1);
        assert!(profile.observations()[0].timestamp < profile.observations()[1].timestamp);
    }

    #[test]
    fn test_unparseable_timestamp() {
        let err = Profile::from_raw(&raw(json!([
            { "timestamp": "not a time", "values": {} },
        ])))
        .unwrap_err();
        assert!(matches!(err, DataIntegrityError::UnparseableTimestamp { index: 0, .. }));
    }

    #[test]
    fn test_decreasing_timestamps_rejected() {
        let err = Profile::from_raw(&raw(json!([
            { "timestamp": "2021-05-03T19:31:00Z" },
            { "timestamp": "2021-05-03T19:30:00Z" },
        ])))
        .unwrap_err();
        assert!(matches!(err, DataIntegrityError::NonMonotonicTimestamp { index: 1, .. }));
    }

    #[test]
    fn test_equal_timestamps_accepted() {
        let profile = Profile::from_raw(&raw(json!([
            { "timestamp": "2021-05-03T19:30:00Z" },
            { "timestamp": "2021-05-03T19:30:00Z" },
        ])))
        .unwrap();
        assert_eq!(profile.len(), 2);
    }

    #[test]
    fn test_profile_mismatch_and_non_numeric() {
        let err = Profile::from_raw(&raw(json!([
            { "timestamp": "2021-05-03T19:30:00Z", "profile_id": "p2" },
        ])))
        .unwrap_err();
        assert!(matches!(err, DataIntegrityError::ProfileMismatch { .. }));

        let err = Profile::from_raw(&raw(json!([
            { "timestamp": "2021-05-03T19:30:00Z", "values": { "temperature": "warm" } },
        ])))
        .unwrap_err();
        assert!(matches!(err, DataIntegrityError::NonNumericValue { .. }));
    }

    #[test]
    fn test_write_into_and_reparse() {
        let source = raw(json!([
            { "timestamp": "2021-05-03T19:30:00Z", "direction": "down", "values": { "pressure": 1.0 } },
            { "timestamp": "2021-05-03T19:30:01.500Z", "direction": "up", "values": { "pressure": null } },
        ]));
        let mut profile = Profile::from_raw(&source).unwrap();
        profile.observations_mut()[0]
            .flags
            .record("pressure", "gross_range", Flag::Good, 0)
            .unwrap();

        let mut written = source.clone();
        profile.write_into(&mut written);
        assert_eq!(written.records[0].flags.get("pressure", "gross_range"), Some(Flag::Good));

        let reparsed = Profile::from_raw(&written).unwrap();
        assert_eq!(reparsed.timestamps(), profile.timestamps());
        assert_eq!(reparsed.series("pressure"), vec![Some(1.0), None]);
        assert_eq!(reparsed.observations()[1].direction, Some(CastDirection::Up));
    }

    #[test]
    fn test_reset_qc_clears_flags_keeps_dedup_provenance() {
        let mut record = RawRecord::new(RawTimestamp::Epoch(0.0)).with_value("temperature", Some(1.0));
        record.flags.record("temperature", "spike", Flag::Bad, 0).unwrap();
        record.summary.insert("temperature".to_string(), Flag::Bad);
        record.duplicate_resolved = true;

        let mut dataset = Dataset::new("ru30-20210503T1929", vec![RawProfile::new("p1", vec![record])]);
        dataset.profiles[0].qc_error = Some("boom".to_string());
        dataset.profiles[0].duplicates_removed = Some(2);
        dataset.reset_qc();

        let record = &dataset.profiles[0].records[0];
        assert!(record.flags.is_empty());
        assert!(record.summary.is_empty());
        assert!(record.duplicate_resolved);
        assert!(dataset.profiles[0].qc_error.is_none());
        assert_eq!(dataset.profiles[0].duplicates_removed, Some(2));

        let profile = Profile::from_raw(&dataset.profiles[0]).unwrap();
        assert!(profile.observations()[0].duplicate_resolved);
    }

    #[test]
    fn test_dataset_timestamps_span_profiles() {
        let dataset = Dataset::new(
            "ru30-20210503T1929",
            vec![
                raw(json!([{ "timestamp": 10.0 }, { "timestamp": 20.0 }])),
                raw(json!([{ "timestamp": 20.0 }, { "timestamp": "1970-01-01T00:00:30Z" }])),
            ],
        );
        let secs: Vec<i64> = dataset.timestamps().unwrap().iter().map(|t| t.timestamp()).collect();
        assert_eq!(secs, vec![10, 20, 30]);

        let broken = Dataset::new("ru30-20210503T1929", vec![raw(json!([{ "timestamp": "soon" }]))]);
        assert!(matches!(
            broken.timestamps(),
            Err(DataIntegrityError::UnparseableTimestamp { .. })
        ));
    }

    #[test]
    fn test_summary_written_once() {
        let mut obs = Observation::new(Utc::now(), "p1").with_value("temperature", Some(1.0));
        let summary: BTreeMap<String, Flag> = [("temperature".to_string(), Flag::Good)].into();
        obs.write_summary(summary.clone(), 0).unwrap();
        assert!(matches!(
            obs.write_summary(summary, 0),
            Err(QcError::SummaryAlreadyWritten { .. })
        ));
    }

    #[test]
    fn test_nan_is_missing() {
        let obs = Observation::new(Utc::now(), "p1").with_value("temperature", Some(f64::NAN));
        assert_eq!(obs.value("temperature"), None);
        let variables: BTreeSet<String> = ["temperature".to_string()].into();
        assert_eq!(obs.missing_count(&variables), 1);
    }

    #[test]
    fn test_absent_variable_counts_as_missing() {
        let obs = Observation::new(Utc::now(), "p1").with_value("v", Some(1.0));
        let variables: BTreeSet<String> = ["v".to_string(), "w".to_string()].into();
        assert_eq!(obs.missing_count(&variables), 1);
        assert_eq!(Observation::new(Utc::now(), "p1").missing_count(&variables), 2);
    }
}
