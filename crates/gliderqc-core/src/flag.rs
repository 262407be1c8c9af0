//! Per-observation quality flags and their merge rules.
//!
//! Severity is a closed total order, low to high:
//! `GOOD < NOT_EVALUATED < SUSPECT < BAD < MISSING`.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::QcError;

/// Quality code attached to one (observation, variable, test) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Flag {
    Good,
    NotEvaluated,
    Suspect,
    Bad,
    Missing,
}

impl Flag {
    /// All flags, lowest severity first.
    pub const ALL: [Flag; 5] = [
        Flag::Good,
        Flag::NotEvaluated,
        Flag::Suspect,
        Flag::Bad,
        Flag::Missing,
    ];

    /// Position in the severity order.
    pub fn severity(self) -> u8 {
        match self {
            Flag::Good => 0,
            Flag::NotEvaluated => 1,
            Flag::Suspect => 2,
            Flag::Bad => 3,
            Flag::Missing => 4,
        }
    }

    /// Numeric QARTOD flag code.
    pub fn qartod_code(self) -> u8 {
        match self {
            Flag::Good => 1,
            Flag::NotEvaluated => 2,
            Flag::Suspect => 3,
            Flag::Bad => 4,
            Flag::Missing => 9,
        }
    }

    pub fn from_qartod_code(code: u8) -> Option<Flag> {
        match code {
            1 => Some(Flag::Good),
            2 => Some(Flag::NotEvaluated),
            3 => Some(Flag::Suspect),
            4 => Some(Flag::Bad),
            9 => Some(Flag::Missing),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Flag::Good => "GOOD",
            Flag::NotEvaluated => "NOT_EVALUATED",
            Flag::Suspect => "SUSPECT",
            Flag::Bad => "BAD",
            Flag::Missing => "MISSING",
        }
    }

    /// The more severe of two flags.
    pub fn merge(self, other: Flag) -> Flag {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl Ord for Flag {
    fn cmp(&self, other: &Self) -> Ordering {
        self.severity().cmp(&other.severity())
    }
}

impl PartialOrd for Flag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Flag {
    type Err = QcError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Flag::ALL
            .into_iter()
            .find(|flag| flag.as_str() == s)
            .ok_or_else(|| QcError::Configuration(format!("unknown flag: {s}")))
    }
}

/// Most severe flag of the set.
///
/// An empty set means no test ran; callers are expected to have substituted
/// `NOT_EVALUATED` already, and that is also what an empty set yields.
pub fn merge_severity<I>(flags: I) -> Flag
where
    I: IntoIterator<Item = Flag>,
{
    flags
        .into_iter()
        .reduce(Flag::merge)
        .unwrap_or(Flag::NotEvaluated)
}

/// Flags written for one observation, keyed by variable then test name.
///
/// Each (variable, test) pair holds exactly one flag; a second write for the
/// same pair is rejected so stages cannot overwrite each other.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlagTable(BTreeMap<String, BTreeMap<String, Flag>>);

impl FlagTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `flag` for `test` on `variable`. `index` is only used for the error.
    pub fn record(
        &mut self,
        variable: &str,
        test: &str,
        flag: Flag,
        index: usize,
    ) -> Result<(), QcError> {
        let tests = self.0.entry(variable.to_string()).or_default();
        if tests.contains_key(test) {
            return Err(QcError::FlagConflict {
                variable: variable.to_string(),
                test: test.to_string(),
                index,
            });
        }
        tests.insert(test.to_string(), flag);
        Ok(())
    }

    pub fn get(&self, variable: &str, test: &str) -> Option<Flag> {
        self.0.get(variable).and_then(|tests| tests.get(test)).copied()
    }

    /// All (test, flag) entries for a variable, in test-name order.
    pub fn tests_for<'a>(&'a self, variable: &str) -> impl Iterator<Item = (&'a str, Flag)> + 'a {
        self.0
            .get(variable)
            .into_iter()
            .flat_map(|tests| tests.iter().map(|(name, flag)| (name.as_str(), *flag)))
    }

    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.0
            .iter()
            .filter(|(_, tests)| !tests.is_empty())
            .map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}
