//! Duplicate timestamp resolution.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::Profile;

/// What a dedup pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupReport {
    /// Observations dropped.
    pub removed: usize,
    /// Timestamps that had more than one observation.
    pub groups: usize,
}

/// Keeps one observation per timestamp within a profile.
///
/// The survivor of a group is the observation with the fewest missing values,
/// counted over every variable seen in the profile; ties go to the earliest in
/// sequence order. Survivors of a group are marked
/// `duplicate_resolved`. Running the detector on its own output changes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DuplicateTimestampDetector;

impl DuplicateTimestampDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn run(&self, profile: &mut Profile) -> DedupReport {
        if profile.is_empty() {
            return DedupReport::default();
        }

        let variables = profile.variables();
        let missing: Vec<usize> = profile
            .observations()
            .iter()
            .map(|obs| obs.missing_count(&variables))
            .collect();

        // timestamp -> (winning index, group size)
        let mut groups: HashMap<DateTime<Utc>, (usize, usize)> = HashMap::new();
        for (index, obs) in profile.observations().iter().enumerate() {
            groups
                .entry(obs.timestamp)
                .and_modify(|(winner, size)| {
                    *size += 1;
                    if missing[index] < missing[*winner] {
                        *winner = index;
                    }
                })
                .or_insert((index, 1));
        }

        let group_count = groups.values().filter(|(_, size)| *size > 1).count();
        if group_count == 0 {
            return DedupReport::default();
        }

        let before = profile.len();
        let observations = profile.observations().to_vec();
        let kept: Vec<_> = observations
            .into_iter()
            .enumerate()
            .filter_map(|(index, mut obs)| {
                let (winner, size) = groups[&obs.timestamp];
                if winner != index {
                    return None;
                }
                if size > 1 {
                    obs.duplicate_resolved = true;
                }
                Some(obs)
            })
            .collect();

        let removed = before - kept.len();
        profile.replace_observations(kept);

        debug!(
            profile_id = %profile.profile_id,
            removed,
            groups = group_count,
            "resolved duplicate timestamps"
        );

        DedupReport {
            removed,
            groups: group_count,
        }
    }
}

/// Positions of queued datasets whose timestamps all reappear in a neighbour.
///
/// `timestamps` holds one entry per dataset in queue order; `None` marks a
/// dataset that could not be read and is never compared. Each dataset is
/// compared with the next one: when the later one's timestamps are a subset
/// of the earlier one's, the later one is covered, otherwise when the earlier
/// one's are a subset of the later one's, the earlier one is. A covered
/// dataset is not compared again. Datasets without timestamps are never
/// covered.
pub fn covered_neighbours(timestamps: &[Option<BTreeSet<DateTime<Utc>>>]) -> Vec<(usize, usize)> {
    let mut covered: Vec<(usize, usize)> = Vec::new();
    for (i, pair) in timestamps.windows(2).enumerate() {
        if covered.iter().any(|(index, _)| *index == i) {
            continue;
        }
        let (Some(earlier), Some(later)) = (&pair[0], &pair[1]) else {
            continue;
        };
        if earlier.is_empty() || later.is_empty() {
            continue;
        }
        if later.is_subset(earlier) {
            covered.push((i + 1, i));
        } else if earlier.is_subset(later) {
            covered.push((i, i + 1));
        }
    }
    covered
}
