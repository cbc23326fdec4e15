//! Group-aware train/val/test splitting.
//!
//! Distinct groups (capture sources, tracks, …) are shuffled and cut, never
//! individual samples, so near-duplicate samples from one group can never
//! straddle two partitions. The cut is two-staged: first test vs. train+val
//! using the test ratio, then train vs. val inside the remainder using
//! `val / (train + val)`.
//!
//! The split is a pure function of `(records, ratios, group_by, seed)`:
//! groups are sorted before a `ChaCha8Rng` shuffle and the output map is
//! ordered by sample id.

use crate::data::manifest::{ManifestRecord, Partition, ensure_unique_ids};
use crate::error::{Result, TuneError};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

const RATIO_SUM_TOLERANCE: f64 = 1e-3;

/// Group key used when `group_by == "camera_id"` and the record carries no
/// structured metadata: ids look like `{seq}_{camera}_{frame}_{bbox}`.
pub const CAMERA_ID_KEY: &str = "camera_id";

/// Target fractions for the three partitions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitRatios {
    pub train: f64,
    pub val: f64,
    pub test: f64,
}

impl Default for SplitRatios {
    fn default() -> Self {
        Self {
            train: 0.7,
            val: 0.15,
            test: 0.15,
        }
    }
}

impl SplitRatios {
    pub fn new(train: f64, val: f64, test: f64) -> Result<Self> {
        let ratios = Self { train, val, test };
        ratios.validate()?;
        Ok(ratios)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("train", self.train), ("val", self.val), ("test", self.test)] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(TuneError::config(format!(
                    "split ratio '{name}' must be within [0, 1], got {value}"
                )));
            }
        }
        if self.train <= 0.0 {
            return Err(TuneError::config("split ratio 'train' must be positive"));
        }
        let sum = self.train + self.val + self.test;
        if (sum - 1.0).abs() > RATIO_SUM_TOLERANCE {
            return Err(TuneError::config(format!(
                "split ratios must sum to 1.0, got {sum:.4}"
            )));
        }
        Ok(())
    }

    /// Fraction of the train+val groups that go to validation.
    pub fn val_within_trainval(&self) -> f64 {
        self.val / (self.train + self.val)
    }
}

/// Where a sample's group key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKeySource {
    /// No grouping requested: every sample is its own group.
    Ungrouped,
    /// Found under `meta[group_by]`.
    Metadata,
    /// Second underscore-delimited token of the sample id.
    IdToken,
    /// Nothing matched; the sample id stands in. No leakage guarantee.
    SampleIdFallback,
}

impl GroupKeySource {
    pub fn is_degraded(&self) -> bool {
        matches!(self, GroupKeySource::SampleIdFallback)
    }
}

/// Resolve the grouping key for one record.
///
/// The id-token heuristic only applies to `camera_id` and is not validated
/// against anything; records resolved that way or through the sample-id
/// fallback are reported by the splitter so callers can audit them.
pub fn extract_group_key(record: &ManifestRecord, group_by: Option<&str>) -> (String, GroupKeySource) {
    let Some(key) = group_by else {
        return (record.id.clone(), GroupKeySource::Ungrouped);
    };

    if let Some(value) = record.meta_str(key) {
        return (value, GroupKeySource::Metadata);
    }

    if key == CAMERA_ID_KEY {
        let mut parts = record.id.split('_');
        if let (Some(_), Some(camera)) = (parts.next(), parts.next()) {
            return (camera.to_string(), GroupKeySource::IdToken);
        }
    }

    (record.id.clone(), GroupKeySource::SampleIdFallback)
}

/// Mapping from sample id to partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitAssignment {
    assignments: BTreeMap<String, Partition>,
}

impl SplitAssignment {
    pub fn get(&self, sample_id: &str) -> Option<Partition> {
        self.assignments.get(sample_id).copied()
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Partition)> {
        self.assignments.iter().map(|(id, p)| (id.as_str(), *p))
    }

    /// Sample count per partition (all three keys always present).
    pub fn counts(&self) -> BTreeMap<Partition, usize> {
        let mut counts: BTreeMap<Partition, usize> =
            Partition::ALL.iter().map(|p| (*p, 0)).collect();
        for partition in self.assignments.values() {
            *counts.entry(*partition).or_default() += 1;
        }
        counts
    }

    /// Check that no group key appears in more than one partition.
    ///
    /// `group_keys` maps sample id to group key.
    pub fn verify_no_leakage(&self, group_keys: &BTreeMap<String, String>) -> Result<()> {
        let mut seen: BTreeMap<&str, Partition> = BTreeMap::new();
        for (id, partition) in &self.assignments {
            let Some(group) = group_keys.get(id) else {
                continue;
            };
            match seen.get(group.as_str()) {
                Some(existing) if existing != partition => {
                    return Err(TuneError::dataset(format!(
                        "group '{group}' appears in both {existing} and {partition}"
                    )));
                }
                Some(_) => {}
                None => {
                    seen.insert(group.as_str(), *partition);
                }
            }
        }
        Ok(())
    }

    /// Write the assignment back onto the records (unassigned ids default to train).
    pub fn apply(&self, records: &mut [ManifestRecord]) {
        for record in records {
            record.split = Some(self.get(&record.id).unwrap_or(Partition::Train));
        }
    }
}

/// Full result of a split: the assignment plus what the caller needs to
/// audit it.
#[derive(Debug, Clone)]
pub struct SplitOutcome {
    pub assignment: SplitAssignment,
    /// Sample id → resolved group key.
    pub group_keys: BTreeMap<String, String>,
    /// Number of distinct groups per partition.
    pub groups_per_partition: BTreeMap<Partition, usize>,
    /// Samples whose key came from the id-token heuristic.
    pub heuristic_keys: usize,
    /// Samples that fell back to their own id.
    pub degraded_keys: usize,
}

/// Group-aware splitter. Construction validates the ratios.
#[derive(Debug, Clone)]
pub struct GroupAwareSplitter {
    ratios: SplitRatios,
    group_by: Option<String>,
    seed: u64,
}

impl GroupAwareSplitter {
    pub fn new(ratios: SplitRatios, group_by: Option<String>, seed: u64) -> Result<Self> {
        ratios.validate()?;
        Ok(Self {
            ratios,
            group_by,
            seed,
        })
    }

    pub fn ratios(&self) -> SplitRatios {
        self.ratios
    }

    pub fn group_by(&self) -> Option<&str> {
        self.group_by.as_deref()
    }

    pub fn split(&self, records: &[ManifestRecord]) -> Result<SplitOutcome> {
        ensure_unique_ids(records)?;

        let mut group_keys = BTreeMap::new();
        let mut members: BTreeMap<String, Vec<&str>> = BTreeMap::new();
        let mut heuristic_keys = 0;
        let mut degraded_keys = 0;
        for record in records {
            let (key, source) = extract_group_key(record, self.group_by.as_deref());
            match source {
                GroupKeySource::IdToken => heuristic_keys += 1,
                GroupKeySource::SampleIdFallback => degraded_keys += 1,
                _ => {}
            }
            members.entry(key.clone()).or_default().push(record.id.as_str());
            group_keys.insert(record.id.clone(), key);
        }

        if degraded_keys > 0 {
            tracing::warn!(
                degraded_keys,
                group_by = self.group_by.as_deref().unwrap_or(""),
                "group key missing; those samples fall back to their own id and carry no leakage guarantee"
            );
        }
        if heuristic_keys > 0 {
            tracing::warn!(
                heuristic_keys,
                "group key taken from the second id token; verify it matches the capture source"
            );
        }

        let groups: Vec<String> = members.keys().cloned().collect();
        let (trainval, test) = holdout_groups(&groups, self.ratios.test, self.seed);
        let (train, val) = holdout_groups(&trainval, self.ratios.val_within_trainval(), self.seed);

        let mut assignments = BTreeMap::new();
        let mut groups_per_partition = BTreeMap::new();
        for (partition, part_groups) in [
            (Partition::Train, &train),
            (Partition::Val, &val),
            (Partition::Test, &test),
        ] {
            groups_per_partition.insert(partition, part_groups.len());
            for group in part_groups {
                for id in &members[group] {
                    assignments.insert((*id).to_string(), partition);
                }
            }
        }

        let assignment = SplitAssignment { assignments };
        tracing::info!(
            samples = assignment.len(),
            groups = groups.len(),
            train_groups = train.len(),
            val_groups = val.len(),
            test_groups = test.len(),
            seed = self.seed,
            "split complete"
        );

        Ok(SplitOutcome {
            assignment,
            group_keys,
            groups_per_partition,
            heuristic_keys,
            degraded_keys,
        })
    }
}

/// Convenience wrapper: `split(samples, ratios, group_by, seed)`.
pub fn split(
    records: &[ManifestRecord],
    ratios: SplitRatios,
    group_by: Option<&str>,
    seed: u64,
) -> Result<SplitAssignment> {
    GroupAwareSplitter::new(ratios, group_by.map(str::to_string), seed)?
        .split(records)
        .map(|outcome| outcome.assignment)
}

/// Shuffle sorted groups and cut `ceil(fraction * n)` of them off as holdout.
///
/// At least one group always stays on the keep side, so tiny group counts
/// leave the holdout empty instead of the training side.
fn holdout_groups(groups: &[String], fraction: f64, seed: u64) -> (Vec<String>, Vec<String>) {
    if fraction <= 0.0 || groups.len() < 2 {
        return (groups.to_vec(), Vec::new());
    }
    let sorted: BTreeSet<&String> = groups.iter().collect();
    let mut shuffled: Vec<String> = sorted.into_iter().cloned().collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    shuffled.shuffle(&mut rng);

    let n = shuffled.len();
    // Tolerance keeps 0.15 * 20 = 3.0000000000000004 from rounding up to 4.
    let wanted = (fraction * n as f64 - 1e-9).ceil().max(0.0) as usize;
    let n_holdout = wanted.min(n - 1);
    let keep = shuffled.split_off(n_holdout);
    (keep, shuffled)
}
