//! Split-assigned samples and the training-partition class frequency table.

use crate::data::manifest::{ClassVocabulary, ManifestRecord, Partition};
use crate::data::split::{SplitAssignment, extract_group_key};
use crate::error::{Result, TuneError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One labeled unit after split assignment. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub id: String,
    /// Only used for leakage prevention, never fed to training.
    pub group_key: String,
    pub class_label: String,
    pub class_index: usize,
}

/// Per-class sample counts of the training partition.
///
/// Validation and test samples never contribute, otherwise their label
/// distribution would leak into the loss weighting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassFrequencyTable {
    counts: BTreeMap<usize, usize>,
}

impl ClassFrequencyTable {
    pub fn from_labels<I: IntoIterator<Item = usize>>(labels: I) -> Self {
        let mut counts = BTreeMap::new();
        for label in labels {
            *counts.entry(label).or_insert(0) += 1;
        }
        Self { counts }
    }

    pub fn from_counts<I: IntoIterator<Item = (usize, usize)>>(counts: I) -> Self {
        Self {
            counts: counts.into_iter().collect(),
        }
    }

    /// Count for a class; absent classes count as zero.
    pub fn count(&self, class_index: usize) -> usize {
        self.counts.get(&class_index).copied().unwrap_or(0)
    }

    /// Smallest dense class count covering every index in the table.
    pub fn min_num_classes(&self) -> usize {
        self.counts.keys().next_back().map_or(0, |max| max + 1)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.counts.iter().map(|(k, v)| (*k, *v))
    }

    /// Dense count vector of length `num_classes` (missing classes are 0).
    pub fn dense(&self, num_classes: usize) -> Vec<usize> {
        (0..num_classes).map(|c| self.count(c)).collect()
    }
}

/// Partitioned dataset ready for training. Read-only after construction.
#[derive(Debug, Clone)]
pub struct SplitDataset<I> {
    pub train: Vec<(I, usize)>,
    pub val: Vec<(I, usize)>,
    pub test: Vec<(I, usize)>,
    pub samples: Vec<Sample>,
    pub vocabulary: ClassVocabulary,
    pub class_counts: ClassFrequencyTable,
}

impl<I> SplitDataset<I> {
    /// Build partitions from manifest records and a split assignment.
    ///
    /// Class indices come from the sorted label vocabulary of all records;
    /// `class_counts` is computed from the training partition only.
    pub fn from_records<F>(
        records: &[ManifestRecord],
        assignment: &SplitAssignment,
        group_by: Option<&str>,
        mut input: F,
    ) -> Result<Self>
    where
        F: FnMut(&ManifestRecord) -> Result<I>,
    {
        let vocabulary = ClassVocabulary::from_records(records);
        let mut train = Vec::new();
        let mut val = Vec::new();
        let mut test = Vec::new();
        let mut samples = Vec::with_capacity(records.len());

        for record in records {
            let class_index = vocabulary.index_of(&record.label).ok_or_else(|| {
                TuneError::dataset(format!("label '{}' missing from vocabulary", record.label))
            })?;
            let partition = assignment.get(&record.id).ok_or_else(|| {
                TuneError::dataset(format!("sample '{}' has no split assignment", record.id))
            })?;
            let item = (input(record)?, class_index);
            match partition {
                Partition::Train => train.push(item),
                Partition::Val => val.push(item),
                Partition::Test => test.push(item),
            }
            samples.push(Sample {
                id: record.id.clone(),
                group_key: extract_group_key(record, group_by).0,
                class_label: record.label.clone(),
                class_index,
            });
        }

        let class_counts = ClassFrequencyTable::from_labels(train.iter().map(|(_, y)| *y));
        Ok(Self {
            train,
            val,
            test,
            samples,
            vocabulary,
            class_counts,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.vocabulary.len()
    }

    pub fn partition(&self, partition: Partition) -> &[(I, usize)] {
        match partition {
            Partition::Train => &self.train,
            Partition::Val => &self.val,
            Partition::Test => &self.test,
        }
    }
}

/// Feature-vector dataset consumed by the built-in probe heads.
pub type FeatureDataset = SplitDataset<Vec<f32>>;

impl FeatureDataset {
    /// Uses each record's `features`; all vectors must share one dimension.
    pub fn from_manifest(
        records: &[ManifestRecord],
        assignment: &SplitAssignment,
        group_by: Option<&str>,
    ) -> Result<Self> {
        let mut dim: Option<usize> = None;
        Self::from_records(records, assignment, group_by, |record| {
            let features = record.features.clone().ok_or_else(|| {
                TuneError::dataset(format!("sample '{}' has no feature vector", record.id))
            })?;
            match dim {
                None => dim = Some(features.len()),
                Some(d) if d != features.len() => {
                    return Err(TuneError::dataset(format!(
                        "sample '{}' has {} features, expected {d}",
                        record.id,
                        features.len()
                    )));
                }
                Some(_) => {}
            }
            Ok(features)
        })
    }

    pub fn input_dim(&self) -> usize {
        self.train
            .iter()
            .chain(&self.val)
            .chain(&self.test)
            .next()
            .map_or(0, |(x, _)| x.len())
    }
}
