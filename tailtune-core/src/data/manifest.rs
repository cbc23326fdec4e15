//! Manifest records, the JSONL sample list shared by every pipeline stage.

use crate::error::{Result, TuneError};
use crate::persistence;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Which partition a sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Train,
    Val,
    Test,
}

impl Partition {
    pub const ALL: [Partition; 3] = [Partition::Train, Partition::Val, Partition::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::Train => "train",
            Partition::Val => "val",
            Partition::Test => "test",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Partition {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "train" => Ok(Partition::Train),
            "val" => Ok(Partition::Val),
            "test" => Ok(Partition::Test),
            other => Err(TuneError::invalid_input(format!(
                "unknown partition '{other}' (expected train, val or test)"
            ))),
        }
    }
}

/// One manifest line.
///
/// Fields this crate does not interpret (crop paths, bounding boxes, …) are
/// kept in `extra` so rewriting a manifest never drops them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, serde_json::Value>,
    /// Pre-extracted feature vector consumed by the built-in probe heads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split: Option<Partition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_idx: Option<usize>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ManifestRecord {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            meta: BTreeMap::new(),
            features: None,
            split: None,
            label_idx: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.meta.insert(key.to_string(), value.into());
        self
    }

    pub fn with_features(mut self, features: Vec<f32>) -> Self {
        self.features = Some(features);
        self
    }

    /// Metadata value rendered as a string, if present.
    pub fn meta_str(&self, key: &str) -> Option<String> {
        self.meta.get(key).map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// Read a manifest, rejecting duplicate sample ids.
pub fn read_manifest(path: &Path) -> Result<Vec<ManifestRecord>> {
    if !path.exists() {
        return Err(TuneError::not_found(format!(
            "manifest {}",
            path.display()
        )));
    }
    let records: Vec<ManifestRecord> = persistence::read_jsonl(path)?;
    ensure_unique_ids(&records)?;
    Ok(records)
}

pub fn write_manifest(path: &Path, records: &[ManifestRecord]) -> Result<()> {
    persistence::write_jsonl(path, records)?;
    Ok(())
}

pub(crate) fn ensure_unique_ids(records: &[ManifestRecord]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for record in records {
        if !seen.insert(record.id.as_str()) {
            return Err(TuneError::dataset(format!(
                "duplicate sample id '{}'",
                record.id
            )));
        }
    }
    Ok(())
}

/// Dense class-name ↔ index mapping.
///
/// Indices follow the sorted order of label names, so the mapping depends
/// only on which labels exist, never on record order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassVocabulary {
    names: Vec<String>,
}

impl ClassVocabulary {
    pub fn from_records(records: &[ManifestRecord]) -> Self {
        let names: BTreeSet<&str> = records.iter().map(|r| r.label.as_str()).collect();
        Self {
            names: names.into_iter().map(str::to_string).collect(),
        }
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = names.into_iter().map(Into::into).collect();
        Self {
            names: set.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.names.binary_search_by(|n| n.as_str().cmp(label)).ok()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}
