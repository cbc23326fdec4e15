//! Experiment tracking.
//!
//! Runs form a tree: a study opens a parent run and every trial logs into a
//! child run of it, so the whole study can be queried as one unit.

pub mod file;
pub mod memory;

pub use file::FileSink;
pub use memory::MemorySink;

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Opaque run identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
    Killed,
}

/// Run metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub id: RunId,
    pub name: String,
    pub parent: Option<RunId>,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl RunInfo {
    pub fn new(name: &str, parent: Option<&RunId>) -> Self {
        Self {
            id: RunId::generate(),
            name: name.to_string(),
            parent: parent.cloned(),
            status: RunStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            tags: BTreeMap::new(),
        }
    }
}

/// One logged metric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub key: String,
    pub value: f64,
    pub step: Option<usize>,
    pub timestamp: DateTime<Utc>,
}

/// Destination for run parameters, metrics and artifacts.
pub trait ExperimentSink: Send + Sync {
    fn start_run(&self, name: &str, parent: Option<&RunId>) -> Result<RunId>;

    fn log_params(&self, run: &RunId, params: &BTreeMap<String, serde_json::Value>) -> Result<()>;

    fn log_metrics(&self, run: &RunId, metrics: &BTreeMap<String, f64>, step: Option<usize>) -> Result<()>;

    fn log_artifact(&self, run: &RunId, path: &Path) -> Result<()>;

    fn set_tag(&self, run: &RunId, key: &str, value: &str) -> Result<()>;

    fn end_run(&self, run: &RunId, status: RunStatus) -> Result<()>;

    fn log_metric(&self, run: &RunId, key: &str, value: f64, step: Option<usize>) -> Result<()> {
        let mut map = BTreeMap::new();
        map.insert(key.to_string(), value);
        self.log_metrics(run, &map, step)
    }
}

/// Drop every non-finite value; JSON cannot carry them.
pub(crate) fn finite_metrics(metrics: &BTreeMap<String, f64>) -> impl Iterator<Item = (&String, f64)> {
    metrics
        .iter()
        .filter(|(_, v)| v.is_finite())
        .map(|(k, v)| (k, *v))
}
