//! In-process tracking store, used by tests and dry runs.

use super::{ExperimentSink, MetricPoint, RunId, RunInfo, RunStatus, finite_metrics};
use crate::error::{Result, TuneError};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
pub struct MemoryRun {
    pub info: RunInfo,
    pub params: BTreeMap<String, serde_json::Value>,
    pub metrics: Vec<MetricPoint>,
    pub artifacts: Vec<PathBuf>,
}

#[derive(Default)]
pub struct MemorySink {
    runs: Mutex<Vec<MemoryRun>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<MemoryRun>>> {
        self.runs
            .lock()
            .map_err(|_| TuneError::storage("tracking store lock poisoned"))
    }

    fn with_run<T>(&self, run: &RunId, f: impl FnOnce(&mut MemoryRun) -> T) -> Result<T> {
        let mut runs = self.lock()?;
        let entry = runs
            .iter_mut()
            .find(|r| &r.info.id == run)
            .ok_or_else(|| TuneError::not_found(format!("run {run}")))?;
        Ok(f(entry))
    }

    /// Snapshot of every run, in creation order.
    pub fn runs(&self) -> Vec<MemoryRun> {
        self.runs.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn run(&self, run: &RunId) -> Option<MemoryRun> {
        self.runs().into_iter().find(|r| &r.info.id == run)
    }

    pub fn children(&self, parent: &RunId) -> Vec<MemoryRun> {
        self.runs()
            .into_iter()
            .filter(|r| r.info.parent.as_ref() == Some(parent))
            .collect()
    }

    /// Values logged under `key`, in logging order.
    pub fn metric_values(&self, run: &RunId, key: &str) -> Vec<f64> {
        self.run(run)
            .map(|r| {
                r.metrics
                    .iter()
                    .filter(|m| m.key == key)
                    .map(|m| m.value)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl ExperimentSink for MemorySink {
    fn start_run(&self, name: &str, parent: Option<&RunId>) -> Result<RunId> {
        let info = RunInfo::new(name, parent);
        let id = info.id.clone();
        self.lock()?.push(MemoryRun {
            info,
            params: BTreeMap::new(),
            metrics: Vec::new(),
            artifacts: Vec::new(),
        });
        Ok(id)
    }

    fn log_params(&self, run: &RunId, params: &BTreeMap<String, serde_json::Value>) -> Result<()> {
        self.with_run(run, |r| {
            r.params
                .extend(params.iter().map(|(k, v)| (k.clone(), v.clone())))
        })
    }

    fn log_metrics(&self, run: &RunId, metrics: &BTreeMap<String, f64>, step: Option<usize>) -> Result<()> {
        let timestamp = Utc::now();
        self.with_run(run, |r| {
            for (key, value) in finite_metrics(metrics) {
                r.metrics.push(MetricPoint {
                    key: key.clone(),
                    value,
                    step,
                    timestamp,
                });
            }
        })
    }

    fn log_artifact(&self, run: &RunId, path: &Path) -> Result<()> {
        self.with_run(run, |r| r.artifacts.push(path.to_path_buf()))
    }

    fn set_tag(&self, run: &RunId, key: &str, value: &str) -> Result<()> {
        self.with_run(run, |r| {
            r.info.tags.insert(key.to_string(), value.to_string());
        })
    }

    fn end_run(&self, run: &RunId, status: RunStatus) -> Result<()> {
        self.with_run(run, |r| {
            r.info.status = status;
            r.info.end_time = Some(Utc::now());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_records_children() {
        let sink = MemorySink::new();
        let parent = sink.start_run("study", None).unwrap();
        let a = sink.start_run("trial_0", Some(&parent)).unwrap();
        sink.start_run("trial_1", Some(&parent)).unwrap();

        sink.log_metric(&a, "val_acc", 0.5, Some(0)).unwrap();
        sink.log_metric(&a, "val_acc", 0.6, Some(1)).unwrap();
        sink.end_run(&a, RunStatus::Finished).unwrap();

        assert_eq!(sink.children(&parent).len(), 2);
        assert_eq!(sink.metric_values(&a, "val_acc"), vec![0.5, 0.6]);
        assert_eq!(sink.run(&a).unwrap().info.status, RunStatus::Finished);
    }

    #[test]
    fn test_unknown_run_is_not_found() {
        let sink = MemorySink::new();
        let err = sink.set_tag(&RunId("nope".into()), "k", "v").unwrap_err();
        assert!(matches!(err, TuneError::NotFound(_)));
    }
}
