//! Directory-backed tracking store.
//!
//! ```text
//! <root>/<run_id>/meta.json
//!                 params.json
//!                 metrics.jsonl
//!                 artifacts/
//! ```

use super::{ExperimentSink, MetricPoint, RunId, RunInfo, RunStatus, finite_metrics};
use crate::error::{Result, TuneError};
use crate::persistence;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct FileSink {
    root: PathBuf,
    // Serializes read-modify-write of meta.json and params.json.
    lock: Mutex<()>,
}

impl FileSink {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run: &RunId) -> PathBuf {
        self.root.join(run.as_str())
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| TuneError::storage("tracking store lock poisoned"))
    }

    pub fn run(&self, run: &RunId) -> Result<RunInfo> {
        persistence::load_json(&self.run_dir(run).join("meta.json"))?
            .ok_or_else(|| TuneError::not_found(format!("run {run}")))
    }

    fn update_run(&self, run: &RunId, f: impl FnOnce(&mut RunInfo)) -> Result<()> {
        let _guard = self.guard()?;
        let mut info = self.run(run)?;
        f(&mut info);
        persistence::atomic_write_json(&self.run_dir(run).join("meta.json"), &info)?;
        Ok(())
    }

    /// Every run in the store, oldest first.
    pub fn runs(&self) -> Result<Vec<RunInfo>> {
        let mut runs = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(info) = persistence::load_json::<RunInfo>(&entry.path().join("meta.json"))? {
                runs.push(info);
            }
        }
        runs.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        Ok(runs)
    }

    pub fn children(&self, parent: &RunId) -> Result<Vec<RunInfo>> {
        Ok(self
            .runs()?
            .into_iter()
            .filter(|r| r.parent.as_ref() == Some(parent))
            .collect())
    }

    pub fn params(&self, run: &RunId) -> Result<BTreeMap<String, serde_json::Value>> {
        Ok(persistence::load_json(&self.run_dir(run).join("params.json"))?.unwrap_or_default())
    }

    pub fn metrics(&self, run: &RunId) -> Result<Vec<MetricPoint>> {
        let path = self.run_dir(run).join("metrics.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(persistence::read_jsonl(&path)?)
    }
}

impl ExperimentSink for FileSink {
    fn start_run(&self, name: &str, parent: Option<&RunId>) -> Result<RunId> {
        let info = RunInfo::new(name, parent);
        let dir = self.run_dir(&info.id);
        std::fs::create_dir_all(dir.join("artifacts"))?;
        persistence::atomic_write_json(&dir.join("meta.json"), &info)?;
        tracing::debug!(run = %info.id, name, parent = ?parent.map(RunId::as_str), "run started");
        Ok(info.id)
    }

    fn log_params(&self, run: &RunId, params: &BTreeMap<String, serde_json::Value>) -> Result<()> {
        let _guard = self.guard()?;
        let path = self.run_dir(run).join("params.json");
        let mut merged: BTreeMap<String, serde_json::Value> =
            persistence::load_json(&path)?.unwrap_or_default();
        merged.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        persistence::atomic_write_json(&path, &merged)?;
        Ok(())
    }

    fn log_metrics(&self, run: &RunId, metrics: &BTreeMap<String, f64>, step: Option<usize>) -> Result<()> {
        let path = self.run_dir(run).join("metrics.jsonl");
        let timestamp = Utc::now();
        for (key, value) in finite_metrics(metrics) {
            persistence::append_jsonl(
                &path,
                &MetricPoint {
                    key: key.clone(),
                    value,
                    step,
                    timestamp,
                },
            )?;
        }
        Ok(())
    }

    fn log_artifact(&self, run: &RunId, path: &Path) -> Result<()> {
        let file_name = path
            .file_name()
            .ok_or_else(|| TuneError::invalid_input(format!("artifact {} has no file name", path.display())))?;
        let dest = self.run_dir(run).join("artifacts").join(file_name);
        std::fs::copy(path, &dest)?;
        Ok(())
    }

    fn set_tag(&self, run: &RunId, key: &str, value: &str) -> Result<()> {
        self.update_run(run, |info| {
            info.tags.insert(key.to_string(), value.to_string());
        })
    }

    fn end_run(&self, run: &RunId, status: RunStatus) -> Result<()> {
        self.update_run(run, |info| {
            info.status = status;
            info.end_time = Some(Utc::now());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_nested_runs_and_metrics() {
        let dir = TempDir::new().unwrap();
        let sink = FileSink::new(dir.path()).unwrap();

        let parent = sink.start_run("optimization_demo", None).unwrap();
        let child = sink.start_run("trial_0", Some(&parent)).unwrap();
        let _other = sink.start_run("unrelated", None).unwrap();

        let mut params = BTreeMap::new();
        params.insert("lr".to_string(), serde_json::json!(0.01));
        sink.log_params(&child, &params).unwrap();
        sink.log_metric(&child, "val_acc", 0.8, Some(1)).unwrap();
        sink.log_metric(&child, "val_acc", f64::NAN, Some(2)).unwrap();
        sink.set_tag(&child, "status", "completed").unwrap();
        sink.end_run(&child, RunStatus::Finished).unwrap();

        let children = sink.children(&parent).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, child);
        assert_eq!(children[0].status, RunStatus::Finished);
        assert_eq!(children[0].tags["status"], "completed");

        assert_eq!(sink.params(&child).unwrap()["lr"], 0.01);
        let metrics = sink.metrics(&child).unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].step, Some(1));
    }

    #[test]
    fn test_log_artifact_copies_file() {
        let dir = TempDir::new().unwrap();
        let sink = FileSink::new(dir.path().join("runs")).unwrap();
        let run = sink.start_run("r", None).unwrap();

        let artifact = dir.path().join("best.toml");
        std::fs::write(&artifact, "lr = 0.1\n").unwrap();
        sink.log_artifact(&run, &artifact).unwrap();
        assert!(sink.root().join(run.as_str()).join("artifacts/best.toml").exists());
    }

    #[test]
    fn test_unknown_run() {
        let dir = TempDir::new().unwrap();
        let sink = FileSink::new(dir.path()).unwrap();
        let err = sink.end_run(&RunId("missing".into()), RunStatus::Failed).unwrap_err();
        assert!(matches!(err, TuneError::NotFound(_)));
    }
}
