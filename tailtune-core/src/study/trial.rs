//! Trials and the handle an objective receives while one is running.

use crate::error::Result;
use crate::study::pruner::Pruner;
use crate::study::space::Params;
use crate::study::storage::{StudyRecord, StudyStorage};
use crate::tracking::{ExperimentSink, RunId};
use crate::training::metrics::Direction;
use crate::training::runner::TrialReporter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialState {
    Running,
    Complete,
    Pruned,
    Failed,
}

impl TrialState {
    pub const ALL: [TrialState; 4] = [
        TrialState::Running,
        TrialState::Complete,
        TrialState::Pruned,
        TrialState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrialState::Running => "running",
            TrialState::Complete => "complete",
            TrialState::Pruned => "pruned",
            TrialState::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, TrialState::Running)
    }
}

impl fmt::Display for TrialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrialState {
    type Err = crate::error::TuneError;

    fn from_str(s: &str) -> Result<Self> {
        TrialState::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| crate::error::TuneError::storage(format!("unknown trial state '{s}'")))
    }
}

/// One intermediate value reported at an epoch boundary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub step: usize,
    /// Non-finite values are stored as null and read back as NaN.
    #[serde(with = "non_finite_as_null")]
    pub value: f64,
}

mod non_finite_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub number: usize,
    pub params: Params,
    pub state: TrialState,
    #[serde(default)]
    pub intermediate_reports: Vec<Report>,
    pub final_value: Option<f64>,
    /// Failure message for `failed` trials.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Trial {
    pub fn new(number: usize, params: Params) -> Self {
        Self {
            number,
            params,
            state: TrialState::Running,
            intermediate_reports: Vec::new(),
            final_value: None,
            error: None,
            run_id: None,
            output_dir: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn last_report(&self) -> Option<Report> {
        self.intermediate_reports.last().copied()
    }

    pub fn report_at(&self, step: usize) -> Option<f64> {
        self.intermediate_reports
            .iter()
            .find(|r| r.step == step)
            .map(|r| r.value)
    }

    /// Record a value; a repeated step replaces the earlier value.
    pub fn push_report(&mut self, step: usize, value: f64) {
        match self.intermediate_reports.iter_mut().find(|r| r.step == step) {
            Some(existing) => existing.value = value,
            None => {
                self.intermediate_reports.push(Report { step, value });
                self.intermediate_reports.sort_by_key(|r| r.step);
            }
        }
    }

    /// Best reported value so far; NaN if any report was NaN.
    pub fn best_intermediate(&self, direction: Direction) -> Option<f64> {
        let mut best: Option<f64> = None;
        for r in &self.intermediate_reports {
            if r.value.is_nan() {
                return Some(f64::NAN);
            }
            best = direction.best_of(best, Some(r.value));
        }
        best
    }

    pub fn complete(&mut self, value: f64) {
        self.state = TrialState::Complete;
        self.final_value = Some(value);
        self.finished_at = Some(Utc::now());
    }

    pub fn prune(&mut self) {
        self.state = TrialState::Pruned;
        self.final_value = None;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.state = TrialState::Failed;
        self.final_value = None;
        self.error = Some(message.into());
        self.finished_at = Some(Utc::now());
    }

    /// Value shown in summaries: the final value, or the last report of a
    /// pruned trial.
    pub fn display_value(&self) -> Option<f64> {
        match self.state {
            TrialState::Complete => self.final_value,
            TrialState::Pruned => self.last_report().map(|r| r.value),
            _ => None,
        }
    }
}

/// Handle passed to the objective for the trial being executed.
///
/// Exposes the trial's parameters read-only and accepts intermediate
/// reports. Every report is persisted before the pruning decision.
pub struct TrialContext<'a> {
    study: &'a mut StudyRecord,
    index: usize,
    storage: &'a dyn StudyStorage,
    pruner: &'a dyn Pruner,
    sink: &'a dyn ExperimentSink,
}

impl<'a> TrialContext<'a> {
    pub(crate) fn new(
        study: &'a mut StudyRecord,
        index: usize,
        storage: &'a dyn StudyStorage,
        pruner: &'a dyn Pruner,
        sink: &'a dyn ExperimentSink,
    ) -> Self {
        Self {
            study,
            index,
            storage,
            pruner,
            sink,
        }
    }

    pub fn trial(&self) -> &Trial {
        &self.study.trials[self.index]
    }

    pub fn number(&self) -> usize {
        self.trial().number
    }

    pub fn params(&self) -> &Params {
        &self.trial().params
    }

    pub fn direction(&self) -> Direction {
        self.study.direction
    }

    pub fn study_name(&self) -> &str {
        &self.study.name
    }

    /// Trial-unique directory for checkpoints and artifacts.
    pub fn output_dir(&self) -> Option<&Path> {
        self.trial().output_dir.as_deref()
    }

    pub fn run_id(&self) -> Option<&RunId> {
        self.trial().run_id.as_ref()
    }

    pub fn sink(&self) -> &'a dyn ExperimentSink {
        self.sink
    }
}

impl TrialReporter for TrialContext<'_> {
    fn report(&mut self, step: usize, value: f64) -> Result<()> {
        self.study.trials[self.index].push_report(step, value);
        self.study.updated_at = Utc::now();
        self.storage.save(self.study)
    }

    fn should_prune(&self) -> Result<bool> {
        let (prior, rest) = self.study.trials.split_at(self.index);
        let Some(current) = rest.first() else {
            return Ok(false);
        };
        Ok(self.pruner.should_prune(current, prior, self.study.direction))
    }
}
