//! Sequential trial execution with persistent, resumable study state.

use crate::error::{Result, TuneError};
use crate::study::pruner::{Pruner, PrunerConfig};
use crate::study::sampler::{Sampler, SamplerConfig};
use crate::study::space::{Params, SearchSpace, merge_params};
use crate::study::storage::{StudyRecord, StudyStorage, validate_study_name};
use crate::study::trial::{Trial, TrialContext, TrialState};
use crate::tracking::{ExperimentSink, RunId, RunStatus};
use crate::training::metrics::Direction;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Runs trials one at a time, persisting the study after every state change.
///
/// Calling [`TrialScheduler::run`] again for a stored study continues it:
/// finished trials count toward `n_trials`, and trials left `running` by an
/// interrupted process are executed again before anything new is sampled.
pub struct TrialScheduler<'a> {
    name: String,
    storage: &'a dyn StudyStorage,
    sink: &'a dyn ExperimentSink,
    output_dir: PathBuf,
    sampler_config: SamplerConfig,
    pruner_config: PrunerConfig,
    sampler: Box<dyn Sampler>,
    pruner: Box<dyn Pruner>,
    timeout: Option<Duration>,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a> TrialScheduler<'a> {
    /// `output_dir` is the study's own directory; trial `n` writes into
    /// `<output_dir>/trial_<n>`.
    pub fn new(
        name: &str,
        storage: &'a dyn StudyStorage,
        sink: &'a dyn ExperimentSink,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        validate_study_name(name)?;
        let sampler_config = SamplerConfig::default();
        let pruner_config = PrunerConfig::default();
        Ok(Self {
            name: name.to_string(),
            storage,
            sink,
            output_dir: output_dir.into(),
            sampler: sampler_config.build(),
            pruner: pruner_config.build()?,
            sampler_config,
            pruner_config,
            timeout: None,
            cancel: None,
        })
    }

    pub fn with_sampler(mut self, config: SamplerConfig) -> Self {
        self.sampler = config.build();
        self.sampler_config = config;
        self
    }

    pub fn with_pruner(mut self, config: PrunerConfig) -> Result<Self> {
        self.pruner = config.build()?;
        self.pruner_config = config;
        Ok(self)
    }

    /// Wall-clock budget; checked before each trial starts.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Once the flag is set, no further trial is started.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn trial_dir(&self, number: usize) -> PathBuf {
        self.output_dir.join(format!("trial_{number}"))
    }

    fn stop_reason(&self, started: Instant) -> Option<&'static str> {
        if self.cancel.as_ref().is_some_and(|c| c.load(Ordering::SeqCst)) {
            return Some("cancelled");
        }
        if self.timeout.is_some_and(|t| started.elapsed() >= t) {
            return Some("timeout");
        }
        None
    }

    /// Load the stored study or create it. A stored study optimized in the
    /// other direction is a configuration error.
    fn load_or_create(&self, direction: Direction) -> Result<StudyRecord> {
        match self.storage.load(&self.name)? {
            Some(study) => {
                if study.direction != direction {
                    return Err(TuneError::config(format!(
                        "study '{}' was created to {} but is being run to {}",
                        self.name, study.direction, direction
                    )));
                }
                if study.sampler != self.sampler_config || study.pruner != self.pruner_config {
                    tracing::warn!(
                        study = %self.name,
                        "sampler or pruner settings differ from the stored study; using the current settings"
                    );
                }
                tracing::info!(
                    study = %self.name,
                    trials = study.trials.len(),
                    finished = study.n_finished(),
                    "loaded existing study"
                );
                Ok(study)
            }
            None => Ok(StudyRecord::new(
                &self.name,
                direction,
                self.sampler_config.clone(),
                self.pruner_config.clone(),
            )),
        }
    }

    fn parent_run(&self, study: &mut StudyRecord, fixed: &Params) -> Result<RunId> {
        if let Some(id) = study.parent_run.clone() {
            if self.sink.set_tag(&id, "resumed", "true").is_ok() {
                return Ok(id);
            }
            tracing::warn!(study = %self.name, run = %id, "parent run not found in tracking store; starting a new one");
        }
        let id = self.sink.start_run(&self.name, None)?;
        self.sink.set_tag(&id, "study", &self.name)?;
        self.sink.set_tag(&id, "direction", study.direction.as_str())?;
        self.sink.log_params(&id, fixed)?;
        study.parent_run = Some(id.clone());
        Ok(id)
    }

    /// Run up to `n_trials` trials in total for this study.
    ///
    /// The objective receives a [`TrialContext`] for reporting and returns the
    /// trial's final value. [`TuneError::Pruned`] marks the trial pruned;
    /// storage errors abort the study; any other error marks the trial failed
    /// and the study moves on.
    pub fn run<F>(
        &mut self,
        space: &SearchSpace,
        fixed: &Params,
        n_trials: usize,
        mut objective: F,
        direction: Direction,
    ) -> Result<StudyRecord>
    where
        F: FnMut(&mut TrialContext<'_>) -> Result<f64>,
    {
        self.sampler_config.validate(space)?;
        let started = Instant::now();
        let mut study = self.load_or_create(direction)?;
        let parent = self.parent_run(&mut study, fixed)?;
        study.touch();
        self.storage.save(&study)?;

        let mut remaining = n_trials.saturating_sub(study.n_finished());
        tracing::info!(study = %self.name, n_trials, remaining, sampler = self.sampler.name(), pruner = self.pruner.name(), "starting study");

        let interrupted: Vec<usize> = study
            .trials
            .iter()
            .enumerate()
            .filter(|(_, t)| t.state == TrialState::Running)
            .map(|(i, _)| i)
            .collect();
        for index in interrupted {
            if remaining == 0 {
                break;
            }
            if let Some(reason) = self.stop_reason(started) {
                tracing::info!(study = %self.name, reason, "stopping study");
                return self.finish(study, &parent);
            }
            tracing::warn!(
                study = %self.name,
                trial = study.trials[index].number,
                "re-running trial interrupted by a previous process"
            );
            self.execute(&mut study, index, &parent, &mut objective)?;
            remaining -= 1;
        }

        while remaining > 0 {
            if let Some(reason) = self.stop_reason(started) {
                tracing::info!(study = %self.name, reason, "stopping study");
                break;
            }
            let number = study.trials.iter().map(|t| t.number + 1).max().unwrap_or(0);
            let Some(sampled) = self.sampler.sample(space, &study.trials, number)? else {
                tracing::info!(study = %self.name, "search space exhausted");
                break;
            };
            let mut trial = Trial::new(number, merge_params(fixed, &sampled));
            trial.output_dir = Some(self.trial_dir(number));
            study.trials.push(trial);
            let index = study.trials.len() - 1;
            self.execute(&mut study, index, &parent, &mut objective)?;
            remaining -= 1;
        }

        self.finish(study, &parent)
    }

    fn execute<F>(&self, study: &mut StudyRecord, index: usize, parent: &RunId, objective: &mut F) -> Result<()>
    where
        F: FnMut(&mut TrialContext<'_>) -> Result<f64>,
    {
        let number = study.trials[index].number;
        let run = self.sink.start_run(&format!("trial_{number}"), Some(parent))?;
        self.sink.log_params(&run, &study.trials[index].params)?;
        {
            let trial = &mut study.trials[index];
            trial.run_id = Some(run.clone());
            if trial.output_dir.is_none() {
                trial.output_dir = Some(self.trial_dir(number));
            }
        }
        study.touch();
        self.storage.save(study)?;

        let outcome = {
            let mut ctx = TrialContext::new(study, index, self.storage, self.pruner.as_ref(), self.sink);
            objective(&mut ctx)
        };

        let trial = &mut study.trials[index];
        match outcome {
            Ok(value) if value.is_finite() => {
                trial.complete(value);
                self.sink.log_metric(&run, "final_value", value, None)?;
                self.sink.end_run(&run, RunStatus::Finished)?;
                tracing::info!(study = %self.name, trial = number, value, "trial complete");
            }
            Ok(value) => {
                trial.fail(format!("objective returned non-finite value {value}"));
                self.sink.end_run(&run, RunStatus::Failed)?;
                tracing::warn!(study = %self.name, trial = number, value, "trial failed");
            }
            Err(TuneError::Pruned { step, value }) => {
                trial.prune();
                self.sink.set_tag(&run, "state", TrialState::Pruned.as_str())?;
                self.sink.end_run(&run, RunStatus::Killed)?;
                tracing::info!(study = %self.name, trial = number, step, value, "trial pruned");
            }
            Err(e @ (TuneError::Storage(_) | TuneError::Sqlite(_))) => return Err(e),
            Err(e) => {
                trial.fail(e.to_string());
                self.sink.set_tag(&run, "error", &e.to_string())?;
                self.sink.end_run(&run, RunStatus::Failed)?;
                tracing::warn!(study = %self.name, trial = number, error = %e, "trial failed");
            }
        }
        study.touch();
        self.storage.save(study)
    }

    fn finish(&self, mut study: StudyRecord, parent: &RunId) -> Result<StudyRecord> {
        let mut metrics = BTreeMap::new();
        metrics.insert("n_trials_completed".to_string(), study.count(TrialState::Complete) as f64);
        metrics.insert("n_trials_pruned".to_string(), study.count(TrialState::Pruned) as f64);
        metrics.insert("n_trials_failed".to_string(), study.count(TrialState::Failed) as f64);

        if let Some(best) = study.best_trial() {
            if let Some(value) = best.final_value {
                metrics.insert("best_value".to_string(), value);
            }
            let best_params: Params = best
                .params
                .iter()
                .map(|(k, v)| (format!("best_{k}"), v.clone()))
                .collect();
            self.sink.log_params(parent, &best_params)?;
            tracing::info!(
                study = %self.name,
                trial = best.number,
                value = ?best.final_value,
                "best trial"
            );
        }
        self.sink.log_metrics(parent, &metrics, None)?;
        self.sink.end_run(parent, RunStatus::Finished)?;

        study.touch();
        self.storage.save(&study)?;
        Ok(study)
    }
}
