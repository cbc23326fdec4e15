//! From parameters to a training run.
//!
//! A trial's parameter map is overlaid on the base [`TrainingConfig`] to
//! form a [`TrainingPlan`]; the plan builds the model, optimizer, scheduler
//! and loss, and runs them with checkpoints owned by that exact parameter
//! set.

use crate::config::TrainingConfig;
use crate::data::dataset::FeatureDataset;
use crate::data::loader::SampleOrder;
use crate::error::{Result, TuneError};
use crate::registry::{ComponentRegistry, ModelSpec};
use crate::study::space::{ParamSpec, Params, SearchSpace};
use crate::study::trial::TrialContext;
use crate::tracking::{ExperimentSink, RunId};
use crate::training::checkpoint::{BEST_FILE, CheckpointStore, fingerprint};
use crate::training::loss::LossConfig;
use crate::training::modulation::ModulationCurve;
use crate::training::optim::{OptimizerConfig, SchedulerConfig};
use crate::training::runner::{RunConfig, RunResult, TrainingRun};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;

/// Parameter names a trial may set.
pub const KNOWN_PARAMS: &[&str] = &[
    "batch_size",
    "epochs",
    "hidden_dim",
    "loss",
    "lr",
    "min_delta",
    "model",
    "modulation_type",
    "momentum",
    "optimizer",
    "patience",
    "scheduler",
    "seed",
    "tau",
    "weight_decay",
    "weighted_sampler",
];

/// Reject search spaces naming unknown parameters or unknown models.
pub fn validate_space(space: &SearchSpace, registry: &ComponentRegistry) -> Result<()> {
    for (name, spec) in space.iter() {
        if !KNOWN_PARAMS.contains(&name) {
            return Err(TuneError::config(format!(
                "unknown search-space parameter '{name}' (known: {})",
                KNOWN_PARAMS.join(", ")
            )));
        }
        if name == "model" {
            let ParamSpec::Categorical { choices } = spec else {
                return Err(TuneError::config("search-space parameter 'model' must be categorical"));
            };
            for choice in choices {
                registry.require(choice.as_str().unwrap_or_default())?;
            }
        }
    }
    Ok(())
}

/// Reject fixed values that would not form a valid plan.
pub fn validate_fixed(fixed: &Params, registry: &ComponentRegistry, base: &TrainingConfig) -> Result<()> {
    TrainingPlan::from_params(base, fixed)?.training.validate(registry)
}

fn as_str<'v>(key: &str, value: &'v Value) -> Result<&'v str> {
    value
        .as_str()
        .ok_or_else(|| TuneError::config(format!("parameter '{key}' must be a string, got {value}")))
}

fn as_f64(key: &str, value: &Value) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| TuneError::config(format!("parameter '{key}' must be a number, got {value}")))
}

fn as_usize(key: &str, value: &Value) -> Result<usize> {
    value
        .as_u64()
        .map(|v| v as usize)
        .ok_or_else(|| TuneError::config(format!("parameter '{key}' must be a non-negative integer, got {value}")))
}

fn as_bool(key: &str, value: &Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| TuneError::config(format!("parameter '{key}' must be a boolean, got {value}")))
}

/// A tagged config variant with its default fields.
fn variant<T: DeserializeOwned>(key: &str, name: &str) -> Result<T> {
    serde_json::from_value(serde_json::json!({ "type": name }))
        .map_err(|e| TuneError::config(format!("parameter '{key}': {e}")))
}

/// Resolved training settings for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingPlan {
    pub training: TrainingConfig,
}

impl TrainingPlan {
    /// Overlay `params` on `base`. Component switches (`optimizer`,
    /// `scheduler`, `loss`) apply before the values that tune them.
    pub fn from_params(base: &TrainingConfig, params: &Params) -> Result<Self> {
        let mut cfg = base.clone();

        for (key, value) in params {
            match key.as_str() {
                "optimizer" => {
                    let name = as_str(key, value)?;
                    if name != cfg.optimizer.name() {
                        let lr = cfg.optimizer.lr();
                        cfg.optimizer = variant(key, name)?;
                        set_lr(&mut cfg.optimizer, lr);
                    }
                }
                "scheduler" => {
                    let name = as_str(key, value)?;
                    if name != cfg.scheduler.name() {
                        cfg.scheduler = variant::<SchedulerConfig>(key, name)?;
                    }
                }
                "loss" => {
                    let name = as_str(key, value)?;
                    if name != cfg.loss.name() {
                        cfg.loss = variant::<LossConfig>(key, name)?;
                    }
                }
                _ => {}
            }
        }

        for (key, value) in params {
            match key.as_str() {
                "optimizer" | "scheduler" | "loss" => {}
                "model" => cfg.model = as_str(key, value)?.to_string(),
                "hidden_dim" => cfg.hidden_dim = as_usize(key, value)?,
                "epochs" => cfg.epochs = as_usize(key, value)?,
                "batch_size" => cfg.batch_size = as_usize(key, value)?,
                "patience" => cfg.patience = as_usize(key, value)?,
                "min_delta" => cfg.min_delta = as_f64(key, value)?,
                "seed" => cfg.seed = as_usize(key, value)? as u64,
                "weighted_sampler" => cfg.weighted_sampler = as_bool(key, value)?,
                "lr" => set_lr(&mut cfg.optimizer, as_f64(key, value)?),
                "weight_decay" => {
                    let v = as_f64(key, value)?;
                    match &mut cfg.optimizer {
                        OptimizerConfig::Sgd { weight_decay, .. }
                        | OptimizerConfig::AdamW { weight_decay, .. } => *weight_decay = v,
                    }
                }
                "momentum" => {
                    let v = as_f64(key, value)?;
                    match &mut cfg.optimizer {
                        OptimizerConfig::Sgd { momentum, .. } => *momentum = v,
                        OptimizerConfig::AdamW { .. } => {
                            tracing::debug!(momentum = v, "momentum ignored for adamw");
                        }
                    }
                }
                "tau" => {
                    let v = as_f64(key, value)?;
                    match &mut cfg.loss {
                        LossConfig::SmoothModulation { tau, .. } => *tau = v,
                        LossConfig::CrossEntropy { .. } => {
                            tracing::debug!(tau = v, "tau ignored for cross_entropy");
                        }
                    }
                }
                "modulation_type" => {
                    let v: ModulationCurve = as_str(key, value)?.parse()?;
                    match &mut cfg.loss {
                        LossConfig::SmoothModulation { curve, .. } => *curve = v,
                        LossConfig::CrossEntropy { .. } => {
                            tracing::debug!(curve = %v, "modulation_type ignored for cross_entropy");
                        }
                    }
                }
                other => {
                    return Err(TuneError::config(format!("unknown parameter '{other}'")));
                }
            }
        }

        Ok(Self { training: cfg })
    }

    pub fn run_config(&self) -> RunConfig {
        let t = &self.training;
        RunConfig {
            max_epochs: t.epochs,
            batch_size: t.batch_size,
            patience: t.patience,
            min_delta: t.min_delta,
            monitor: t.monitor,
            sample_order: if t.weighted_sampler {
                SampleOrder::Weighted
            } else {
                SampleOrder::Shuffled
            },
            seed: t.seed,
        }
    }

    /// Identity of this plan; checkpoints written under it refuse to load
    /// into any other plan. Run-length settings are left out so an
    /// interrupted run can be resumed with a longer budget.
    pub fn fingerprint(&self) -> Result<String> {
        let mut identity = self.training.clone();
        let defaults = TrainingConfig::default();
        identity.epochs = defaults.epochs;
        identity.patience = defaults.patience;
        identity.min_delta = defaults.min_delta;
        fingerprint(&identity)
    }

    /// Build a run for `data`, checkpointing into `checkpoint_dir` if given.
    pub fn build_run<'a>(
        &self,
        registry: &ComponentRegistry,
        data: &FeatureDataset,
        checkpoint_dir: Option<&Path>,
    ) -> Result<TrainingRun<'a, Vec<f32>>> {
        let t = &self.training;
        if data.train.is_empty() {
            return Err(TuneError::dataset("training partition is empty"));
        }
        let model = registry.build_model(
            &t.model,
            &ModelSpec {
                input_dim: data.input_dim(),
                num_classes: data.num_classes(),
                hidden_dim: t.hidden_dim,
                seed: t.seed,
            },
        )?;
        let optimizer = t.optimizer.build()?;
        let scheduler = t.scheduler.build(t.optimizer.lr(), t.epochs)?;
        let loss = t.loss.build(t.epochs)?;
        let architecture = model.architecture_fingerprint();

        let mut run = TrainingRun::new(self.run_config(), model, optimizer, scheduler, loss)?;
        if let Some(dir) = checkpoint_dir {
            let store = CheckpointStore::new(dir, t.monitor.direction(), architecture)
                .with_owner(self.fingerprint()?);
            run = run.with_checkpoints(store);
        }
        Ok(run)
    }

    /// Run outside any study, logging into `run` if a sink is given.
    pub fn train(
        &self,
        registry: &ComponentRegistry,
        data: &FeatureDataset,
        checkpoint_dir: &Path,
        tracking: Option<(&dyn ExperimentSink, RunId)>,
    ) -> Result<RunResult> {
        let mut run = self.build_run(registry, data, Some(checkpoint_dir))?;
        if let Some((sink, id)) = tracking.clone() {
            run = run.with_sink(sink, id);
        }
        let result = run.run(data)?;
        if let Some((sink, id)) = tracking {
            log_best_checkpoint(sink, &id, checkpoint_dir)?;
        }
        Ok(result)
    }
}

fn set_lr(optimizer: &mut OptimizerConfig, value: f64) {
    match optimizer {
        OptimizerConfig::Sgd { lr, .. } | OptimizerConfig::AdamW { lr, .. } => *lr = value,
    }
}

fn log_best_checkpoint(sink: &dyn ExperimentSink, run: &RunId, dir: &Path) -> Result<()> {
    let best = dir.join(BEST_FILE);
    if best.exists() {
        sink.log_artifact(run, &best)?;
    }
    Ok(())
}

/// Study objective: train the trial's plan in its own output directory and
/// return the best monitored value.
///
/// A run that never produced a monitored value is an error, so the trial is
/// recorded as failed rather than completing with a made-up score.
pub fn run_trial(
    ctx: &mut TrialContext<'_>,
    registry: &ComponentRegistry,
    base: &TrainingConfig,
    data: &FeatureDataset,
) -> Result<f64> {
    let plan = TrainingPlan::from_params(base, ctx.params())?;
    plan.training.validate(registry)?;
    let dir = ctx
        .output_dir()
        .map(Path::to_path_buf)
        .ok_or_else(|| TuneError::training("trial has no output directory"))?;
    let run_id = ctx.run_id().cloned();
    let sink = ctx.sink();

    let result = {
        let mut run = plan.build_run(registry, data, Some(&dir))?;
        if let Some(id) = run_id.clone() {
            run = run.with_sink(sink, id);
        }
        run.with_reporter(ctx).run(data)?
    };

    if let Some(id) = &run_id {
        log_best_checkpoint(sink, id, &dir)?;
    }
    tracing::info!(
        best_metric = ?result.best_metric,
        best_epoch = ?result.best_epoch,
        stopped_early = result.stopped_early,
        "trial run finished"
    );
    result
        .best_metric
        .ok_or_else(|| TuneError::training("run produced no monitored metric"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, Value)]) -> Params {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_overlay_switches_component_then_tunes_it() {
        let base = TrainingConfig::default();
        let plan = TrainingPlan::from_params(
            &base,
            &params(&[
                ("lr", json!(0.05)),
                ("momentum", json!(0.5)),
                ("optimizer", json!("sgd")),
                ("modulation_type", json!("step")),
                ("tau", json!(1.0)),
                ("epochs", json!(3)),
            ]),
        )
        .unwrap();
        let t = &plan.training;
        assert_eq!(t.epochs, 3);
        assert!(matches!(
            t.optimizer,
            OptimizerConfig::Sgd { lr, momentum, .. } if lr == 0.05 && momentum == 0.5
        ));
        assert!(matches!(
            t.loss,
            LossConfig::SmoothModulation { tau, curve: ModulationCurve::Step, .. } if tau == 1.0
        ));
    }

    #[test]
    fn test_switch_keeps_learning_rate() {
        let mut base = TrainingConfig::default();
        base.optimizer = variant("optimizer", "adamw").unwrap();
        set_lr(&mut base.optimizer, 0.003);
        let plan = TrainingPlan::from_params(&base, &params(&[("optimizer", json!("sgd"))])).unwrap();
        assert_eq!(plan.training.optimizer.lr(), 0.003);
    }

    #[test]
    fn test_bad_values_are_config_errors() {
        let base = TrainingConfig::default();
        for p in [
            params(&[("optimizer", json!("lamb"))]),
            params(&[("epochs", json!("ten"))]),
            params(&[("modulation_type", json!("sigmoid"))]),
            params(&[("dropout", json!(0.1))]),
        ] {
            let err = TrainingPlan::from_params(&base, &p).unwrap_err();
            assert!(matches!(err, TuneError::Config(_)), "{err}");
        }
    }

    #[test]
    fn test_fingerprint_differs_per_plan() {
        let base = TrainingConfig::default();
        let a = TrainingPlan::from_params(&base, &params(&[("model", json!("linear_probe"))])).unwrap();
        let b = TrainingPlan::from_params(&base, &params(&[("model", json!("mlp_probe"))])).unwrap();
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        let default_plan = TrainingPlan::from_params(&base, &Params::new()).unwrap();
        assert_eq!(a.fingerprint().unwrap(), default_plan.fingerprint().unwrap());
    }

    #[test]
    fn test_validate_space_checks_names_and_models() {
        let registry = ComponentRegistry::default();
        let good = SearchSpace::new()
            .with("lr", ParamSpec::Float { low: 1e-4, high: 1e-1, log: true })
            .with("model", ParamSpec::Categorical { choices: vec![json!("linear_probe"), json!("mlp_probe")] });
        validate_space(&good, &registry).unwrap();

        let unknown_model = SearchSpace::new()
            .with("model", ParamSpec::Categorical { choices: vec![json!("resnet50")] });
        assert!(validate_space(&unknown_model, &registry).is_err());

        let unknown_key = SearchSpace::new().with("dropout", ParamSpec::Float { low: 0.0, high: 0.5, log: false });
        assert!(validate_space(&unknown_key, &registry).is_err());
    }

    #[test]
    fn test_run_config_uses_weighted_sampler_flag() {
        let base = TrainingConfig::default();
        let plan = TrainingPlan::from_params(&base, &params(&[("weighted_sampler", json!(true))])).unwrap();
        assert_eq!(plan.run_config().sample_order, SampleOrder::Weighted);
    }
}
