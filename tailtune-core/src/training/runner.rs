//! The resumable epoch loop.
//!
//! Epochs are numbered from 1. A run that saved epoch `n` resumes at
//! `n + 1` with its best metric, optimizer, scheduler and early-stop state
//! restored. The loss sees the zero-based progress index `epoch - 1`.

use crate::data::dataset::SplitDataset;
use crate::data::loader::{BatchSource, InMemoryLoader, SampleOrder};
use crate::error::{Result, TuneError};
use crate::training::callbacks::EarlyStopMonitor;
use crate::training::checkpoint::{CheckpointStore, EpochState};
use crate::training::loss::ClassificationLoss;
use crate::training::metrics::{EpochMetrics, MonitoredMetric, RunningAverage, TrainingHistory};
use crate::training::model::Model;
use crate::training::optim::{LrScheduler, Optimizer};
use crate::tracking::{ExperimentSink, RunId};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Receives per-epoch intermediate values from inside a trial.
///
/// The run only reports; it never sees or touches the trial's parameters.
pub trait TrialReporter {
    fn report(&mut self, step: usize, value: f64) -> Result<()>;

    fn should_prune(&self) -> Result<bool>;
}

/// Loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub max_epochs: usize,
    pub batch_size: usize,
    pub patience: usize,
    pub min_delta: f64,
    pub monitor: MonitoredMetric,
    pub sample_order: SampleOrder,
    pub seed: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_epochs: 50,
            batch_size: 32,
            patience: 10,
            min_delta: 0.0,
            monitor: MonitoredMetric::ValAcc,
            sample_order: SampleOrder::Shuffled,
            seed: 42,
        }
    }
}

/// Terminal record of a run.
///
/// `best_metric` is `None` when no epoch produced a usable monitored value,
/// which is distinct from a genuine score of 0.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub best_metric: Option<f64>,
    pub best_epoch: Option<usize>,
    pub start_epoch: usize,
    pub last_epoch: Option<usize>,
    pub stopped_early: bool,
    pub monitor: MonitoredMetric,
    pub history: TrainingHistory,
}

/// One training run over a split dataset.
pub struct TrainingRun<'a, I> {
    config: RunConfig,
    model: Box<dyn Model<Input = I> + 'a>,
    optimizer: Box<dyn Optimizer>,
    scheduler: Box<dyn LrScheduler>,
    loss: ClassificationLoss,
    checkpoints: Option<CheckpointStore>,
    sink: Option<(&'a dyn ExperimentSink, RunId)>,
    reporter: Option<&'a mut dyn TrialReporter>,
}

impl<'a, I: Clone> TrainingRun<'a, I> {
    pub fn new(
        config: RunConfig,
        model: Box<dyn Model<Input = I> + 'a>,
        optimizer: Box<dyn Optimizer>,
        scheduler: Box<dyn LrScheduler>,
        loss: ClassificationLoss,
    ) -> Result<Self> {
        if config.max_epochs == 0 {
            return Err(TuneError::config("max_epochs must be at least 1"));
        }
        if config.batch_size == 0 {
            return Err(TuneError::config("batch_size must be at least 1"));
        }
        Ok(Self {
            config,
            model,
            optimizer,
            scheduler,
            loss,
            checkpoints: None,
            sink: None,
            reporter: None,
        })
    }

    pub fn with_checkpoints(mut self, store: CheckpointStore) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn with_sink(mut self, sink: &'a dyn ExperimentSink, run: RunId) -> Self {
        self.sink = Some((sink, run));
        self
    }

    pub fn with_reporter(mut self, reporter: &'a mut dyn TrialReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn model(&self) -> &dyn Model<Input = I> {
        self.model.as_ref()
    }

    /// Execute the loop until `max_epochs`, early stop, or pruning.
    ///
    /// Pruning surfaces as [`TuneError::Pruned`]; any data or numerical
    /// failure propagates unchanged.
    pub fn run(&mut self, data: &SplitDataset<I>) -> Result<RunResult> {
        let direction = self.config.monitor.direction();
        let mut monitor = EarlyStopMonitor::new(self.config.patience, self.config.min_delta, direction);
        let mut history = TrainingHistory::default();
        let mut start_epoch = 1;

        if let Some(store) = self.checkpoints.as_mut() {
            if let Some(checkpoint) = store.load_last()? {
                self.model.load_state_dict(&checkpoint.model_state)?;
                self.optimizer.load_state_dict(&checkpoint.optimizer_state)?;
                self.scheduler.load_state_dict(&checkpoint.scheduler_state)?;
                monitor = monitor.restore(checkpoint.early_stop);
                history.best_metric = checkpoint.best_metric;
                history.best_epoch = checkpoint.best_epoch;
                start_epoch = checkpoint.epoch + 1;
                tracing::info!(
                    start_epoch,
                    best_metric = ?checkpoint.best_metric,
                    dir = %store.dir().display(),
                    "resuming from checkpoint"
                );
            }
        }

        if data.val.is_empty()
            && matches!(self.config.monitor, MonitoredMetric::ValAcc | MonitoredMetric::ValLoss)
        {
            tracing::warn!(
                monitor = %self.config.monitor,
                "validation partition is empty; no epoch can improve the monitored metric"
            );
        }

        let train_loader = InMemoryLoader::new(&data.train, self.config.batch_size)?.with_order(
            self.config.sample_order,
            &data.class_counts,
            self.config.seed,
        );
        let val_loader = InMemoryLoader::new(&data.val, self.config.batch_size)?;

        let mut stopped_early = monitor.should_stop();
        let mut last_epoch = None;

        for epoch in start_epoch..=self.config.max_epochs {
            if stopped_early {
                break;
            }
            let started = Instant::now();
            let progress = epoch - 1;

            // 1. train
            self.model.set_training(true);
            let mut train = RunningAverage::default();
            for batch in train_loader.batches(epoch) {
                let batch = batch?;
                self.model.zero_grad();
                let logits = self.model.forward(&batch.inputs)?;
                let out = self.loss.compute(&logits, &batch.labels, &data.class_counts, progress)?;
                if !out.loss.is_finite() {
                    return Err(TuneError::numerical(format!(
                        "non-finite training loss {} at epoch {epoch}",
                        out.loss
                    )));
                }
                self.model.backward(&out.grad)?;
                self.optimizer.step(&mut self.model.parameters_mut())?;
                train.update(out.loss, out.correct, batch.len());
            }

            // 2. validate
            self.model.set_training(false);
            let mut val = RunningAverage::default();
            for batch in val_loader.batches(epoch) {
                let batch = batch?;
                let logits = self.model.forward(&batch.inputs)?;
                let out = self.loss.compute(&logits, &batch.labels, &data.class_counts, progress)?;
                val.update(out.loss, out.correct, batch.len());
            }
            if val.seen() > 0 && !val.loss().is_finite() {
                return Err(TuneError::numerical(format!(
                    "non-finite validation loss at epoch {epoch}"
                )));
            }

            // 3. learning-rate schedule
            let lr = self.optimizer.lr();
            self.scheduler.step(self.optimizer.as_mut());

            let metrics = EpochMetrics {
                epoch,
                train_loss: train.loss(),
                train_acc: train.accuracy(),
                val_loss: (val.seen() > 0).then(|| val.loss()),
                val_acc: (val.seen() > 0).then(|| val.accuracy()),
                lr,
                duration_secs: started.elapsed().as_secs_f64(),
            };
            let value = self.config.monitor.value(&metrics);

            // 4. trial report and pruning
            if let (Some(reporter), Some(v)) = (self.reporter.as_deref_mut(), value) {
                reporter.report(epoch, v)?;
                if reporter.should_prune()? {
                    tracing::info!(epoch, value = v, "trial pruned");
                    return Err(TuneError::Pruned { step: epoch, value: v });
                }
            }

            // 5. metrics
            tracing::info!(
                epoch,
                max_epochs = self.config.max_epochs,
                train_loss = metrics.train_loss,
                train_acc = metrics.train_acc,
                val_loss = ?metrics.val_loss,
                val_acc = ?metrics.val_acc,
                lr,
                "epoch complete"
            );
            if let Some((sink, run)) = &self.sink {
                sink.log_metrics(run, &metrics.to_map(), Some(epoch))?;
            }
            let improved = history.record_epoch(metrics, value, direction);

            // 6. checkpoint
            stopped_early = monitor.observe(value.unwrap_or(f64::NAN));
            if let Some(store) = self.checkpoints.as_mut() {
                store.save(EpochState {
                    epoch,
                    model_state: self.model.state_dict(),
                    optimizer_state: self.optimizer.state_dict(),
                    scheduler_state: self.scheduler.state_dict(),
                    metric_value: value,
                    early_stop: monitor.state(),
                })?;
            }
            last_epoch = Some(epoch);

            // 7. early stop
            if stopped_early {
                tracing::info!(
                    epoch,
                    patience = self.config.patience,
                    improved,
                    "early stopping triggered"
                );
            }
        }

        Ok(RunResult {
            best_metric: history.best_metric,
            best_epoch: history.best_epoch,
            start_epoch,
            last_epoch,
            stopped_early,
            monitor: self.config.monitor,
            history,
        })
    }
}
