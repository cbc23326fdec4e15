//! Epoch metrics, optimization direction, and run history.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Whether larger or smaller metric values are better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    #[serde(alias = "max")]
    Maximize,
    #[serde(alias = "min")]
    Minimize,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Maximize => "maximize",
            Direction::Minimize => "minimize",
        }
    }

    /// Map a value onto a scale where larger is always better.
    pub fn score(&self, value: f64) -> f64 {
        match self {
            Direction::Maximize => value,
            Direction::Minimize => -value,
        }
    }

    /// Strict improvement of `candidate` over `best`. NaN never improves.
    pub fn is_better(&self, candidate: f64, best: f64) -> bool {
        self.score(candidate) > self.score(best)
    }

    /// Pick the better of two optional values.
    pub fn best_of(&self, a: Option<f64>, b: Option<f64>) -> Option<f64> {
        match (a, b) {
            (Some(x), Some(y)) => Some(if self.is_better(y, x) { y } else { x }),
            (x, None) => x,
            (None, y) => y,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which epoch metric drives checkpoint selection, early stopping and
/// trial reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitoredMetric {
    #[default]
    ValAcc,
    ValLoss,
    TrainAcc,
    TrainLoss,
}

impl MonitoredMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitoredMetric::ValAcc => "val_acc",
            MonitoredMetric::ValLoss => "val_loss",
            MonitoredMetric::TrainAcc => "train_acc",
            MonitoredMetric::TrainLoss => "train_loss",
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            MonitoredMetric::ValAcc | MonitoredMetric::TrainAcc => Direction::Maximize,
            MonitoredMetric::ValLoss | MonitoredMetric::TrainLoss => Direction::Minimize,
        }
    }

    /// `None` when the metric was not measured (e.g. empty validation set).
    pub fn value(&self, metrics: &EpochMetrics) -> Option<f64> {
        match self {
            MonitoredMetric::ValAcc => metrics.val_acc,
            MonitoredMetric::ValLoss => metrics.val_loss,
            MonitoredMetric::TrainAcc => Some(metrics.train_acc),
            MonitoredMetric::TrainLoss => Some(metrics.train_loss),
        }
    }
}

impl fmt::Display for MonitoredMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metrics of one completed epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_acc: f64,
    pub val_loss: Option<f64>,
    pub val_acc: Option<f64>,
    pub lr: f64,
    pub duration_secs: f64,
}

impl EpochMetrics {
    /// Flat name → value view for experiment sinks.
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        let mut map = BTreeMap::new();
        map.insert("train_loss".to_string(), self.train_loss);
        map.insert("train_acc".to_string(), self.train_acc);
        if let Some(v) = self.val_loss {
            map.insert("val_loss".to_string(), v);
        }
        if let Some(v) = self.val_acc {
            map.insert("val_acc".to_string(), v);
        }
        map.insert("lr".to_string(), self.lr);
        map.insert("epoch_time_secs".to_string(), self.duration_secs);
        map
    }
}

/// Running mean of loss and accuracy over batches.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningAverage {
    loss_sum: f64,
    correct: usize,
    seen: usize,
}

impl RunningAverage {
    /// `batch_loss` is the batch mean; it is weighted by `batch_size`.
    pub fn update(&mut self, batch_loss: f64, correct: usize, batch_size: usize) {
        self.loss_sum += batch_loss * batch_size as f64;
        self.correct += correct;
        self.seen += batch_size;
    }

    pub fn seen(&self) -> usize {
        self.seen
    }

    pub fn loss(&self) -> f64 {
        if self.seen == 0 {
            0.0
        } else {
            self.loss_sum / self.seen as f64
        }
    }

    pub fn accuracy(&self) -> f64 {
        if self.seen == 0 {
            0.0
        } else {
            self.correct as f64 / self.seen as f64
        }
    }
}

/// Epoch-by-epoch history of one training run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochMetrics>,
    pub best_epoch: Option<usize>,
    pub best_metric: Option<f64>,
    pub total_training_time_secs: f64,
}

impl TrainingHistory {
    /// Record an epoch; returns whether `metric` improved on the best so far.
    pub fn record_epoch(
        &mut self,
        metrics: EpochMetrics,
        metric: Option<f64>,
        direction: Direction,
    ) -> bool {
        self.total_training_time_secs += metrics.duration_secs;
        let epoch = metrics.epoch;
        self.epochs.push(metrics);

        let Some(value) = metric.filter(|v| !v.is_nan()) else {
            return false;
        };
        let improved = match self.best_metric {
            None => true,
            Some(best) => direction.is_better(value, best),
        };
        if improved {
            self.best_metric = Some(value);
            self.best_epoch = Some(epoch);
        }
        improved
    }

    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }
}
