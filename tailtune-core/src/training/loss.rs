//! Classification losses.
//!
//! The loss receives the epoch and the training class counts explicitly on
//! every call; nothing about training progress is cached inside it.

use crate::data::dataset::ClassFrequencyTable;
use crate::error::{Result, TuneError};
use crate::training::model::Logits;
use crate::training::modulation::{ClassWeights, ModulationCurve, ModulationSchedule};
use serde::{Deserialize, Serialize};

/// How per-sample losses are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    #[default]
    Mean,
    Sum,
}

/// Loss selection as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LossConfig {
    CrossEntropy {
        #[serde(default)]
        reduction: Reduction,
    },
    SmoothModulation {
        #[serde(default = "default_tau")]
        tau: f64,
        #[serde(default, alias = "modulation_type")]
        curve: ModulationCurve,
        #[serde(default)]
        reduction: Reduction,
    },
}

fn default_tau() -> f64 {
    0.5
}

impl Default for LossConfig {
    fn default() -> Self {
        LossConfig::SmoothModulation {
            tau: default_tau(),
            curve: ModulationCurve::Cosine,
            reduction: Reduction::Mean,
        }
    }
}

impl LossConfig {
    pub fn name(&self) -> &'static str {
        match self {
            LossConfig::CrossEntropy { .. } => "cross_entropy",
            LossConfig::SmoothModulation { .. } => "smooth_modulation",
        }
    }

    /// Build the loss for a run of `max_epoch` epochs.
    pub fn build(&self, max_epoch: usize) -> Result<ClassificationLoss> {
        Ok(match self {
            LossConfig::CrossEntropy { reduction } => ClassificationLoss {
                schedule: None,
                reduction: *reduction,
            },
            LossConfig::SmoothModulation {
                tau,
                curve,
                reduction,
            } => ClassificationLoss {
                schedule: Some(ModulationSchedule::new(*tau, max_epoch, *curve)?),
                reduction: *reduction,
            },
        })
    }
}

/// Value, logit gradient and correct-prediction count for one batch.
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: f64,
    pub grad: Logits,
    pub correct: usize,
}

/// Cross-entropy with optional epoch-modulated class weights.
#[derive(Debug, Clone)]
pub struct ClassificationLoss {
    schedule: Option<ModulationSchedule>,
    reduction: Reduction,
}

impl ClassificationLoss {
    pub fn cross_entropy() -> Self {
        Self {
            schedule: None,
            reduction: Reduction::Mean,
        }
    }

    pub fn smooth_modulation(schedule: ModulationSchedule) -> Self {
        Self {
            schedule: Some(schedule),
            reduction: Reduction::Mean,
        }
    }

    pub fn schedule(&self) -> Option<&ModulationSchedule> {
        self.schedule.as_ref()
    }

    /// Class weights in effect at `epoch`.
    pub fn class_weights(
        &self,
        counts: &ClassFrequencyTable,
        num_classes: usize,
        epoch: usize,
    ) -> ClassWeights {
        match &self.schedule {
            Some(schedule) => schedule.weights(counts, num_classes, epoch),
            None => ClassWeights::uniform(num_classes),
        }
    }

    pub fn compute(
        &self,
        logits: &Logits,
        labels: &[usize],
        counts: &ClassFrequencyTable,
        epoch: usize,
    ) -> Result<LossOutput> {
        let weights = self.class_weights(counts, logits.num_classes, epoch);
        weighted_cross_entropy(logits, labels, &weights, self.reduction)
    }
}

/// Per-sample `w[y] * CE(logits, y)`, reduced; also returns `dL/dlogits`.
pub fn weighted_cross_entropy(
    logits: &Logits,
    labels: &[usize],
    weights: &ClassWeights,
    reduction: Reduction,
) -> Result<LossOutput> {
    if labels.len() != logits.batch {
        return Err(TuneError::training(format!(
            "{} labels for a batch of {} logits",
            labels.len(),
            logits.batch
        )));
    }
    let mut grad = Logits::zeros(logits.batch, logits.num_classes);
    if logits.batch == 0 {
        return Ok(LossOutput {
            loss: 0.0,
            grad,
            correct: 0,
        });
    }
    let scale = match reduction {
        Reduction::Mean => 1.0 / logits.batch as f64,
        Reduction::Sum => 1.0,
    };

    let mut total = 0.0;
    let mut correct = 0;
    for (i, &label) in labels.iter().enumerate() {
        if label >= logits.num_classes {
            return Err(TuneError::dataset(format!(
                "label {label} out of range for {} classes",
                logits.num_classes
            )));
        }
        let row = logits.row(i);
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
        let exps: Vec<f64> = row.iter().map(|v| (*v as f64 - max).exp()).collect();
        let sum: f64 = exps.iter().sum();
        let log_prob = (row[label] as f64 - max) - sum.ln();
        let w = weights.weight(label);
        total += -w * log_prob;

        if logits.argmax(i) == label {
            correct += 1;
        }
        for (j, g) in grad.row_mut(i).iter_mut().enumerate() {
            let p = exps[j] / sum;
            let target = if j == label { 1.0 } else { 0.0 };
            *g = (w * (p - target) * scale) as f32;
        }
    }

    Ok(LossOutput {
        loss: total * scale,
        grad,
        correct,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logits(values: Vec<f32>, num_classes: usize) -> Logits {
        Logits {
            batch: values.len() / num_classes,
            num_classes,
            values,
        }
    }

    #[test]
    fn test_uniform_logits_give_log_k() {
        let out = ClassificationLoss::cross_entropy()
            .compute(
                &logits(vec![0.0; 6], 3),
                &[0, 2],
                &ClassFrequencyTable::default(),
                0,
            )
            .unwrap();
        assert!((out.loss - 3f64.ln()).abs() < 1e-9);
        // Softmax gradient rows sum to zero.
        for i in 0..2 {
            assert!(out.grad.row(i).iter().sum::<f32>().abs() < 1e-6);
        }
    }

    #[test]
    fn test_modulated_loss_upweights_rare_class_late() {
        let counts = ClassFrequencyTable::from_counts([(0, 100), (1, 10)]);
        let loss = LossConfig::default().build(10).unwrap();
        let batch = logits(vec![0.0, 0.0], 2);

        let early = loss.compute(&batch, &[1], &counts, 0).unwrap().loss;
        let late = loss.compute(&batch, &[1], &counts, 10).unwrap().loss;
        assert!(late > early);
    }

    #[test]
    fn test_label_missing_from_counts_does_not_crash() {
        let counts = ClassFrequencyTable::from_counts([(0, 100)]);
        let loss = LossConfig::default().build(4).unwrap();
        let out = loss
            .compute(&logits(vec![1.0, 0.0, 0.0], 3), &[2], &counts, 4)
            .unwrap();
        assert!(out.loss.is_finite());
    }

    #[test]
    fn test_out_of_range_label_is_dataset_error() {
        let err = ClassificationLoss::cross_entropy()
            .compute(
                &logits(vec![0.0, 0.0], 2),
                &[5],
                &ClassFrequencyTable::default(),
                0,
            )
            .unwrap_err();
        assert!(matches!(err, TuneError::Dataset(_)));
    }

    #[test]
    fn test_counts_correct_predictions() {
        let out = ClassificationLoss::cross_entropy()
            .compute(
                &logits(vec![2.0, 0.0, 0.0, 2.0], 2),
                &[0, 0],
                &ClassFrequencyTable::default(),
                0,
            )
            .unwrap();
        assert_eq!(out.correct, 1);
    }

    #[test]
    fn test_config_accepts_modulation_type_alias() {
        let cfg: LossConfig =
            toml::from_str("type = \"smooth_modulation\"\ntau = 1.0\nmodulation_type = \"step\"")
                .unwrap();
        assert_eq!(
            cfg,
            LossConfig::SmoothModulation {
                tau: 1.0,
                curve: ModulationCurve::Step,
                reduction: Reduction::Mean,
            }
        );
        assert!(toml::from_str::<LossConfig>("type = \"focal\"").is_err());
    }
}
