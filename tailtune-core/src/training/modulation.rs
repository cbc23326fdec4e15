//! Epoch-dependent class reweighting for long-tail training.
//!
//! The weight of class `c` blends a uniform weight with its normalized
//! inverse frequency `max(n_c, 1)^-tau`. The blend factor `m(epoch)` ramps
//! from 0 to 1 along a configurable curve, so early epochs train with plain
//! cross-entropy and reweighting only takes full effect later on.

use crate::data::dataset::ClassFrequencyTable;
use crate::error::{Result, TuneError};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

/// Shape of the modulation ramp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModulationCurve {
    Linear,
    #[default]
    Cosine,
    Step,
}

impl ModulationCurve {
    pub const ALL: [ModulationCurve; 3] = [
        ModulationCurve::Linear,
        ModulationCurve::Cosine,
        ModulationCurve::Step,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModulationCurve::Linear => "linear",
            ModulationCurve::Cosine => "cosine",
            ModulationCurve::Step => "step",
        }
    }

    /// Blend factor in `[0, 1]` for `epoch` of a `max_epoch`-long schedule.
    pub fn factor(&self, epoch: usize, max_epoch: usize) -> f64 {
        let t = (epoch as f64 / max_epoch.max(1) as f64).min(1.0);
        match self {
            ModulationCurve::Linear => t,
            ModulationCurve::Cosine => 0.5 * (1.0 - (PI * t).cos()),
            ModulationCurve::Step => {
                if t >= 0.5 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

impl fmt::Display for ModulationCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModulationCurve {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self> {
        ModulationCurve::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| {
                TuneError::config(format!(
                    "unknown modulation curve '{s}' (expected linear, cosine or step)"
                ))
            })
    }
}

/// Per-class weights for one epoch, mean-normalized to 1.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassWeights {
    weights: Vec<f64>,
    unseen: f64,
}

impl ClassWeights {
    /// Uniform weights (all 1.0).
    pub fn uniform(num_classes: usize) -> Self {
        Self {
            weights: vec![1.0; num_classes],
            unseen: 1.0,
        }
    }

    /// Weight for `class_index`.
    ///
    /// Indices outside the table get the weight of a class seen once, the
    /// largest weight the schedule can produce.
    pub fn weight(&self, class_index: usize) -> f64 {
        self.weights.get(class_index).copied().unwrap_or(self.unseen)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.weights
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.weights.is_empty() {
            return 0.0;
        }
        self.weights.iter().sum::<f64>() / self.weights.len() as f64
    }
}

/// Stateless schedule. Epoch and class counts are passed on every call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModulationSchedule {
    pub tau: f64,
    pub max_epoch: usize,
    #[serde(default)]
    pub curve: ModulationCurve,
}

impl ModulationSchedule {
    pub fn new(tau: f64, max_epoch: usize, curve: ModulationCurve) -> Result<Self> {
        if !tau.is_finite() || tau < 0.0 {
            return Err(TuneError::config(format!(
                "tau must be a finite, non-negative number, got {tau}"
            )));
        }
        Ok(Self {
            tau,
            max_epoch,
            curve,
        })
    }

    pub fn factor(&self, epoch: usize) -> f64 {
        self.curve.factor(epoch, self.max_epoch)
    }

    /// Weight vector over `num_classes` classes for `epoch`.
    ///
    /// Classes absent from `counts` are treated as seen once.
    pub fn weights(
        &self,
        counts: &ClassFrequencyTable,
        num_classes: usize,
        epoch: usize,
    ) -> ClassWeights {
        if num_classes == 0 {
            return ClassWeights {
                weights: Vec::new(),
                unseen: 1.0,
            };
        }
        let m = self.factor(epoch);
        let k = num_classes as f64;
        let base: Vec<f64> = (0..num_classes)
            .map(|c| (counts.count(c).max(1) as f64).powf(-self.tau))
            .collect();
        let base_sum: f64 = base.iter().sum();

        let blend = |b: f64| (1.0 - m) / k + m * b / base_sum;
        let blended: Vec<f64> = base.iter().map(|b| blend(*b)).collect();
        let mean = blended.iter().sum::<f64>() / k;

        ClassWeights {
            weights: blended.iter().map(|w| w / mean).collect(),
            unseen: blend(1.0) / mean,
        }
    }
}

/// `weight_vector(class_counts, epoch, max_epoch, tau, curve)`.
///
/// The class count is taken from the table's highest index.
pub fn weight_vector(
    class_counts: &ClassFrequencyTable,
    epoch: usize,
    max_epoch: usize,
    tau: f64,
    curve: ModulationCurve,
) -> Result<ClassWeights> {
    let schedule = ModulationSchedule::new(tau, max_epoch, curve)?;
    Ok(schedule.weights(
        class_counts,
        class_counts.min_num_classes(),
        epoch,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_tail() -> ClassFrequencyTable {
        ClassFrequencyTable::from_counts([(0, 100), (1, 10)])
    }

    #[test]
    fn test_epoch_zero_is_uniform() {
        let w = weight_vector(&long_tail(), 0, 20, 0.5, ModulationCurve::Cosine).unwrap();
        assert!((w.weight(0) - 1.0).abs() < 1e-12);
        assert!((w.weight(1) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_full_modulation_matches_inverse_frequency_ratio() {
        let w = weight_vector(&long_tail(), 20, 20, 0.5, ModulationCurve::Cosine).unwrap();
        assert!(w.weight(1) > w.weight(0));
        let ratio = w.weight(1) / w.weight(0);
        assert!((ratio - 10f64.sqrt()).abs() < 1e-9, "ratio {ratio}");
        assert!((w.mean() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_curves() {
        assert_eq!(ModulationCurve::Linear.factor(5, 10), 0.5);
        assert!((ModulationCurve::Cosine.factor(5, 10) - 0.5).abs() < 1e-12);
        assert_eq!(ModulationCurve::Step.factor(4, 10), 0.0);
        assert_eq!(ModulationCurve::Step.factor(5, 10), 1.0);
        // Past the end of the schedule the factor saturates.
        assert_eq!(ModulationCurve::Linear.factor(30, 10), 1.0);
        // A zero-length schedule does not divide by zero.
        assert_eq!(ModulationCurve::Linear.factor(0, 0), 0.0);
    }

    #[test]
    fn test_zero_count_class_is_floored() {
        let counts = ClassFrequencyTable::from_counts([(0, 50), (2, 5)]);
        let schedule = ModulationSchedule::new(1.0, 10, ModulationCurve::Linear).unwrap();
        let w = schedule.weights(&counts, 3, 10);
        assert!(w.weight(1).is_finite());
        assert!(w.weight(1) > w.weight(2));
        assert!(w.weight(2) > w.weight(0));
    }

    #[test]
    fn test_label_outside_table_gets_floor_weight() {
        let schedule = ModulationSchedule::new(0.5, 10, ModulationCurve::Cosine).unwrap();
        let w = schedule.weights(&long_tail(), 2, 10);
        let unseen = w.weight(7);
        assert!(unseen.is_finite());
        assert!(unseen > w.weight(1));
        assert!(unseen >= w.as_slice().iter().cloned().fold(f64::MIN, f64::max));
    }

    #[test]
    fn test_negative_tau_rejected() {
        let err = ModulationSchedule::new(-0.1, 10, ModulationCurve::Linear).unwrap_err();
        assert!(matches!(err, TuneError::Config(_)));
    }

    #[test]
    fn test_curve_parse() {
        assert_eq!("step".parse::<ModulationCurve>().unwrap(), ModulationCurve::Step);
        assert!("exponential".parse::<ModulationCurve>().is_err());
    }
}
