//! Pruning policies.
//!
//! A pruner compares the running trial's best intermediate value against
//! completed prior trials at the same step. Trials still in flight are
//! never part of the comparison.

use crate::error::{Result, TuneError};
use crate::study::trial::{Trial, TrialState};
use crate::training::metrics::Direction;
use serde::{Deserialize, Serialize};

pub trait Pruner: Send + Sync {
    fn name(&self) -> &str;

    /// Whether `trial` should stop at its latest reported step.
    fn should_prune(&self, trial: &Trial, history: &[Trial], direction: Direction) -> bool;
}

/// Never prunes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopPruner;

impl Pruner for NopPruner {
    fn name(&self) -> &str {
        "nop"
    }

    fn should_prune(&self, _trial: &Trial, _history: &[Trial], _direction: Direction) -> bool {
        false
    }
}

/// Prunes when the trial's best value so far falls outside the given
/// percentile of completed trials at the same step.
///
/// For maximization a trial is pruned when it is below the
/// `(100 - percentile)`-th value, for minimization when it is above the
/// `percentile`-th value. The median pruner is the 50th percentile.
#[derive(Debug, Clone, PartialEq)]
pub struct PercentilePruner {
    percentile: f64,
    n_startup_trials: usize,
    n_warmup_steps: usize,
    interval_steps: usize,
    name: &'static str,
}

impl PercentilePruner {
    pub fn new(
        percentile: f64,
        n_startup_trials: usize,
        n_warmup_steps: usize,
        interval_steps: usize,
    ) -> Result<Self> {
        if !(0.0..=100.0).contains(&percentile) {
            return Err(TuneError::config(format!(
                "percentile must be in [0, 100], got {percentile}"
            )));
        }
        if interval_steps == 0 {
            return Err(TuneError::config("interval_steps must be at least 1"));
        }
        Ok(Self {
            percentile,
            n_startup_trials,
            n_warmup_steps,
            interval_steps,
            name: "percentile",
        })
    }

    pub fn median(n_startup_trials: usize, n_warmup_steps: usize) -> Self {
        Self {
            percentile: 50.0,
            n_startup_trials,
            n_warmup_steps,
            interval_steps: 1,
            name: "median",
        }
    }
}

impl Pruner for PercentilePruner {
    fn name(&self) -> &str {
        self.name
    }

    fn should_prune(&self, trial: &Trial, history: &[Trial], direction: Direction) -> bool {
        let Some(last) = trial.last_report() else {
            return false;
        };
        let step = last.step;
        if step < self.n_warmup_steps {
            return false;
        }
        if (step - self.n_warmup_steps) % self.interval_steps != 0 {
            return false;
        }

        let completed: Vec<&Trial> = history
            .iter()
            .filter(|t| t.state == TrialState::Complete)
            .collect();
        if completed.len() < self.n_startup_trials {
            return false;
        }

        let Some(best) = trial.best_intermediate(direction) else {
            return false;
        };
        if best.is_nan() {
            return true;
        }

        let peers: Vec<f64> = completed
            .iter()
            .filter_map(|t| t.report_at(step))
            .filter(|v| !v.is_nan())
            .collect();
        if peers.is_empty() {
            return false;
        }

        match direction {
            Direction::Maximize => best < percentile(&peers, 100.0 - self.percentile),
            Direction::Minimize => best > percentile(&peers, self.percentile),
        }
    }
}

/// Linear-interpolated percentile, `q` in `[0, 100]`. `values` must be non-empty.
pub fn percentile(values: &[f64], q: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = (q / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Pruner selection as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PrunerConfig {
    Nop,
    Median {
        #[serde(default = "default_startup")]
        n_startup_trials: usize,
        #[serde(default = "default_warmup")]
        n_warmup_steps: usize,
    },
    Percentile {
        #[serde(default = "default_percentile")]
        percentile: f64,
        #[serde(default = "default_startup")]
        n_startup_trials: usize,
        #[serde(default)]
        n_warmup_steps: usize,
        #[serde(default = "default_interval")]
        interval_steps: usize,
    },
}

fn default_startup() -> usize {
    5
}
fn default_warmup() -> usize {
    10
}
fn default_percentile() -> f64 {
    25.0
}
fn default_interval() -> usize {
    1
}

impl Default for PrunerConfig {
    fn default() -> Self {
        PrunerConfig::Median {
            n_startup_trials: default_startup(),
            n_warmup_steps: default_warmup(),
        }
    }
}

impl PrunerConfig {
    pub fn build(&self) -> Result<Box<dyn Pruner>> {
        Ok(match self {
            PrunerConfig::Nop => Box::new(NopPruner),
            PrunerConfig::Median {
                n_startup_trials,
                n_warmup_steps,
            } => Box::new(PercentilePruner::median(*n_startup_trials, *n_warmup_steps)),
            PrunerConfig::Percentile {
                percentile,
                n_startup_trials,
                n_warmup_steps,
                interval_steps,
            } => Box::new(PercentilePruner::new(
                *percentile,
                *n_startup_trials,
                *n_warmup_steps,
                *interval_steps,
            )?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::study::space::Params;

    fn completed(number: usize, reports: &[f64]) -> Trial {
        let mut t = Trial::new(number, Params::new());
        for (i, v) in reports.iter().enumerate() {
            t.push_report(i + 1, *v);
        }
        t.complete(*reports.last().unwrap());
        t
    }

    fn running(reports: &[f64]) -> Trial {
        let mut t = Trial::new(99, Params::new());
        for (i, v) in reports.iter().enumerate() {
            t.push_report(i + 1, *v);
        }
        t
    }

    fn history() -> Vec<Trial> {
        vec![
            completed(0, &[0.5, 0.6, 0.7]),
            completed(1, &[0.6, 0.7, 0.8]),
            completed(2, &[0.7, 0.8, 0.9]),
        ]
    }

    #[test]
    fn test_median_prunes_below_median() {
        let pruner = PercentilePruner::median(1, 0);
        let h = history();
        assert!(pruner.should_prune(&running(&[0.3, 0.4]), &h, Direction::Maximize));
        assert!(!pruner.should_prune(&running(&[0.3, 0.75]), &h, Direction::Maximize));
    }

    #[test]
    fn test_uses_best_value_so_far() {
        let pruner = PercentilePruner::median(1, 0);
        // 0.65 at step 2 is below the median 0.7, but the best so far is 0.9.
        assert!(!pruner.should_prune(&running(&[0.9, 0.65]), &history(), Direction::Maximize));
    }

    #[test]
    fn test_minimize_direction() {
        let pruner = PercentilePruner::median(1, 0);
        let h = history();
        assert!(pruner.should_prune(&running(&[0.9]), &h, Direction::Minimize));
        assert!(!pruner.should_prune(&running(&[0.5]), &h, Direction::Minimize));
    }

    #[test]
    fn test_warmup_and_startup() {
        let h = history();
        let warm = PercentilePruner::median(1, 3);
        assert!(!warm.should_prune(&running(&[0.1, 0.1]), &h, Direction::Maximize));
        assert!(warm.should_prune(&running(&[0.1, 0.1, 0.1]), &h, Direction::Maximize));

        let startup = PercentilePruner::median(5, 0);
        assert!(!startup.should_prune(&running(&[0.0]), &h, Direction::Maximize));
    }

    #[test]
    fn test_only_completed_trials_count() {
        let mut h = history();
        for t in &mut h {
            t.prune();
        }
        let pruner = PercentilePruner::median(0, 0);
        assert!(!pruner.should_prune(&running(&[0.0]), &h, Direction::Maximize));
    }

    #[test]
    fn test_nan_is_pruned() {
        let pruner = PercentilePruner::median(1, 0);
        assert!(pruner.should_prune(&running(&[f64::NAN]), &history(), Direction::Maximize));
    }

    #[test]
    fn test_percentile_pruner_is_stricter_at_low_percentile() {
        let h = history();
        // Maximize with percentile 25 compares against the 75th percentile.
        let strict = PercentilePruner::new(25.0, 1, 0, 1).unwrap();
        assert!(strict.should_prune(&running(&[0.62]), &h, Direction::Maximize));
        let lenient = PercentilePruner::new(90.0, 1, 0, 1).unwrap();
        assert!(!lenient.should_prune(&running(&[0.62]), &h, Direction::Maximize));
    }

    #[test]
    fn test_percentile_interpolation() {
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0], 50.0), 2.5);
        assert_eq!(percentile(&[5.0], 10.0), 5.0);
    }

    #[test]
    fn test_config_build() {
        assert_eq!(PrunerConfig::default().build().unwrap().name(), "median");
        let bad = PrunerConfig::Percentile {
            percentile: 120.0,
            n_startup_trials: 0,
            n_warmup_steps: 0,
            interval_steps: 1,
        };
        assert!(bad.build().is_err());
        assert!(toml::from_str::<PrunerConfig>("type = \"hyperband\"").is_err());
    }
}
