//! Early stopping.

use crate::training::metrics::Direction;
use serde::{Deserialize, Serialize};

/// Persistable part of an [`EarlyStopMonitor`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EarlyStopState {
    /// Best score on the larger-is-better scale (`-value` when minimizing).
    pub best_score: Option<f64>,
    pub counter: usize,
    pub stopped: bool,
}

/// Signals a stop after `patience` consecutive observations without an
/// improvement larger than `min_delta`.
///
/// Once it has signalled, every later call keeps returning `true`; use a
/// fresh monitor for a new run.
#[derive(Debug, Clone)]
pub struct EarlyStopMonitor {
    patience: usize,
    min_delta: f64,
    direction: Direction,
    state: EarlyStopState,
}

impl EarlyStopMonitor {
    pub fn new(patience: usize, min_delta: f64, direction: Direction) -> Self {
        Self {
            patience,
            min_delta: min_delta.max(0.0),
            direction,
            state: EarlyStopState::default(),
        }
    }

    /// Continue from a previously saved state.
    pub fn restore(mut self, state: EarlyStopState) -> Self {
        self.state = state;
        self
    }

    pub fn state(&self) -> EarlyStopState {
        self.state
    }

    pub fn counter(&self) -> usize {
        self.state.counter
    }

    pub fn should_stop(&self) -> bool {
        self.state.stopped
    }

    /// Best observed value in the metric's own units.
    pub fn best_value(&self) -> Option<f64> {
        self.state.best_score.map(|s| self.direction.score(s))
    }

    /// Feed one epoch's metric. NaN counts as no improvement.
    pub fn observe(&mut self, value: f64) -> bool {
        if self.state.stopped {
            return true;
        }
        let score = self.direction.score(value);
        let improved = match self.state.best_score {
            None => !score.is_nan(),
            Some(best) => score > best + self.min_delta,
        };
        if improved {
            self.state.best_score = Some(score);
            self.state.counter = 0;
        } else {
            self.state.counter += 1;
            if self.state.counter >= self.patience {
                self.state.stopped = true;
            }
        }
        self.state.stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_early_stopping_min_mode() {
        let mut es = EarlyStopMonitor::new(3, 0.01, Direction::Minimize);
        assert!(!es.observe(0.5)); // sets best
        assert!(!es.observe(0.4)); // improves
        assert!(!es.observe(0.4)); // counter 1
        assert!(!es.observe(0.395)); // below min_delta, counter 2
        assert!(es.observe(0.4)); // counter 3 >= patience
        assert_eq!(es.best_value(), Some(0.4));
    }

    #[test]
    fn test_early_stopping_max_mode_resets_counter() {
        let mut es = EarlyStopMonitor::new(2, 0.0, Direction::Maximize);
        assert!(!es.observe(0.5));
        assert!(!es.observe(0.4));
        assert!(!es.observe(0.6));
        assert_eq!(es.counter(), 0);
        assert!(!es.observe(0.6));
        assert!(es.observe(0.1));
    }

    #[test]
    fn test_stop_is_permanent() {
        let mut es = EarlyStopMonitor::new(1, 0.0, Direction::Maximize);
        es.observe(0.5);
        assert!(es.observe(0.5));
        assert!(es.observe(0.99));
        assert!(es.observe(1.0));
        assert!(es.should_stop());
    }

    #[test]
    fn test_nan_is_not_an_improvement() {
        let mut es = EarlyStopMonitor::new(2, 0.0, Direction::Maximize);
        assert!(!es.observe(f64::NAN));
        assert_eq!(es.best_value(), None);
        assert!(es.observe(f64::NAN));
    }

    #[test]
    fn test_restore_keeps_counter_and_best() {
        let mut es = EarlyStopMonitor::new(3, 0.0, Direction::Maximize);
        es.observe(0.8);
        es.observe(0.7);
        let state = es.state();

        let mut resumed = EarlyStopMonitor::new(3, 0.0, Direction::Maximize).restore(state);
        assert_eq!(resumed.counter(), 1);
        assert!(!resumed.observe(0.75));
        assert!(resumed.observe(0.79));
    }
}
