//! Study analysis: outcome counts, best trials, exportable best parameters.

use crate::error::{Result, TuneError};
use crate::study::space::Params;
use crate::study::storage::StudyRecord;
use crate::study::trial::{Trial, TrialState};
use crate::training::metrics::Direction;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
pub struct TrialRow {
    pub number: usize,
    pub state: TrialState,
    pub value: Option<f64>,
    pub error: Option<String>,
    pub params: Params,
}

impl From<&Trial> for TrialRow {
    fn from(t: &Trial) -> Self {
        Self {
            number: t.number,
            state: t.state,
            value: t.display_value(),
            error: t.error.clone(),
            params: t.params.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StudySummary {
    pub name: String,
    pub direction: Direction,
    pub counts: BTreeMap<TrialState, usize>,
    pub best: Option<TrialRow>,
    pub trials: Vec<TrialRow>,
}

impl StudySummary {
    pub fn new(study: &StudyRecord) -> Self {
        let counts = TrialState::ALL
            .into_iter()
            .map(|s| (s, study.count(s)))
            .collect();
        Self {
            name: study.name.clone(),
            direction: study.direction,
            counts,
            best: study.best_trial().map(TrialRow::from),
            trials: study.trials.iter().map(TrialRow::from).collect(),
        }
    }

    pub fn count(&self, state: TrialState) -> usize {
        self.counts.get(&state).copied().unwrap_or(0)
    }
}

/// Best completed trial for each value of `param`, keyed by the value's
/// JSON text. Trials without the parameter are skipped.
pub fn best_by_param<'a>(study: &'a StudyRecord, param: &str) -> BTreeMap<String, &'a Trial> {
    let mut best: BTreeMap<String, &Trial> = BTreeMap::new();
    for trial in study.trials.iter().filter(|t| t.state == TrialState::Complete) {
        let (Some(value), Some(key)) = (trial.final_value, trial.params.get(param)) else {
            continue;
        };
        let key = match key {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let replace = match best.get(&key).and_then(|t| t.final_value) {
            Some(current) => study.direction.is_better(value, current),
            None => true,
        };
        if replace {
            best.insert(key, trial);
        }
    }
    best
}

/// The best trial's parameters as a TOML document.
pub fn export_best_params(study: &StudyRecord) -> Result<String> {
    let best = study
        .best_trial()
        .ok_or_else(|| TuneError::not_found(format!("study '{}' has no completed trial", study.name)))?;
    let params: BTreeMap<&String, &serde_json::Value> =
        best.params.iter().filter(|(_, v)| !v.is_null()).collect();
    toml::to_string(&params).map_err(|e| TuneError::invalid_input(format!("cannot export parameters: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::study::pruner::PrunerConfig;
    use crate::study::sampler::SamplerConfig;
    use serde_json::json;

    fn trial(number: usize, model: &str, lr: f64, value: Option<f64>) -> Trial {
        let mut params = Params::new();
        params.insert("model".into(), json!(model));
        params.insert("lr".into(), json!(lr));
        let mut t = Trial::new(number, params);
        match value {
            Some(v) => t.complete(v),
            None => t.fail("crashed"),
        }
        t
    }

    fn study() -> StudyRecord {
        let mut s = StudyRecord::new("s", Direction::Maximize, SamplerConfig::default(), PrunerConfig::Nop);
        s.trials = vec![
            trial(0, "linear_probe", 0.1, Some(0.6)),
            trial(1, "mlp_probe", 0.01, Some(0.8)),
            trial(2, "linear_probe", 0.001, Some(0.7)),
            trial(3, "mlp_probe", 0.5, None),
        ];
        s
    }

    #[test]
    fn test_summary_counts_and_best() {
        let summary = StudySummary::new(&study());
        assert_eq!(summary.count(TrialState::Complete), 3);
        assert_eq!(summary.count(TrialState::Failed), 1);
        assert_eq!(summary.count(TrialState::Pruned), 0);
        assert_eq!(summary.best.as_ref().map(|b| b.number), Some(1));
        assert_eq!(summary.trials[3].error.as_deref(), Some("crashed"));
    }

    #[test]
    fn test_best_by_categorical_value() {
        let study = study();
        let best = best_by_param(&study, "model");
        assert_eq!(best["linear_probe"].number, 2);
        assert_eq!(best["mlp_probe"].number, 1);
        assert!(best_by_param(&study, "missing").is_empty());
    }

    #[test]
    fn test_export_best_as_toml() {
        let toml_text = export_best_params(&study()).unwrap();
        let parsed: toml::Table = toml::from_str(&toml_text).unwrap();
        assert_eq!(parsed["model"].as_str(), Some("mlp_probe"));
        assert_eq!(parsed["lr"].as_float(), Some(0.01));

        let empty = StudyRecord::new("e", Direction::Minimize, SamplerConfig::default(), PrunerConfig::Nop);
        assert!(matches!(export_best_params(&empty), Err(TuneError::NotFound(_))));
    }
}
