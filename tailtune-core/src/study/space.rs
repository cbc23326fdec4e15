//! Hyperparameter search spaces.

use crate::error::{Result, TuneError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One trial's parameter values, keyed by name.
pub type Params = BTreeMap<String, serde_json::Value>;

/// Distribution of a single hyperparameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamSpec {
    Categorical {
        choices: Vec<serde_json::Value>,
    },
    Int {
        low: i64,
        high: i64,
        #[serde(default)]
        log: bool,
    },
    Float {
        low: f64,
        high: f64,
        #[serde(default)]
        log: bool,
    },
}

impl ParamSpec {
    pub fn validate(&self, name: &str) -> Result<()> {
        match self {
            ParamSpec::Categorical { choices } => {
                if choices.is_empty() {
                    return Err(TuneError::config(format!(
                        "search space '{name}': categorical needs at least one choice"
                    )));
                }
            }
            ParamSpec::Int { low, high, log } => {
                if low > high {
                    return Err(TuneError::config(format!(
                        "search space '{name}': low {low} > high {high}"
                    )));
                }
                if *log && *low < 1 {
                    return Err(TuneError::config(format!(
                        "search space '{name}': log-scale int range must start at 1 or above"
                    )));
                }
            }
            ParamSpec::Float { low, high, log } => {
                if !(low.is_finite() && high.is_finite()) || low > high {
                    return Err(TuneError::config(format!(
                        "search space '{name}': invalid float range [{low}, {high}]"
                    )));
                }
                if *log && *low <= 0.0 {
                    return Err(TuneError::config(format!(
                        "search space '{name}': log-scale float range must be positive"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Whether `value` lies in this distribution's support.
    pub fn contains(&self, value: &serde_json::Value) -> bool {
        match self {
            ParamSpec::Categorical { choices } => choices.contains(value),
            ParamSpec::Int { low, high, .. } => value
                .as_i64()
                .is_some_and(|v| (*low..=*high).contains(&v)),
            ParamSpec::Float { low, high, .. } => value
                .as_f64()
                .is_some_and(|v| v >= *low && v <= *high),
        }
    }

    /// Number of values of a discrete distribution. `None` for float ranges
    /// and for int ranges too wide to count in a `usize`.
    pub fn grid_len(&self) -> Option<usize> {
        match self {
            ParamSpec::Categorical { choices } => Some(choices.len()),
            ParamSpec::Int { low, high, .. } => {
                usize::try_from(i128::from(*high) - i128::from(*low) + 1).ok()
            }
            ParamSpec::Float { .. } => None,
        }
    }

    /// The `index`-th value in enumeration order, without materializing the
    /// others.
    pub fn grid_value(&self, index: usize) -> Option<serde_json::Value> {
        match self {
            ParamSpec::Categorical { choices } => choices.get(index).cloned(),
            ParamSpec::Int { low, high, .. } => {
                let v = i128::from(*low) + i128::try_from(index).ok()?;
                if v > i128::from(*high) {
                    return None;
                }
                i64::try_from(v).ok().map(serde_json::Value::from)
            }
            ParamSpec::Float { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ParamSpec::Categorical { .. } => "categorical",
            ParamSpec::Int { .. } => "int",
            ParamSpec::Float { .. } => "float",
        }
    }
}

/// Named parameter distributions. Iteration order is the name order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchSpace {
    params: BTreeMap<String, ParamSpec>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, spec: ParamSpec) -> Self {
        self.params.insert(name.to_string(), spec);
        self
    }

    pub fn insert(&mut self, name: &str, spec: ParamSpec) {
        self.params.insert(name.to_string(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&ParamSpec> {
        self.params.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamSpec)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        for (name, spec) in &self.params {
            spec.validate(name)?;
        }
        Ok(())
    }

    /// Number of distinct configurations. `None` if any range is continuous
    /// or the count overflows.
    pub fn grid_size(&self) -> Option<usize> {
        self.params.values().try_fold(1usize, |acc, spec| {
            acc.checked_mul(spec.grid_len()?)
        })
    }

    /// The restriction of `params` to this space's names.
    pub fn project(&self, params: &Params) -> Params {
        params
            .iter()
            .filter(|(k, _)| self.params.contains_key(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Fixed values overlaid by sampled ones.
pub fn merge_params(fixed: &Params, sampled: &Params) -> Params {
    let mut merged = fixed.clone();
    merged.extend(sampled.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}
