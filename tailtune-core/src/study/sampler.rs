//! Parameter samplers.

use crate::error::{Result, TuneError};
use crate::study::space::{ParamSpec, Params, SearchSpace};
use crate::study::trial::Trial;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Draws the next parameter set for a study.
pub trait Sampler: Send {
    fn name(&self) -> &str;

    /// Sample parameters for trial `trial_number`, given every trial recorded
    /// so far. `Ok(None)` means the space is exhausted.
    fn sample(&mut self, space: &SearchSpace, history: &[Trial], trial_number: usize) -> Result<Option<Params>>;
}

const MAX_DUPLICATE_RETRIES: usize = 64;

/// Independent random sampling.
///
/// Each trial draws from its own generator seeded by `(seed, trial_number)`,
/// so a resumed study samples the same parameters for the same trial number.
/// On fully discrete spaces, configurations already in history are
/// re-drawn and the study ends once every configuration has been tried.
#[derive(Debug, Clone)]
pub struct RandomSampler {
    seed: u64,
}

impl RandomSampler {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn rng_for(&self, trial_number: usize) -> ChaCha8Rng {
        let stream = (trial_number as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        ChaCha8Rng::seed_from_u64(self.seed ^ stream)
    }
}

fn draw(spec: &ParamSpec, rng: &mut ChaCha8Rng) -> serde_json::Value {
    match spec {
        ParamSpec::Categorical { choices } => choices[rng.gen_range(0..choices.len())].clone(),
        ParamSpec::Int { low, high, log } => {
            let v = if *log && low < high {
                let lo = (*low as f64).ln();
                let hi = (*high as f64 + 1.0).ln();
                (rng.gen_range(lo..hi).exp().floor() as i64).clamp(*low, *high)
            } else {
                rng.gen_range(*low..=*high)
            };
            serde_json::Value::from(v)
        }
        ParamSpec::Float { low, high, log } => {
            let v = if low == high {
                *low
            } else if *log {
                rng.gen_range(low.ln()..high.ln()).exp().clamp(*low, *high)
            } else {
                rng.gen_range(*low..*high)
            };
            serde_json::Value::from(v)
        }
    }
}

fn seen_configurations(space: &SearchSpace, history: &[Trial]) -> Vec<Params> {
    let mut seen: Vec<Params> = Vec::new();
    for trial in history {
        let projected = space.project(&trial.params);
        if !seen.contains(&projected) {
            seen.push(projected);
        }
    }
    seen
}

impl Sampler for RandomSampler {
    fn name(&self) -> &str {
        "random"
    }

    fn sample(&mut self, space: &SearchSpace, history: &[Trial], trial_number: usize) -> Result<Option<Params>> {
        let mut rng = self.rng_for(trial_number);
        let seen = seen_configurations(space, history);
        if space.grid_size().is_some_and(|n| seen.len() >= n) {
            return Ok(None);
        }

        let mut attempts = 0;
        loop {
            let params: Params = space
                .iter()
                .map(|(name, spec)| (name.to_string(), draw(spec, &mut rng)))
                .collect();
            attempts += 1;
            if attempts >= MAX_DUPLICATE_RETRIES || !seen.contains(&params) {
                return Ok(Some(params));
            }
        }
    }
}

/// Exhaustive enumeration of a discrete space in a fixed order.
///
/// Configurations already present in history are skipped, so a resumed
/// study picks up where it stopped.
#[derive(Debug, Clone, Default)]
pub struct GridSampler;

impl GridSampler {
    pub fn new() -> Self {
        Self
    }

    fn axes(space: &SearchSpace) -> Result<Vec<(&str, &ParamSpec, usize)>> {
        space
            .iter()
            .map(|(name, spec)| match spec.grid_len() {
                Some(len) => Ok((name, spec, len)),
                None if matches!(spec, ParamSpec::Int { .. }) => Err(TuneError::config(format!(
                    "grid sampler cannot enumerate int parameter '{name}': range too wide"
                ))),
                None => Err(TuneError::config(format!(
                    "grid sampler cannot enumerate {} parameter '{name}'",
                    spec.kind()
                ))),
            })
            .collect()
    }

    fn total(axes: &[(&str, &ParamSpec, usize)]) -> Result<usize> {
        axes.iter()
            .try_fold(1usize, |acc, (_, _, len)| acc.checked_mul(*len))
            .ok_or_else(|| TuneError::config("grid sampler: search space has too many configurations"))
    }
}

impl Sampler for GridSampler {
    fn name(&self) -> &str {
        "grid"
    }

    fn sample(&mut self, space: &SearchSpace, history: &[Trial], _trial_number: usize) -> Result<Option<Params>> {
        let axes = Self::axes(space)?;
        let total = Self::total(&axes)?;
        let seen = seen_configurations(space, history);

        for mut index in 0..total {
            // Mixed-radix decode, last axis fastest.
            let mut params = Params::new();
            for (name, spec, len) in axes.iter().rev() {
                let value = spec.grid_value(index % len).ok_or_else(|| {
                    TuneError::config(format!("grid sampler: no value {index} for '{name}'"))
                })?;
                params.insert(name.to_string(), value);
                index /= len;
            }
            if !seen.contains(&params) {
                return Ok(Some(params));
            }
        }
        Ok(None)
    }
}

/// Sampler selection as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SamplerConfig {
    Random {
        #[serde(default = "default_seed")]
        seed: u64,
    },
    Grid,
}

fn default_seed() -> u64 {
    42
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig::Random { seed: default_seed() }
    }
}

impl SamplerConfig {
    pub fn build(&self) -> Box<dyn Sampler> {
        match self {
            SamplerConfig::Random { seed } => Box::new(RandomSampler::new(*seed)),
            SamplerConfig::Grid => Box::new(GridSampler::new()),
        }
    }

    /// Reject spaces this sampler cannot draw from.
    pub fn validate(&self, space: &SearchSpace) -> Result<()> {
        space.validate()?;
        if matches!(self, SamplerConfig::Grid) {
            GridSampler::total(&GridSampler::axes(space)?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mixed_space() -> SearchSpace {
        SearchSpace::new()
            .with("lr", ParamSpec::Float { low: 1e-5, high: 1e-1, log: true })
            .with("batch_size", ParamSpec::Categorical { choices: vec![json!(16), json!(32)] })
            .with("hidden_dim", ParamSpec::Int { low: 8, high: 512, log: true })
            .with("tau", ParamSpec::Float { low: 0.0, high: 1.0, log: false })
    }

    fn trial_with(number: usize, params: Params) -> Trial {
        let mut t = Trial::new(number, params);
        t.complete(0.5);
        t
    }

    #[test]
    fn test_random_sampler_stays_in_support() {
        let space = mixed_space();
        let mut sampler = RandomSampler::new(3);
        for n in 0..50 {
            let params = sampler.sample(&space, &[], n).unwrap().unwrap();
            for (name, spec) in space.iter() {
                assert!(spec.contains(&params[name]), "{name} = {}", params[name]);
            }
        }
    }

    #[test]
    fn test_random_sampler_is_reproducible_per_trial_number() {
        let space = mixed_space();
        let a = RandomSampler::new(11).sample(&space, &[], 4).unwrap();
        let b = RandomSampler::new(11).sample(&space, &[], 4).unwrap();
        let c = RandomSampler::new(11).sample(&space, &[], 5).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_random_sampler_avoids_repeats_and_exhausts() {
        let space = SearchSpace::new()
            .with("model", ParamSpec::Categorical { choices: vec![json!("a"), json!("b")] });
        let mut sampler = RandomSampler::new(0);
        let mut history = Vec::new();
        for n in 0..2 {
            let params = sampler.sample(&space, &history, n).unwrap().unwrap();
            history.push(trial_with(n, params));
        }
        assert_ne!(history[0].params, history[1].params);
        assert_eq!(sampler.sample(&space, &history, 2).unwrap(), None);
    }

    #[test]
    fn test_grid_sampler_enumerates_in_order() {
        let space = SearchSpace::new()
            .with("a", ParamSpec::Categorical { choices: vec![json!("x"), json!("y")] })
            .with("b", ParamSpec::Int { low: 1, high: 2, log: false });
        let mut sampler = GridSampler::new();
        let mut history = Vec::new();
        let mut order = Vec::new();
        while let Some(params) = sampler.sample(&space, &history, history.len()).unwrap() {
            order.push((params["a"].clone(), params["b"].clone()));
            history.push(trial_with(history.len(), params));
        }
        assert_eq!(
            order,
            vec![
                (json!("x"), json!(1)),
                (json!("x"), json!(2)),
                (json!("y"), json!(1)),
                (json!("y"), json!(2)),
            ]
        );
    }

    #[test]
    fn test_grid_sampler_ignores_fixed_params_in_history() {
        let space = SearchSpace::new().with("a", ParamSpec::Int { low: 0, high: 1, log: false });
        let mut params = Params::new();
        params.insert("a".into(), json!(0));
        params.insert("epochs".into(), json!(3));
        let history = vec![trial_with(0, params)];
        let next = GridSampler::new().sample(&space, &history, 1).unwrap().unwrap();
        assert_eq!(next["a"], json!(1));
    }

    #[test]
    fn test_grid_rejects_float_ranges() {
        let err = SamplerConfig::Grid.validate(&mixed_space()).unwrap_err();
        assert!(matches!(err, TuneError::Config(_)));
    }

    #[test]
    fn test_random_sampler_handles_extreme_int_ranges() {
        let space = SearchSpace::new()
            .with("n", ParamSpec::Int { low: 1, high: i64::MAX, log: false })
            .with("m", ParamSpec::Int { low: 1, high: i64::MAX, log: true })
            .with("lr", ParamSpec::Float { low: 0.0, high: 1.0, log: false });
        let mut sampler = RandomSampler::new(5);
        for n in 0..20 {
            let params = sampler.sample(&space, &[], n).unwrap().unwrap();
            for (name, spec) in space.iter() {
                assert!(spec.contains(&params[name]), "{name} = {}", params[name]);
            }
        }
    }

    #[test]
    fn test_grid_walks_wide_int_range_lazily() {
        let space = SearchSpace::new().with("seed", ParamSpec::Int { low: 1, high: i64::MAX, log: false });
        SamplerConfig::Grid.validate(&space).unwrap();
        let params = GridSampler::new().sample(&space, &[], 0).unwrap().unwrap();
        assert_eq!(params["seed"], json!(1));
    }

    #[test]
    fn test_grid_rejects_uncountable_int_ranges() {
        let full = SearchSpace::new().with("n", ParamSpec::Int { low: i64::MIN, high: i64::MAX, log: false });
        assert!(matches!(SamplerConfig::Grid.validate(&full), Err(TuneError::Config(_))));

        let product = SearchSpace::new()
            .with("a", ParamSpec::Int { low: 0, high: i64::MAX, log: false })
            .with("b", ParamSpec::Int { low: 0, high: i64::MAX, log: false });
        assert!(matches!(SamplerConfig::Grid.validate(&product), Err(TuneError::Config(_))));
        assert!(GridSampler::new().sample(&product, &[], 0).is_err());
    }

    #[test]
    fn test_config_parse() {
        let cfg: SamplerConfig = toml::from_str("type = \"random\"\nseed = 7").unwrap();
        assert_eq!(cfg, SamplerConfig::Random { seed: 7 });
        assert!(toml::from_str::<SamplerConfig>("type = \"tpe\"").is_err());
    }
}
