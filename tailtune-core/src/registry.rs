//! Named model constructors.
//!
//! The registry is built once at startup and passed by reference to whatever
//! needs to turn a model name into a model.

use crate::error::{Result, TuneError};
use crate::training::model::{FeatureModel, LinearProbe, MlpProbe};
use std::collections::BTreeMap;
use tracing::debug;

/// Shape information a model constructor receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec {
    pub input_dim: usize,
    pub num_classes: usize,
    pub hidden_dim: usize,
    pub seed: u64,
}

pub type ModelBuilder = fn(&ModelSpec) -> Result<FeatureModel>;

pub struct ComponentRegistry {
    models: BTreeMap<String, ModelBuilder>,
}

impl ComponentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            models: BTreeMap::new(),
        }
    }

    /// A registry holding the built-in probe heads.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.models.insert("linear_probe".into(), |spec| {
            Ok(Box::new(LinearProbe::new(spec.input_dim, spec.num_classes, spec.seed)?))
        });
        registry.models.insert("mlp_probe".into(), |spec| {
            Ok(Box::new(MlpProbe::new(
                spec.input_dim,
                spec.hidden_dim,
                spec.num_classes,
                spec.seed,
            )?))
        });
        registry
    }

    /// Register a model constructor. Names are unique.
    pub fn register(&mut self, name: &str, builder: ModelBuilder) -> Result<()> {
        if self.models.contains_key(name) {
            return Err(TuneError::config(format!("model '{name}' is already registered")));
        }
        debug!(model = name, "registering model");
        self.models.insert(name.to_string(), builder);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn require(&self, name: &str) -> Result<()> {
        if self.contains(name) {
            Ok(())
        } else {
            Err(TuneError::config(format!(
                "unknown model '{name}' (available: {})",
                self.names().collect::<Vec<_>>().join(", ")
            )))
        }
    }

    pub fn build_model(&self, name: &str, spec: &ModelSpec) -> Result<FeatureModel> {
        self.require(name)?;
        let builder = self.models[name];
        builder(spec)
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
