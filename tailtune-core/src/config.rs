//! Configuration for tailtune.
//!
//! Uses `figment` for layered configuration: user config -> workspace config
//! -> explicit file -> environment, with defaults filled in by serde. Every
//! section is typed; [`TailtuneConfig::validate`] runs once at startup so a
//! malformed study fails before its first trial.

use crate::data::split::SplitRatios;
use crate::error::{Result, TuneError};
use crate::pipeline;
use crate::registry::ComponentRegistry;
use crate::study::pruner::PrunerConfig;
use crate::study::sampler::SamplerConfig;
use crate::study::space::{Params, SearchSpace};
use crate::study::storage::{StorageConfig, validate_study_name};
use crate::training::loss::LossConfig;
use crate::training::metrics::{Direction, MonitoredMetric};
use crate::training::optim::{OptimizerConfig, SchedulerConfig};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the workspace-level config file.
pub const WORKSPACE_CONFIG: &str = "tailtune.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TailtuneConfig {
    pub paths: PathsConfig,
    pub split: SplitConfig,
    pub training: TrainingConfig,
    pub study: StudyConfig,
}

/// Filesystem locations. Relative paths resolve against the workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// JSONL sample manifest.
    pub manifest: PathBuf,
    /// Root for run checkpoints, tracking data, studies and logs.
    pub runs_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            manifest: PathBuf::from("data/manifest.jsonl"),
            runs_dir: PathBuf::from("runs"),
        }
    }
}

impl PathsConfig {
    pub fn resolve(&self, workspace: &Path) -> Self {
        let join = |p: &PathBuf| {
            if p.is_absolute() {
                p.clone()
            } else {
                workspace.join(p)
            }
        };
        Self {
            manifest: join(&self.manifest),
            runs_dir: join(&self.runs_dir),
        }
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.runs_dir.join("checkpoints")
    }

    pub fn tracking_dir(&self) -> PathBuf {
        self.runs_dir.join("tracking")
    }

    pub fn studies_dir(&self) -> PathBuf {
        self.runs_dir.join("studies")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.runs_dir.join("logs")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    pub ratios: SplitRatios,
    /// Metadata key samples are grouped by; `None` splits per sample.
    pub group_by: Option<String>,
    pub seed: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            ratios: SplitRatios::default(),
            group_by: Some("camera_id".into()),
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub model: String,
    /// Hidden width of `mlp_probe`.
    pub hidden_dim: usize,
    pub epochs: usize,
    pub batch_size: usize,
    pub patience: usize,
    pub min_delta: f64,
    pub monitor: MonitoredMetric,
    /// Draw training batches with inverse class-frequency weights.
    pub weighted_sampler: bool,
    pub seed: u64,
    pub optimizer: OptimizerConfig,
    pub scheduler: SchedulerConfig,
    pub loss: LossConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            model: "linear_probe".into(),
            hidden_dim: 128,
            epochs: 50,
            batch_size: 32,
            patience: 10,
            min_delta: 0.0,
            monitor: MonitoredMetric::ValAcc,
            weighted_sampler: false,
            seed: 42,
            optimizer: OptimizerConfig::default(),
            scheduler: SchedulerConfig::default(),
            loss: LossConfig::default(),
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self, registry: &ComponentRegistry) -> Result<()> {
        registry.require(&self.model)?;
        if self.epochs == 0 {
            return Err(TuneError::config("training.epochs must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(TuneError::config("training.batch_size must be at least 1"));
        }
        if self.hidden_dim == 0 {
            return Err(TuneError::config("training.hidden_dim must be at least 1"));
        }
        if !(self.min_delta.is_finite() && self.min_delta >= 0.0) {
            return Err(TuneError::config("training.min_delta must be non-negative"));
        }
        self.optimizer.validate()?;
        self.scheduler.validate()?;
        self.loss.build(self.epochs)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudyConfig {
    pub name: String,
    pub n_trials: usize,
    /// Wall-clock budget in seconds.
    pub timeout_secs: Option<u64>,
    pub direction: Direction,
    pub storage: StorageConfig,
    pub sampler: SamplerConfig,
    pub pruner: PrunerConfig,
    pub search_space: SearchSpace,
    /// Values applied to every trial underneath the sampled ones.
    pub fixed: Params,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            name: "tailtune".into(),
            n_trials: 20,
            timeout_secs: None,
            direction: Direction::Maximize,
            storage: StorageConfig::default(),
            sampler: SamplerConfig::default(),
            pruner: PrunerConfig::default(),
            search_space: SearchSpace::default(),
            fixed: Params::new(),
        }
    }
}

impl StudyConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn validate(&self, registry: &ComponentRegistry, training: &TrainingConfig) -> Result<()> {
        validate_study_name(&self.name).map_err(|e| TuneError::config(e.to_string()))?;
        if self.n_trials == 0 {
            return Err(TuneError::config("study.n_trials must be at least 1"));
        }
        self.sampler.validate(&self.search_space)?;
        self.pruner.build()?;
        pipeline::validate_space(&self.search_space, registry)?;
        pipeline::validate_fixed(&self.fixed, registry, training)
    }
}

impl TailtuneConfig {
    /// Check every section. Unknown model names and search-space keys are
    /// rejected here rather than mid-study.
    pub fn validate(&self, registry: &ComponentRegistry) -> Result<()> {
        self.split.ratios.validate()?;
        self.training.validate(registry)?;
        self.study.validate(registry, &self.training)
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (`TAILTUNE_TRAINING__EPOCHS`, ...)
/// 2. Explicit config file
/// 3. Workspace config (`<workspace>/tailtune.toml`)
/// 4. User config (`~/.config/tailtune/config.toml`)
/// 5. Built-in defaults
pub fn load_config(workspace: Option<&Path>, explicit: Option<&Path>) -> Result<TailtuneConfig> {
    // Missing fields take their serde defaults. Layering serialized defaults
    // underneath would blend the fields of two differently tagged variants.
    let mut figment = Figment::new();

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(WORKSPACE_CONFIG);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(TuneError::config(format!("config file {} not found", path.display())));
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("TAILTUNE_").split("__"));

    figment
        .extract()
        .map_err(|e| TuneError::config(e.to_string()))
}

/// `~/.config/tailtune/config.toml` or the platform equivalent.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "tailtune", "tailtune")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::study::space::ParamSpec;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn load_from(text: &str) -> Result<TailtuneConfig> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, text).unwrap();
        load_config(None, Some(&path))
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = TailtuneConfig::default();
        config.validate(&ComponentRegistry::default()).unwrap();
        assert_eq!(config.training.loss, LossConfig::default());
        assert_eq!(config.split.group_by.as_deref(), Some("camera_id"));
    }

    #[test]
    fn test_file_layer_overrides_defaults() {
        let config = load_from(
            r#"
            [training]
            model = "mlp_probe"
            epochs = 7
            optimizer = { type = "sgd", lr = 0.05 }
            loss = { type = "smooth_modulation", tau = 1.0, modulation_type = "linear" }

            [study]
            name = "probe-search"
            n_trials = 4
            pruner = { type = "percentile", percentile = 30.0 }

            [study.search_space]
            lr = { type = "float", low = 1e-4, high = 1e-1, log = true }
            model = { type = "categorical", choices = ["linear_probe", "mlp_probe"] }
            "#,
        )
        .unwrap();
        assert_eq!(config.training.model, "mlp_probe");
        assert_eq!(config.training.epochs, 7);
        assert_eq!(config.training.optimizer.name(), "sgd");
        assert_eq!(config.training.batch_size, 32);
        assert_eq!(config.study.search_space.len(), 2);
        config.validate(&ComponentRegistry::default()).unwrap();
    }

    #[test]
    fn test_unknown_curve_rejected_at_load() {
        let err = load_from("[training]\nloss = { type = \"smooth_modulation\", curve = \"exponential\" }")
            .unwrap_err();
        assert!(matches!(err, TuneError::Config(_)));
    }

    #[test]
    fn test_unknown_model_rejected_at_validation() {
        let mut config = TailtuneConfig::default();
        config.training.model = "vit_huge".into();
        assert!(config.validate(&ComponentRegistry::default()).is_err());
    }

    #[test]
    fn test_unknown_search_space_key_rejected() {
        let mut config = TailtuneConfig::default();
        config.study.search_space.insert(
            "dropout_rate",
            ParamSpec::Float {
                low: 0.0,
                high: 0.5,
                log: false,
            },
        );
        let err = config.validate(&ComponentRegistry::default()).unwrap_err();
        assert!(err.to_string().contains("dropout_rate"));
    }

    #[test]
    fn test_missing_explicit_file() {
        assert!(load_config(None, Some(Path::new("/nonexistent/tailtune.toml"))).is_err());
    }

    #[test]
    fn test_paths_resolve_against_workspace() {
        let paths = PathsConfig::default().resolve(Path::new("/work"));
        assert_eq!(paths.manifest, PathBuf::from("/work/data/manifest.jsonl"));
        assert_eq!(paths.studies_dir(), PathBuf::from("/work/runs/studies"));
    }
}
