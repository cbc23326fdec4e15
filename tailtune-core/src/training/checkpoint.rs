//! Resumable checkpoint records: `last` and `best` per training run.

use crate::error::{Result, TuneError};
use crate::persistence;
use crate::training::callbacks::EarlyStopState;
use crate::training::metrics::Direction;
use crate::training::model::StateDict;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

pub const LAST_FILE: &str = "last.json";
pub const BEST_FILE: &str = "best.json";

/// A persisted training state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    pub epoch: usize,
    pub model_state: StateDict,
    pub optimizer_state: StateDict,
    pub scheduler_state: StateDict,
    pub metric_value: Option<f64>,
    /// Best monitored value up to and including this epoch.
    pub best_metric: Option<f64>,
    pub best_epoch: Option<usize>,
    pub is_best: bool,
    #[serde(default)]
    pub early_stop: EarlyStopState,
    /// Hash of parameter names and shapes of the model that wrote it.
    pub architecture: String,
    /// Hash of the configuration that owns this run, if any.
    #[serde(default)]
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// What the training loop hands over at the end of an epoch.
#[derive(Debug, Clone)]
pub struct EpochState {
    pub epoch: usize,
    pub model_state: StateDict,
    pub optimizer_state: StateDict,
    pub scheduler_state: StateDict,
    pub metric_value: Option<f64>,
    pub early_stop: EarlyStopState,
}

/// SHA-256 of the canonical JSON form of `value`.
///
/// Map-typed values must have ordered keys for the hash to be stable.
pub fn fingerprint<T: Serialize>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Checkpoint directory of one run.
///
/// `last` is rewritten every epoch; `best` only on strict improvement in
/// the configured direction.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    direction: Direction,
    architecture: String,
    owner: Option<String>,
    best: Option<(f64, usize)>,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, direction: Direction, architecture: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            direction,
            architecture: architecture.into(),
            owner: None,
            best: None,
        }
    }

    /// Tag every record with `owner` and refuse to resume from records
    /// written by a different owner.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn last_path(&self) -> PathBuf {
        self.dir.join(LAST_FILE)
    }

    pub fn best_path(&self) -> PathBuf {
        self.dir.join(BEST_FILE)
    }

    /// Best metric and epoch known to this store.
    pub fn best(&self) -> Option<(f64, usize)> {
        self.best
    }

    /// Write `last`, and `best` when the metric improves. Returns the record.
    pub fn save(&mut self, state: EpochState) -> Result<Checkpoint> {
        let is_best = match (state.metric_value, self.best) {
            (Some(v), _) if v.is_nan() => false,
            (Some(_), None) => true,
            (Some(v), Some((best, _))) => self.direction.is_better(v, best),
            (None, _) => false,
        };
        if is_best {
            if let Some(v) = state.metric_value {
                self.best = Some((v, state.epoch));
            }
        }

        let checkpoint = Checkpoint {
            format_version: CHECKPOINT_FORMAT_VERSION,
            epoch: state.epoch,
            model_state: state.model_state,
            optimizer_state: state.optimizer_state,
            scheduler_state: state.scheduler_state,
            metric_value: state.metric_value,
            best_metric: self.best.map(|(v, _)| v),
            best_epoch: self.best.map(|(_, e)| e),
            is_best,
            early_stop: state.early_stop,
            architecture: self.architecture.clone(),
            owner: self.owner.clone(),
            created_at: Utc::now(),
        };

        persistence::atomic_write_json(&self.last_path(), &checkpoint)?;
        if is_best {
            persistence::atomic_write_json(&self.best_path(), &checkpoint)?;
        }
        tracing::debug!(
            epoch = checkpoint.epoch,
            is_best,
            dir = %self.dir.display(),
            "checkpoint saved"
        );
        Ok(checkpoint)
    }

    /// The resume point, validated against this store's architecture and
    /// owner. Restores the store's notion of best.
    pub fn load_last(&mut self) -> Result<Option<Checkpoint>> {
        let Some(checkpoint) = self.load_checked(&self.last_path())? else {
            return Ok(None);
        };
        self.best = checkpoint.best_metric.zip(checkpoint.best_epoch);
        Ok(Some(checkpoint))
    }

    pub fn load_best(&self) -> Result<Option<Checkpoint>> {
        self.load_checked(&self.best_path())
    }

    fn load_checked(&self, path: &Path) -> Result<Option<Checkpoint>> {
        let Some(checkpoint) = persistence::load_json::<Checkpoint>(path)? else {
            return Ok(None);
        };
        if checkpoint.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(TuneError::resume_mismatch(format!(
                "{} has format version {}, expected {CHECKPOINT_FORMAT_VERSION}",
                path.display(),
                checkpoint.format_version
            )));
        }
        if checkpoint.architecture != self.architecture {
            return Err(TuneError::resume_mismatch(format!(
                "{} was written by a model with a different architecture",
                path.display()
            )));
        }
        if let (Some(expected), Some(found)) = (&self.owner, &checkpoint.owner) {
            if expected != found {
                return Err(TuneError::resume_mismatch(format!(
                    "{} belongs to a different configuration",
                    path.display()
                )));
            }
        }
        Ok(Some(checkpoint))
    }
}
