//! Error types for the tailtune-core crate.

use thiserror::Error;

/// Top-level error type for the experiment control plane.
#[derive(Debug, Error)]
pub enum TuneError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Numerical error: {0}")]
    Numerical(String),

    #[error("Resume mismatch: {0}")]
    ResumeMismatch(String),

    /// Control-flow signal raised by a training run when the pruning policy
    /// asks the trial to stop. Not a failure.
    #[error("Trial pruned at step {step} (value {value})")]
    Pruned { step: usize, value: f64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl TuneError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    pub fn numerical(msg: impl Into<String>) -> Self {
        Self::Numerical(msg.into())
    }

    pub fn resume_mismatch(msg: impl Into<String>) -> Self {
        Self::ResumeMismatch(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether this error is the pruning signal rather than a genuine failure.
    pub fn is_pruned(&self) -> bool {
        matches!(self, Self::Pruned { .. })
    }
}

pub type Result<T, E = TuneError> = std::result::Result<T, E>;
