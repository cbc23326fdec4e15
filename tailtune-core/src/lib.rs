//! # tailtune-core: experiment control plane for long-tail classification
//!
//! Decides which hyperparameter configurations to try, runs each as a
//! resumable training run, stops unpromising runs early, and keeps
//! train/validation/test partitions free of group leakage.
//!
//! ## Components
//!
//! 1. **Splitting**: group-aware, deterministic train/val/test assignment
//! 2. **Modulation**: epoch-dependent blend of uniform and inverse-frequency class weights
//! 3. **Training**: checkpointed epoch loop with early stopping
//! 4. **Studies**: sampling, pruning and persistent trial history

// Foundation
pub mod config;
pub mod error;
pub mod persistence;
pub mod registry;

// Data
pub mod data;

// Training
pub mod training;

// Tracking & studies
pub mod study;
pub mod tracking;

// Wiring
pub mod pipeline;

// Re-exports
pub use config::{TailtuneConfig, load_config};
pub use error::{Result, TuneError};
pub use pipeline::{TrainingPlan, run_trial};
pub use registry::ComponentRegistry;
pub use study::{StudyRecord, TrialScheduler, TrialState};
pub use training::{Direction, TrainingRun};
